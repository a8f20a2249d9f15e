//! tavern-narrator: automatic TTS narration for tavern-style chat.

mod api;
mod config;
mod extract;
mod narration;
mod notifier;
mod settings;
mod speech;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::extract::{extract, Markers};
use crate::narration::NarrationListener;
use crate::notifier::Notifier;
use crate::settings::SettingsStore;
use crate::speech::{NarrationHistory, Narrator, SpeakOptions, VoiceUpload, PRESET_VOICES};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "tavern-narrator", about = "Automatic TTS narration for chat messages")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for chat messages and narrate them (default)
    Serve,

    /// Synthesize text once
    Speak {
        text: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        speed: Option<f32>,
        #[arg(long)]
        gain: Option<f32>,
        /// Save the audio instead of playing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show what would be narrated for a message
    Extract {
        #[arg(long, default_value = "")]
        start: String,
        #[arg(long, default_value = "")]
        end: String,
        text: String,
    },

    /// Check the API key and URL against the voice list endpoint
    TestConnection,

    /// Manage voices
    Voices {
        #[command(subcommand)]
        action: VoicesAction,
    },

    /// Inspect or change stored settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Print the narration report for a day (default: today)
    Report {
        date: Option<String>,
        /// List the days that have narration history instead
        #[arg(long)]
        list: bool,
    },
}

#[derive(Subcommand, Debug)]
enum VoicesAction {
    /// Preset and cached custom voices
    List,
    /// Fetch custom voices from the API
    Refresh,
    /// Clone a voice from a reference clip
    Upload {
        #[arg(long)]
        name: String,
        /// Transcript of the reference clip
        #[arg(long)]
        text: String,
        file: PathBuf,
    },
    /// Delete a custom voice by URI
    Delete { uri: String },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    /// Merge a JSON object, e.g. '{"ttsVoice":"anna"}'
    Set { patch: String },
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info,symphonia=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn,symphonia=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(args.config.as_deref());
    let settings_path = config
        .settings
        .path
        .clone()
        .unwrap_or_else(SettingsStore::default_path);
    let settings = SettingsStore::open(&settings_path);

    let history = if config.history.enabled {
        NarrationHistory::default_dir().map(NarrationHistory::new)
    } else {
        None
    };
    let narrator = Arc::new(Narrator::new(
        settings.clone(),
        Notifier::new(config.feedback.notifications),
        history.clone(),
    ));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, settings, narrator).await,
        Command::Speak {
            text,
            voice,
            speed,
            gain,
            output,
        } => {
            let options = SpeakOptions {
                voice,
                speed,
                gain,
                auto_play: Some(output.is_none()),
            };
            let speech = narrator
                .speak(&text, &options)
                .await
                .ok_or("speech synthesis failed")?;
            if let Some(path) = output {
                std::fs::write(&path, &speech.audio)?;
                println!(
                    "Wrote {} bytes of {} ({}) to {}",
                    speech.audio.len(),
                    speech.format,
                    speech.voice,
                    path.display()
                );
            } else if !speech.played {
                return Err("playback failed".into());
            }
            Ok(())
        }
        Command::Extract { start, end, text } => {
            let extraction = extract(&text, &Markers::new(start, end));
            println!("mode: {}", extraction.mode);
            if let Some(text) = extraction.text {
                println!("{text}");
            }
            Ok(())
        }
        Command::TestConnection => {
            if narrator.test_connection().await {
                println!("OK");
                Ok(())
            } else {
                Err("connection test failed".into())
            }
        }
        Command::Voices { action } => voices(action, &settings, &narrator).await,
        Command::Settings { action } => {
            let updated = match action {
                SettingsAction::Show => settings.get(),
                SettingsAction::Set { patch } => settings.update(serde_json::from_str(&patch)?)?,
                SettingsAction::Reset => settings.reset()?,
            };
            println!("{}", serde_json::to_string_pretty(&updated.redacted())?);
            Ok(())
        }
        Command::Report { date, list } => {
            let history = history.ok_or("narration history is disabled")?;
            if list {
                for date in history.list_dates() {
                    println!("{date}");
                }
                return Ok(());
            }
            let date = date.unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
            println!("{}", history.report(&date));
            Ok(())
        }
    }
}

async fn serve(config: Config, settings: SettingsStore, narrator: Arc<Narrator>) -> Result<()> {
    info!("tavern-narrator starting");

    settings.on_change(|s| {
        info!(
            "Settings updated (voice={}, autoPlay={}, autoPlayUser={}, markers={:?}/{:?})",
            s.tts_voice, s.auto_play, s.auto_play_user, s.text_start, s.text_end
        );
    });

    // Best effort; narration works without the custom voice list.
    narrator.refresh_custom_voices().await;

    let listener = NarrationListener::start(&config, settings, narrator).await;
    info!("Ready, listening via {}", listener.strategy());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    listener.stop().await;
    Ok(())
}

async fn voices(action: VoicesAction, settings: &SettingsStore, narrator: &Narrator) -> Result<()> {
    match action {
        VoicesAction::List => {
            let current = settings.get();
            println!("Preset voices ({}):", current.tts_model);
            for (id, name) in PRESET_VOICES {
                let marker = if *id == current.tts_voice { "*" } else { " " };
                println!(" {marker} {id:<10} {name}");
            }
            if !current.custom_voices.is_empty() {
                println!("Custom voices:");
                for voice in &current.custom_voices {
                    let marker = if voice.uri == current.tts_voice { "*" } else { " " };
                    println!(" {marker} {:<10} {}", voice.custom_name, voice.uri);
                }
            }
        }
        VoicesAction::Refresh => {
            let voices = narrator.refresh_custom_voices().await;
            println!("{} custom voices", voices.len());
        }
        VoicesAction::Upload { name, text, file } => {
            let upload = VoiceUpload::from_file(&name, &text, &file)?;
            if !narrator.upload_voice(&upload).await {
                return Err("voice upload failed".into());
            }
        }
        VoicesAction::Delete { uri } => {
            if !narrator.delete_voice(&uri).await {
                return Err("voice deletion failed".into());
            }
        }
    }
    Ok(())
}
