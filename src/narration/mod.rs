//! Deciding when a chat message gets narrated.

pub mod dispatcher;
pub mod listener;
pub mod observer;
pub mod source;
pub mod timer;

pub use dispatcher::{NarrationDispatcher, Speaker};
pub use listener::NarrationListener;
pub use source::{MessageEvent, MessageId, Origin, RenderedMessages};
