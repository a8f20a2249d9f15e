//! Cancellable delayed task with replace-on-arm semantics.

use std::time::Duration;

use tokio::task::JoinHandle;

/// At most one pending firing. Arming again aborts the previous one.
#[derive(Default)]
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` after `delay`, replacing whatever was pending.
    ///
    /// `fire` is synchronous: once the delay elapses it runs to completion
    /// and cannot be aborted halfway. Long work should be spawned from it.
    pub fn arm<F>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
