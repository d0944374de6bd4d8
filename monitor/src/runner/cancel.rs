//! Cancellation callback registration

use tokio_util::sync::{CancellationToken, DropGuard};

/// One on-cancel action attached to a cancellation token.
///
/// The action runs on its own task, so the canceller never waits on it. It
/// runs at most once, and never after the registration was dropped.
pub struct CancelRegistration {
    _done: DropGuard,
}

impl CancelRegistration {
    /// Run `on_cancel` when `token` is cancelled, unless unregistered first
    pub fn register<F>(token: &CancellationToken, on_cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let done = CancellationToken::new();
        let unregistered = done.clone();
        let token = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = unregistered.cancelled() => {}
                _ = token.cancelled() => on_cancel(),
            }
        });

        Self {
            _done: done.drop_guard(),
        }
    }

    /// Detach the action
    pub fn unregister(self) {}
}
