//! Cooperative cancellation handle for job closures. No thread is ever
//! killed; a job closure periodically polls `is_canceled()` at safe
//! points between actions, between retries, and around I/O waits, and
//! exits cleanly when it observes cancellation.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn canceled(&self) {
        self.token.cancelled().await;
    }
}
