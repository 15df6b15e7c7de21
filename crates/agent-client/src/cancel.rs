use tokio::sync::watch;

/// Cooperative cancellation flag shared between a caller and an invocation.
///
/// Clones observe the same flag. Once cancelled, a token stays cancelled.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Requests cancellation.
    ///
    /// In-flight requests are aborted; local tool handlers already running are
    /// left to finish, but nothing they produce is emitted.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
