// src/utils/cancel.rs
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::MatchError;

/// Cooperative cancellation shared by every task of a run.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called. Pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|flag| *flag).await.is_err() {
            // sender gone, nobody can cancel anymore
            std::future::pending::<()>().await;
        }
    }

    /// `Err(Cancelled)` when the run has been cancelled.
    pub fn check(&self, at: &str) -> Result<(), MatchError> {
        if self.is_cancelled() {
            Err(MatchError::Cancelled(format!("cancelled during {}", at)))
        } else {
            Ok(())
        }
    }
}
