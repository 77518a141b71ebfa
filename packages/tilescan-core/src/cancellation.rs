use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken as SignalToken;
use uuid::Uuid;

use crate::error::PipelineError;

/// Handle for one run; clones share the same cancellation state.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    pub id: String,
    signal: SignalToken,
}

impl CancellationToken {
    pub fn new(id: String) -> Self {
        Self {
            id,
            signal: SignalToken::new(),
        }
    }

    /// Token with a fresh random run id.
    pub fn for_new_run() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn cancel(&self) {
        self.signal.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn throw_if_cancelled(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }
}

/// Keeps the live token per key (one per session); creating a new token for
/// a key cancels the previous one.
#[derive(Clone, Default)]
pub struct CancellationManager {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_token(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::for_new_run();
        if let Some(existing) = self.tokens.lock().insert(key.to_string(), token.clone()) {
            existing.cancel();
        }
        token
    }

    pub fn cancel_token(&self, key: &str) {
        if let Some(token) = self.tokens.lock().get(key) {
            token.cancel();
        }
    }

    pub fn get_token(&self, key: &str) -> Option<CancellationToken> {
        self.tokens.lock().get(key).cloned()
    }

    pub fn cleanup_token(&self, key: &str) {
        self.tokens.lock().remove(key);
    }
}
