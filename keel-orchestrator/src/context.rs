//! Per-operation context
//!
//! Every externally initiated operation (a trigger or an ingested event)
//! carries a context with a correlation id for logs and a cancellation token.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub correlation_id: Uuid,
    cancel: CancellationToken,
}

impl TriggerContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context bound to an existing cancellation token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            cancel,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for TriggerContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_through_child_token() {
        let parent = CancellationToken::new();
        let ctx = TriggerContext::with_token(parent.child_token());
        assert!(!ctx.is_cancelled());

        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_contexts_get_distinct_ids() {
        assert_ne!(
            TriggerContext::new().correlation_id,
            TriggerContext::new().correlation_id
        );
    }
}
