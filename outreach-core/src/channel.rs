use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Channel, Contact};

/// Result of one external send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn delivered(external_id: impl Into<String>) -> Self {
        SendOutcome {
            success: true,
            external_id: Some(external_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        SendOutcome {
            success: false,
            external_id: None,
            error: Some(error.into()),
        }
    }
}

/// External send boundary. Implementations may fail either by returning `Err`
/// or by reporting `success: false`; the dispatcher treats both the same.
///
/// The pipeline calls `send` at most once per message per dispatcher pass and
/// does not deduplicate. `idempotency_key` is the message id, for backends
/// that can deduplicate on their side.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn send(
        &self,
        contact: &Contact,
        content: &str,
        channel: Channel,
        idempotency_key: &str,
    ) -> anyhow::Result<SendOutcome>;
}
