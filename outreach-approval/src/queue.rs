//! Trainer-facing queue actions: approve, bulk approve, edit and cancel
//! auto-approval.
//!
//! Every action re-reads the message and writes with a status precondition.
//! Compliance denials come back as [`QueueError`] values, never as panics or
//! partial writes.

use chrono::{DateTime, Utc};
use outreach_core::compliance::evaluate;
use outreach_core::types::validate_content;
use outreach_core::{
    CapLimit, Decision, Denial, Message, MessageStatus, MessageUpdate, NewTrainerEdit,
    OutreachContext, QueueError, TransitionError, ValidationError,
};
use serde::{Deserialize, Serialize};
use tracing;
use uuid::Uuid;

pub const MAX_BULK_APPROVE: usize = 100;

/// A successful approval. `deferred` is set when quiet hours pushed
/// `scheduled_for` to the next window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub message_id: Uuid,
    pub status: MessageStatus,
    pub scheduled_for: DateTime<Utc>,
    pub deferred: bool,
}

/// Structured denial as returned to API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<CapLimit>,
}

impl From<&QueueError> for ErrorBody {
    fn from(err: &QueueError) -> Self {
        let limit = match err {
            QueueError::FrequencyCap { limit, .. } => Some(*limit),
            _ => None,
        };
        // storage details stay in the logs
        let message = match err {
            QueueError::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            error: err.code().to_string(),
            message,
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkApprovalResult {
    pub message_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<ErrorBody>,
}

pub struct QueueService {
    ctx: OutreachContext,
}

impl QueueService {
    pub fn new(ctx: OutreachContext) -> Self {
        Self { ctx }
    }

    /// Loads a message the trainer owns. Someone else's message is reported
    /// as missing.
    async fn owned_message(&self, trainer_id: Uuid, message_id: Uuid) -> Result<Message, QueueError> {
        match self.ctx.store.message(message_id).await? {
            Some(message) if message.trainer_id == trainer_id => Ok(message),
            _ => Err(QueueError::NotFound(message_id)),
        }
    }

    pub async fn approve(
        &self,
        trainer_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Approval, QueueError> {
        let message = self.owned_message(trainer_id, message_id).await?;

        // a queued message is already approved; approving again must not re-transition
        if !matches!(message.status, MessageStatus::Draft | MessageStatus::Blocked) {
            return Err(TransitionError {
                from: message.status,
                to: MessageStatus::Queued,
            }
            .into());
        }

        let contact = self
            .ctx
            .store
            .contact(message.contact_id)
            .await?
            .ok_or(QueueError::NotFound(message.contact_id))?;
        if contact.opted_out {
            return Err(QueueError::OptOut);
        }

        let cap = self.ctx.config.approval.trainer_hourly_approval_cap;
        let approved = self
            .ctx
            .approval_limiter
            .approvals_this_hour(trainer_id, now)
            .await?;
        if approved >= cap {
            return Err(QueueError::RateLimited { approved, cap });
        }

        let config = self.ctx.store.compliance_config(trainer_id).await?;
        let (scheduled_for, deferred) =
            match evaluate(now.naive_utc(), &contact.counters(), &config)? {
                Decision::Allowed { .. } => (now, false),
                Decision::Denied(Denial::QuietHours { next_available }) => {
                    (next_available.and_utc(), true)
                }
                Decision::Denied(Denial::FrequencyCap { limit, sent, cap }) => {
                    return Err(QueueError::FrequencyCap { limit, sent, cap });
                }
            };

        let status = message.status.transition_to(MessageStatus::Queued)?;
        let update = MessageUpdate::status(status)
            .scheduled_for(Some(scheduled_for))
            .clear_auto_approval()
            .approved_at(now);
        if !self
            .ctx
            .store
            .update_message(message_id, &[message.status], &update)
            .await?
        {
            return Err(QueueError::Conflict(message_id));
        }

        if let Err(e) = self
            .ctx
            .approval_limiter
            .record_approval(trainer_id, now)
            .await
        {
            tracing::warn!("Failed to record approval for trainer {}: {}", trainer_id, e);
        }

        tracing::info!(
            "Trainer {} approved message {} for {}{}",
            trainer_id,
            message_id,
            scheduled_for,
            if deferred { " (quiet hours)" } else { "" }
        );
        Ok(Approval {
            message_id,
            status,
            scheduled_for,
            deferred,
        })
    }

    /// Approves each id independently; one denial does not stop the rest.
    pub async fn bulk_approve(
        &self,
        trainer_id: Uuid,
        message_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<BulkApprovalResult>, QueueError> {
        if message_ids.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        if message_ids.len() > MAX_BULK_APPROVE {
            return Err(ValidationError::BatchTooLarge {
                count: message_ids.len(),
                limit: MAX_BULK_APPROVE,
            }
            .into());
        }

        let mut results = Vec::with_capacity(message_ids.len());
        for &message_id in message_ids {
            let result = match self.approve(trainer_id, message_id, now).await {
                Ok(approval) => BulkApprovalResult {
                    message_id,
                    success: true,
                    approval: Some(approval),
                    denial: None,
                },
                Err(e) => {
                    if let QueueError::Storage(inner) = &e {
                        tracing::error!("Error approving message {}: {}", message_id, inner);
                    }
                    BulkApprovalResult {
                        message_id,
                        success: false,
                        approval: None,
                        denial: Some(ErrorBody::from(&e)),
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Replaces a draft's content and records the edit for later training.
    pub async fn edit(
        &self,
        trainer_id: Uuid,
        message_id: Uuid,
        content: &str,
    ) -> Result<Message, QueueError> {
        validate_content(content)?;
        let message = self.owned_message(trainer_id, message_id).await?;
        if message.status != MessageStatus::Draft {
            return Err(TransitionError {
                from: message.status,
                to: MessageStatus::Draft,
            }
            .into());
        }

        let edit = NewTrainerEdit {
            message_id,
            original_content: message.content.clone(),
            edited_content: content.to_string(),
            original_confidence: message.confidence,
        };
        if !self.ctx.store.edit_draft(message_id, content, &edit).await? {
            return Err(QueueError::Conflict(message_id));
        }

        tracing::info!("Trainer {} edited message {}", trainer_id, message_id);
        self.owned_message(trainer_id, message_id).await
    }

    /// Stops a pending auto-approval. The draft itself is left as is.
    pub async fn cancel_auto_approval(
        &self,
        trainer_id: Uuid,
        message_id: Uuid,
    ) -> Result<Message, QueueError> {
        let message = self.owned_message(trainer_id, message_id).await?;
        if message.status != MessageStatus::Draft {
            return Err(TransitionError {
                from: message.status,
                to: MessageStatus::Draft,
            }
            .into());
        }

        let update = MessageUpdate::default().clear_auto_approval();
        if !self
            .ctx
            .store
            .update_message(message_id, &[MessageStatus::Draft], &update)
            .await?
        {
            return Err(QueueError::Conflict(message_id));
        }

        tracing::info!("Trainer {} cancelled auto-approval of {}", trainer_id, message_id);
        self.owned_message(trainer_id, message_id).await
    }
}
