use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::compliance::TrainerComplianceConfig;
use crate::types::{Contact, Message, MessageStatus, NewTrainerEdit, TrainerEdit};

/// Partial update applied to a message by a guarded write.
///
/// `None` leaves a column untouched. For nullable columns `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub scheduled_for: Option<Option<DateTime<Utc>>>,
    pub auto_approval_at: Option<Option<DateTime<Utc>>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub failed_reason: Option<String>,
}

impl MessageUpdate {
    pub fn status(status: MessageStatus) -> Self {
        MessageUpdate {
            status: Some(status),
            ..MessageUpdate::default()
        }
    }

    pub fn scheduled_for(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn clear_auto_approval(mut self) -> Self {
        self.auto_approval_at = Some(None);
        self
    }

    pub fn approved_at(mut self, at: DateTime<Utc>) -> Self {
        self.approved_at = Some(at);
        self
    }

    pub fn sent(mut self, at: DateTime<Utc>, external_id: Option<String>) -> Self {
        self.sent_at = Some(at);
        self.external_id = external_id;
        self
    }

    pub fn failed_reason(mut self, reason: impl Into<String>) -> Self {
        self.failed_reason = Some(reason.into());
        self
    }

    pub fn apply(&self, message: &mut Message, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(at) = self.scheduled_for {
            message.scheduled_for = at;
        }
        if let Some(at) = self.auto_approval_at {
            message.auto_approval_at = at;
        }
        if let Some(at) = self.approved_at {
            message.approved_at = Some(at);
        }
        if let Some(at) = self.sent_at {
            message.sent_at = Some(at);
        }
        if let Some(id) = &self.external_id {
            message.external_id = Some(id.clone());
        }
        if let Some(reason) = &self.failed_reason {
            message.failed_reason = Some(reason.clone());
        }
        message.updated_at = now;
    }
}

/// Durable record of messages, contacts and their compliance counters.
///
/// Every write that changes a message is conditioned on the caller's expected
/// prior status and reports whether a row actually changed. `false` means
/// another writer got there first.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn message(&self, id: Uuid) -> Result<Option<Message>>;

    async fn contact(&self, id: Uuid) -> Result<Option<Contact>>;

    /// One round trip for a whole batch.
    async fn contacts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Contact>>;

    /// Falls back to [`TrainerComplianceConfig::default`] when the trainer has none.
    async fn compliance_config(&self, trainer_id: Uuid) -> Result<TrainerComplianceConfig>;

    /// Ready messages whose `scheduled_for` is unset or not after `now`, in fetch order.
    async fn ready_for_dispatch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        trainer_id: Option<Uuid>,
    ) -> Result<Vec<Message>>;

    /// Drafts with `requires_approval = false` and a pending `auto_approval_at`,
    /// both that and `scheduled_for` not after `now`.
    async fn due_for_auto_approval(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        trainer_id: Option<Uuid>,
    ) -> Result<Vec<Message>>;

    /// Messages the trainer has sent since `since`.
    async fn sent_since(&self, trainer_id: Uuid, since: DateTime<Utc>) -> Result<u32>;

    async fn update_message(
        &self,
        id: Uuid,
        expected: &[MessageStatus],
        update: &MessageUpdate,
    ) -> Result<bool>;

    /// Replaces the content of a draft, bumps `edit_count`, clears
    /// `auto_approval_at` and appends the audit row, all or nothing.
    async fn edit_draft(&self, id: Uuid, content: &str, edit: &NewTrainerEdit) -> Result<bool>;

    /// The one place contact counters change: reset-then-increment for a
    /// confirmed send at `at`.
    async fn increment_message_counters(&self, contact_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn trainer_edits(&self, message_id: Uuid) -> Result<Vec<TrainerEdit>>;
}
