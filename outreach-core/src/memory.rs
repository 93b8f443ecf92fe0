//! In-process implementations of [`MessageStore`] and [`ApprovalRateLimiter`].
//!
//! They follow the same guarded-write rules as the Postgres store and back
//! the pipeline's tests and local dry runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::compliance::TrainerComplianceConfig;
use crate::limiter::ApprovalRateLimiter;
use crate::store::{MessageStore, MessageUpdate};
use crate::types::{Contact, Message, MessageStatus, NewTrainerEdit, TrainerEdit};

#[derive(Default)]
struct Tables {
    // insertion order doubles as fetch order
    messages: Vec<Message>,
    contacts: HashMap<Uuid, Contact>,
    configs: HashMap<Uuid, TrainerComplianceConfig>,
    edits: Vec<TrainerEdit>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_message(&self, message: Message) {
        let mut tables = self.tables.lock().await;
        tables.messages.retain(|m| m.id != message.id);
        tables.messages.push(message);
    }

    pub async fn insert_contact(&self, contact: Contact) {
        self.tables.lock().await.contacts.insert(contact.id, contact);
    }

    pub async fn set_compliance_config(&self, trainer_id: Uuid, config: TrainerComplianceConfig) {
        self.tables.lock().await.configs.insert(trainer_id, config);
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn message(&self, id: Uuid) -> Result<Option<Message>> {
        let tables = self.tables.lock().await;
        Ok(tables.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn contact(&self, id: Uuid) -> Result<Option<Contact>> {
        Ok(self.tables.lock().await.contacts.get(&id).cloned())
    }

    async fn contacts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Contact>> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.contacts.get(id).map(|c| (*id, c.clone())))
            .collect())
    }

    async fn compliance_config(&self, trainer_id: Uuid) -> Result<TrainerComplianceConfig> {
        let tables = self.tables.lock().await;
        Ok(tables.configs.get(&trainer_id).copied().unwrap_or_default())
    }

    async fn ready_for_dispatch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        trainer_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.status.is_ready() && m.is_due(now))
            .filter(|m| trainer_id.map_or(true, |t| m.trainer_id == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn due_for_auto_approval(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        trainer_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Draft && !m.requires_approval)
            .filter(|m| m.auto_approval_at.is_some_and(|at| at <= now) && m.is_due(now))
            .filter(|m| trainer_id.map_or(true, |t| m.trainer_id == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn sent_since(&self, trainer_id: Uuid, since: DateTime<Utc>) -> Result<u32> {
        let tables = self.tables.lock().await;
        let count = tables
            .messages
            .iter()
            .filter(|m| m.trainer_id == trainer_id && m.status.is_delivered())
            .filter(|m| m.sent_at.is_some_and(|at| at >= since))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn update_message(
        &self,
        id: Uuid,
        expected: &[MessageStatus],
        update: &MessageUpdate,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables
            .messages
            .iter_mut()
            .find(|m| m.id == id && expected.contains(&m.status))
        {
            Some(message) => {
                update.apply(message, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn edit_draft(&self, id: Uuid, content: &str, edit: &NewTrainerEdit) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();

        let Some(message) = tables
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.status == MessageStatus::Draft)
        else {
            return Ok(false);
        };
        message.content = content.to_string();
        message.edit_count += 1;
        message.auto_approval_at = None;
        message.updated_at = now;

        let next_id = tables.edits.len() as i64 + 1;
        tables.edits.push(TrainerEdit {
            id: next_id,
            message_id: edit.message_id,
            original_content: edit.original_content.clone(),
            edited_content: edit.edited_content.clone(),
            original_confidence: edit.original_confidence,
            created_at: now,
        });
        Ok(true)
    }

    async fn increment_message_counters(&self, contact_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(contact) = tables.contacts.get_mut(&contact_id) {
            let next = contact.counters().incremented(at.naive_utc());
            contact.messages_sent_today = i32::try_from(next.messages_sent_today).unwrap_or(i32::MAX);
            contact.messages_sent_this_week =
                i32::try_from(next.messages_sent_this_week).unwrap_or(i32::MAX);
            contact.last_message_sent_at = Some(at);
        }
        Ok(())
    }

    async fn trainer_edits(&self, message_id: Uuid) -> Result<Vec<TrainerEdit>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .edits
            .iter()
            .filter(|e| e.message_id == message_id)
            .cloned()
            .collect())
    }
}

/// Counts approvals per trainer and clock hour.
#[derive(Default)]
pub struct MemoryApprovalLimiter {
    counts: Mutex<HashMap<(Uuid, String), u32>>,
}

impl MemoryApprovalLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn hour_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H").to_string()
}

#[async_trait]
impl ApprovalRateLimiter for MemoryApprovalLimiter {
    async fn approvals_this_hour(&self, trainer_id: Uuid, now: DateTime<Utc>) -> Result<u32> {
        let counts = self.counts.lock().await;
        Ok(counts.get(&(trainer_id, hour_bucket(now))).copied().unwrap_or(0))
    }

    async fn record_approval(&self, trainer_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut counts = self.counts.lock().await;
        *counts.entry((trainer_id, hour_bucket(now))).or_insert(0) += 1;
        Ok(())
    }
}
