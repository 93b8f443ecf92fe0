use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Timestamptz, Uuid as SqlUuid};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::collections::HashMap;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

use crate::compliance::TrainerComplianceConfig;
use crate::db::DbPool;
use crate::error::ValidationError;
use crate::schema::{contacts, messages, trainer_compliance_config, trainer_edits};
use crate::store::{MessageStore, MessageUpdate};
use crate::types::{Contact, Message, MessageStatus, NewTrainerEdit, TrainerEdit};

/// Reset-then-increment in one statement so concurrent sends to the same
/// contact cannot lose an update. Day boundaries are UTC calendar days.
const INCREMENT_COUNTERS_SQL: &str = r#"
UPDATE contacts SET
    messages_sent_today = CASE
        WHEN last_message_sent_at IS NOT NULL
             AND (last_message_sent_at AT TIME ZONE 'UTC')::date = ($1 AT TIME ZONE 'UTC')::date
        THEN messages_sent_today + 1
        ELSE 1
    END,
    messages_sent_this_week = CASE
        WHEN last_message_sent_at IS NOT NULL
             AND $1 - last_message_sent_at < INTERVAL '7 days'
        THEN messages_sent_this_week + 1
        ELSE 1
    END,
    last_message_sent_at = $1,
    updated_at = NOW()
WHERE id = $2
"#;

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: Uuid,
    trainer_id: Uuid,
    contact_id: Uuid,
    content: String,
    channel: String,
    status: String,
    scheduled_for: Option<DateTime<Utc>>,
    auto_approval_at: Option<DateTime<Utc>>,
    requires_approval: bool,
    confidence: Option<f64>,
    edit_count: i32,
    external_id: Option<String>,
    failed_reason: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = ValidationError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            trainer_id: row.trainer_id,
            contact_id: row.contact_id,
            content: row.content,
            channel: row.channel.parse()?,
            status: row.status.parse()?,
            scheduled_for: row.scheduled_for,
            auto_approval_at: row.auto_approval_at,
            requires_approval: row.requires_approval,
            confidence: row.confidence,
            edit_count: row.edit_count,
            external_id: row.external_id,
            failed_reason: row.failed_reason,
            approved_at: row.approved_at,
            sent_at: row.sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = contacts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ContactRow {
    id: Uuid,
    trainer_id: Uuid,
    crm_contact_id: Option<String>,
    opted_out: bool,
    messages_sent_today: i32,
    messages_sent_this_week: i32,
    last_message_sent_at: Option<DateTime<Utc>>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: row.id,
            trainer_id: row.trainer_id,
            crm_contact_id: row.crm_contact_id,
            opted_out: row.opted_out,
            messages_sent_today: row.messages_sent_today,
            messages_sent_this_week: row.messages_sent_this_week,
            last_message_sent_at: row.last_message_sent_at,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = trainer_compliance_config)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ComplianceConfigRow {
    quiet_hours_start: NaiveTime,
    quiet_hours_end: NaiveTime,
    frequency_cap_daily: i32,
    frequency_cap_weekly: i32,
}

impl From<ComplianceConfigRow> for TrainerComplianceConfig {
    fn from(row: ComplianceConfigRow) -> Self {
        TrainerComplianceConfig {
            quiet_hours_start: row.quiet_hours_start,
            quiet_hours_end: row.quiet_hours_end,
            frequency_cap_daily: u32::try_from(row.frequency_cap_daily).unwrap_or(0),
            frequency_cap_weekly: u32::try_from(row.frequency_cap_weekly).unwrap_or(0),
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = trainer_edits)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TrainerEditRow {
    id: i64,
    message_id: Uuid,
    original_content: String,
    edited_content: String,
    original_confidence: Option<f64>,
    created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = trainer_edits)]
struct NewTrainerEditRow {
    message_id: Uuid,
    original_content: String,
    edited_content: String,
    original_confidence: Option<f64>,
}

#[derive(AsChangeset)]
#[diesel(table_name = messages)]
struct MessageChangeset<'a> {
    status: Option<&'a str>,
    scheduled_for: Option<Option<DateTime<Utc>>>,
    auto_approval_at: Option<Option<DateTime<Utc>>>,
    approved_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    external_id: Option<&'a str>,
    failed_reason: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

fn status_names(statuses: &[MessageStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

/// Rows with an unknown status or channel are skipped rather than failing the batch.
fn into_messages(rows: Vec<MessageRow>) -> Vec<Message> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match Message::try_from(row) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!("Skipping unreadable message {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

pub struct PgMessageStore {
    pool: Arc<DbPool>,
}

impl PgMessageStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn message(&self, id: Uuid) -> Result<Option<Message>> {
        let mut conn = self.pool.get().await?;

        let row = messages::table
            .find(id)
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(Message::try_from).transpose()?)
    }

    async fn contact(&self, id: Uuid) -> Result<Option<Contact>> {
        let mut conn = self.pool.get().await?;

        let row = contacts::table
            .find(id)
            .select(ContactRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(Contact::from))
    }

    async fn contacts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Contact>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.pool.get().await?;

        let rows: Vec<ContactRow> = contacts::table
            .filter(contacts::id.eq_any(ids.to_vec()))
            .select(ContactRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.id, Contact::from(row)))
            .collect())
    }

    async fn compliance_config(&self, trainer_id: Uuid) -> Result<TrainerComplianceConfig> {
        let mut conn = self.pool.get().await?;

        let row = trainer_compliance_config::table
            .find(trainer_id)
            .select(ComplianceConfigRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(TrainerComplianceConfig::from).unwrap_or_default())
    }

    async fn ready_for_dispatch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        trainer_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let mut conn = self.pool.get().await?;

        let mut query = messages::table
            .filter(messages::status.eq_any(status_names(&MessageStatus::READY)))
            .filter(messages::scheduled_for.is_null().or(messages::scheduled_for.le(now)))
            .order(messages::created_at.asc())
            .limit(limit as i64)
            .select(MessageRow::as_select())
            .into_boxed();

        if let Some(trainer_id) = trainer_id {
            query = query.filter(messages::trainer_id.eq(trainer_id));
        }

        let rows = query.load(&mut conn).await?;
        Ok(into_messages(rows))
    }

    async fn due_for_auto_approval(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        trainer_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let mut conn = self.pool.get().await?;

        let mut query = messages::table
            .filter(messages::status.eq(MessageStatus::Draft.as_str()))
            .filter(messages::requires_approval.eq(false))
            .filter(messages::auto_approval_at.le(now))
            .filter(messages::scheduled_for.is_null().or(messages::scheduled_for.le(now)))
            .order(messages::created_at.asc())
            .limit(limit as i64)
            .select(MessageRow::as_select())
            .into_boxed();

        if let Some(trainer_id) = trainer_id {
            query = query.filter(messages::trainer_id.eq(trainer_id));
        }

        let rows = query.load(&mut conn).await?;
        Ok(into_messages(rows))
    }

    async fn sent_since(&self, trainer_id: Uuid, since: DateTime<Utc>) -> Result<u32> {
        let mut conn = self.pool.get().await?;

        let count: i64 = messages::table
            .filter(messages::trainer_id.eq(trainer_id))
            .filter(messages::status.eq_any(status_names(&MessageStatus::DELIVERED)))
            .filter(messages::sent_at.ge(since))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn update_message(
        &self,
        id: Uuid,
        expected: &[MessageStatus],
        update: &MessageUpdate,
    ) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let changeset = MessageChangeset {
            status: update.status.map(|s| s.as_str()),
            scheduled_for: update.scheduled_for,
            auto_approval_at: update.auto_approval_at,
            approved_at: update.approved_at,
            sent_at: update.sent_at,
            external_id: update.external_id.as_deref(),
            failed_reason: update.failed_reason.as_deref(),
            updated_at: Utc::now(),
        };

        let rows = diesel::update(
            messages::table
                .filter(messages::id.eq(id))
                .filter(messages::status.eq_any(status_names(expected))),
        )
        .set(&changeset)
        .execute(&mut conn)
        .await?;

        Ok(rows == 1)
    }

    async fn edit_draft(&self, id: Uuid, content: &str, edit: &NewTrainerEdit) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let content = content.to_string();
        let audit = NewTrainerEditRow {
            message_id: edit.message_id,
            original_content: edit.original_content.clone(),
            edited_content: edit.edited_content.clone(),
            original_confidence: edit.original_confidence,
        };

        let edited = conn
            .transaction(|conn| {
                async move {
                    let updated = diesel::update(
                        messages::table
                            .filter(messages::id.eq(id))
                            .filter(messages::status.eq(MessageStatus::Draft.as_str())),
                    )
                    .set((
                        messages::content.eq(&content),
                        messages::edit_count.eq(messages::edit_count + 1),
                        messages::auto_approval_at.eq(None::<DateTime<Utc>>),
                        messages::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                    if updated == 0 {
                        return Ok(false);
                    }

                    diesel::insert_into(trainer_edits::table)
                        .values(&audit)
                        .execute(conn)
                        .await?;

                    Ok::<bool, diesel::result::Error>(true)
                }
                .scope_boxed()
            })
            .await?;

        Ok(edited)
    }

    async fn increment_message_counters(&self, contact_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let rows = diesel::sql_query(INCREMENT_COUNTERS_SQL)
            .bind::<Timestamptz, _>(at)
            .bind::<SqlUuid, _>(contact_id)
            .execute(&mut conn)
            .await?;

        if rows == 0 {
            tracing::warn!("No contact {} to increment counters for", contact_id);
        }
        Ok(())
    }

    async fn trainer_edits(&self, message_id: Uuid) -> Result<Vec<TrainerEdit>> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<TrainerEditRow> = trainer_edits::table
            .filter(trainer_edits::message_id.eq(message_id))
            .order(trainer_edits::id.asc())
            .select(TrainerEditRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| TrainerEdit {
                id: row.id,
                message_id: row.message_id,
                original_content: row.original_content,
                edited_content: row.edited_content,
                original_confidence: row.original_confidence,
                created_at: row.created_at,
            })
            .collect())
    }
}
