use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use outreach_core::{
    ChannelAdapter, Contact, Message, MessageStatus, MessageStore, MessageUpdate, OutreachContext,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing;
use uuid::Uuid;

pub const OPTED_OUT_REASON: &str = "opted out";
pub const RATE_LIMIT_REASON: &str = "rate limit exceeded";
const MISSING_CONTACT_REASON: &str = "contact not found";

/// Totals for one dispatcher pass. `skipped` covers messages another writer
/// moved first and items left untouched because of a storage error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum ItemOutcome {
    Sent,
    Failed,
    Skipped,
}

/// Sends ready messages whose time has come, one bounded batch per pass.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    channel: Arc<dyn ChannelAdapter>,
    batch_size: usize,
    trainer_hourly_cap: u32,
}

impl Dispatcher {
    pub fn new(ctx: &OutreachContext, channel: Arc<dyn ChannelAdapter>) -> Self {
        Self {
            store: ctx.store.clone(),
            channel,
            batch_size: ctx.config.dispatch.batch_size,
            trainer_hourly_cap: ctx.config.dispatch.trainer_hourly_send_cap,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>, trainer_id: Option<Uuid>) -> Result<DispatchReport> {
        let messages = self
            .store
            .ready_for_dispatch(now, self.batch_size, trainer_id)
            .await?;

        let mut report = DispatchReport::default();
        if messages.is_empty() {
            return Ok(report);
        }
        tracing::debug!("Found {} messages ready to dispatch", messages.len());

        let mut contact_ids: Vec<Uuid> = messages.iter().map(|m| m.contact_id).collect();
        contact_ids.sort_unstable();
        contact_ids.dedup();
        let contacts = self.store.contacts(&contact_ids).await?;

        // trailing-hour send counts, one query per trainer in the batch
        let window_start = now - ChronoDuration::hours(1);
        let mut sent_this_hour: HashMap<Uuid, u32> = HashMap::new();
        for message in &messages {
            if !sent_this_hour.contains_key(&message.trainer_id) {
                let count = self.store.sent_since(message.trainer_id, window_start).await?;
                sent_this_hour.insert(message.trainer_id, count);
            }
        }

        for message in &messages {
            report.processed += 1;
            let window = sent_this_hour.entry(message.trainer_id).or_insert(0);

            match self
                .dispatch_one(message, contacts.get(&message.contact_id), window, now)
                .await
            {
                Ok(ItemOutcome::Sent) => report.sent += 1,
                Ok(ItemOutcome::Failed) => report.failed += 1,
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!("Error dispatching message {}: {}", message.id, e);
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            "Dispatch pass: processed={} sent={} failed={} skipped={}",
            report.processed,
            report.sent,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    async fn dispatch_one(
        &self,
        message: &Message,
        contact: Option<&Contact>,
        sent_this_hour: &mut u32,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let Some(contact) = contact else {
            return self.mark_failed(message, MISSING_CONTACT_REASON).await;
        };
        if contact.opted_out {
            return self.mark_failed(message, OPTED_OUT_REASON).await;
        }
        if *sent_this_hour >= self.trainer_hourly_cap {
            return self.mark_failed(message, RATE_LIMIT_REASON).await;
        }

        let idempotency_key = message.id.to_string();
        let outcome = match self
            .channel
            .send(contact, &message.content, message.channel, &idempotency_key)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.mark_failed(message, &e.to_string()).await,
        };

        if !outcome.success {
            let reason = outcome.error.as_deref().unwrap_or("send failed");
            return self.mark_failed(message, reason).await;
        }

        let next = message.status.transition_to(MessageStatus::Sent)?;
        let update = MessageUpdate::status(next).sent(now, outcome.external_id.clone());
        let written = self
            .store
            .update_message(message.id, &[message.status], &update)
            .await;

        // the CRM accepted it, so it counts whatever happened to the row
        *sent_this_hour += 1;
        if let Err(e) = self
            .store
            .increment_message_counters(message.contact_id, now)
            .await
        {
            tracing::error!(
                "Failed to increment counters for contact {} after sending {}: {}",
                message.contact_id,
                message.id,
                e
            );
        }

        if !written? {
            tracing::warn!(
                "Message {} was sent but changed status concurrently (external id {:?})",
                message.id,
                outcome.external_id
            );
            return Ok(ItemOutcome::Skipped);
        }

        tracing::debug!("Sent message {} via {}", message.id, message.channel);
        Ok(ItemOutcome::Sent)
    }

    async fn mark_failed(&self, message: &Message, reason: &str) -> Result<ItemOutcome> {
        let next = message.status.transition_to(MessageStatus::Failed)?;
        let update = MessageUpdate::status(next).failed_reason(reason);

        if self
            .store
            .update_message(message.id, &[message.status], &update)
            .await?
        {
            tracing::warn!("Message {} failed: {}", message.id, reason);
            Ok(ItemOutcome::Failed)
        } else {
            tracing::debug!("Message {} already moved on, skipping", message.id);
            Ok(ItemOutcome::Skipped)
        }
    }
}

/// In-process trigger: one pass every `dispatch.interval_secs`.
pub async fn run(ctx: OutreachContext, channel: Arc<dyn ChannelAdapter>) -> Result<()> {
    let interval = Duration::from_secs(ctx.config.dispatch.interval_secs);
    tracing::info!("Starting dispatcher (interval {:?})", interval);

    let dispatcher = Dispatcher::new(&ctx, channel);
    loop {
        if let Err(e) = dispatcher.run_once(Utc::now(), None).await {
            tracing::error!("Error in dispatcher: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use outreach_core::{Channel, Config, MemoryApprovalLimiter, MemoryStore, SendOutcome};
    use std::sync::Mutex;

    /// Channel that records every send and fails the contents it is told to.
    #[derive(Default)]
    struct ScriptedChannel {
        calls: Mutex<Vec<String>>,
        reject: Vec<&'static str>,
        error: Vec<&'static str>,
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedChannel {
        async fn send(
            &self,
            _contact: &Contact,
            content: &str,
            _channel: Channel,
            idempotency_key: &str,
        ) -> Result<SendOutcome> {
            self.calls.lock().unwrap().push(content.to_string());
            if self.error.iter().any(|c| *c == content) {
                anyhow::bail!("connection reset");
            }
            if self.reject.iter().any(|c| *c == content) {
                return Ok(SendOutcome::rejected("400: invalid phone"));
            }
            Ok(SendOutcome::delivered(format!("ext-{}", idempotency_key)))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 14, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        trainer: Uuid,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                store: Arc::new(MemoryStore::new()),
                trainer: Uuid::new_v4(),
                config: Config::default(),
            }
        }

        async fn contact(&self, opted_out: bool) -> Contact {
            let mut contact = Contact::new(self.trainer, Some("crm-1"));
            contact.opted_out = opted_out;
            self.store.insert_contact(contact.clone()).await;
            contact
        }

        async fn ready(&self, contact: &Contact, content: &str) -> Message {
            let mut message = Message::draft(self.trainer, contact.id, content, Channel::Sms);
            message.status = MessageStatus::Queued;
            message.scheduled_for = Some(now());
            self.store.insert_message(message.clone()).await;
            message
        }

        fn dispatcher(&self, channel: Arc<ScriptedChannel>) -> Dispatcher {
            let ctx = OutreachContext::from_parts(
                self.config.clone(),
                self.store.clone(),
                Arc::new(MemoryApprovalLimiter::new()),
            );
            Dispatcher::new(&ctx, channel)
        }

        async fn status(&self, message: &Message) -> Message {
            self.store.message(message.id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn opted_out_contact_is_failed_without_a_send() {
        let fx = Fixture::new();
        let reachable = fx.contact(false).await;
        let opted_out = fx.contact(true).await;

        let mut messages = Vec::new();
        for i in 0..5 {
            let contact = if i == 1 { &opted_out } else { &reachable };
            messages.push(fx.ready(contact, &format!("message {}", i)).await);
        }
        let channel = Arc::new(ScriptedChannel {
            reject: vec!["message 3"],
            ..ScriptedChannel::default()
        });

        let report = fx.dispatcher(channel.clone()).run_once(now(), None).await.unwrap();

        assert_eq!(channel.calls.lock().unwrap().len(), 4);
        assert!(!channel.calls.lock().unwrap().contains(&"message 1".to_string()));
        assert_eq!(
            report,
            DispatchReport {
                processed: 5,
                sent: 3,
                failed: 2,
                skipped: 0
            }
        );

        let skipped = fx.status(&messages[1]).await;
        assert_eq!(skipped.status, MessageStatus::Failed);
        assert_eq!(skipped.failed_reason.as_deref(), Some(OPTED_OUT_REASON));

        let rejected = fx.status(&messages[3]).await;
        assert_eq!(rejected.status, MessageStatus::Failed);
        assert_eq!(rejected.failed_reason.as_deref(), Some("400: invalid phone"));
    }

    #[tokio::test]
    async fn successful_send_records_external_id_and_counters() {
        let fx = Fixture::new();
        let contact = fx.contact(false).await;
        let message = fx.ready(&contact, "See you Tuesday").await;

        let report = fx
            .dispatcher(Arc::new(ScriptedChannel::default()))
            .run_once(now(), None)
            .await
            .unwrap();
        assert_eq!(report.sent, 1);

        let sent = fx.status(&message).await;
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.sent_at, Some(now()));
        assert_eq!(sent.external_id, Some(format!("ext-{}", message.id)));

        let contact = fx.store.contact(contact.id).await.unwrap().unwrap();
        assert_eq!(contact.messages_sent_today, 1);
        assert_eq!(contact.messages_sent_this_week, 1);
        assert_eq!(contact.last_message_sent_at, Some(now()));
    }

    #[tokio::test]
    async fn adapter_error_fails_only_that_message() {
        let fx = Fixture::new();
        let contact = fx.contact(false).await;
        let broken = fx.ready(&contact, "boom").await;
        let fine = fx.ready(&contact, "fine").await;
        let channel = Arc::new(ScriptedChannel {
            error: vec!["boom"],
            ..ScriptedChannel::default()
        });

        let report = fx.dispatcher(channel).run_once(now(), None).await.unwrap();
        assert_eq!((report.sent, report.failed), (1, 1));

        let broken = fx.status(&broken).await;
        assert_eq!(broken.status, MessageStatus::Failed);
        assert_eq!(broken.failed_reason.as_deref(), Some("connection reset"));
        assert_eq!(fx.status(&fine).await.status, MessageStatus::Sent);

        // counters move only for the confirmed send
        let contact = fx.store.contact(contact.id).await.unwrap().unwrap();
        assert_eq!(contact.messages_sent_today, 1);
    }

    #[tokio::test]
    async fn trainer_hourly_cap_counts_sends_within_the_batch() {
        let mut fx = Fixture::new();
        fx.config.dispatch.trainer_hourly_send_cap = 3;
        let contact = fx.contact(false).await;

        // one send already landed 30 minutes ago
        let mut earlier = Message::draft(fx.trainer, contact.id, "earlier", Channel::Sms);
        earlier.status = MessageStatus::Sent;
        earlier.sent_at = Some(now() - ChronoDuration::minutes(30));
        fx.store.insert_message(earlier).await;

        let mut batch = Vec::new();
        for i in 0..4 {
            batch.push(fx.ready(&contact, &format!("batch {}", i)).await);
        }
        let channel = Arc::new(ScriptedChannel::default());

        let report = fx.dispatcher(channel.clone()).run_once(now(), None).await.unwrap();

        assert_eq!((report.sent, report.failed), (2, 2));
        assert_eq!(channel.calls.lock().unwrap().len(), 2);
        let capped = fx.status(&batch[3]).await;
        assert_eq!(capped.status, MessageStatus::Failed);
        assert_eq!(capped.failed_reason.as_deref(), Some(RATE_LIMIT_REASON));
    }

    #[tokio::test]
    async fn future_and_draft_messages_are_left_alone() {
        let fx = Fixture::new();
        let contact = fx.contact(false).await;

        let mut later = Message::draft(fx.trainer, contact.id, "later", Channel::Sms);
        later.status = MessageStatus::Queued;
        later.scheduled_for = Some(now() + ChronoDuration::hours(2));
        fx.store.insert_message(later.clone()).await;
        let draft = Message::draft(fx.trainer, contact.id, "draft", Channel::Sms);
        fx.store.insert_message(draft.clone()).await;

        let report = fx
            .dispatcher(Arc::new(ScriptedChannel::default()))
            .run_once(now(), None)
            .await
            .unwrap();

        assert_eq!(report, DispatchReport::default());
        assert_eq!(fx.status(&later).await.status, MessageStatus::Queued);
        assert_eq!(fx.status(&draft).await.status, MessageStatus::Draft);
    }

    #[tokio::test]
    async fn legacy_ready_states_are_dispatched() {
        let fx = Fixture::new();
        let contact = fx.contact(false).await;
        for status in [MessageStatus::Approved, MessageStatus::Scheduled] {
            let mut message = Message::draft(fx.trainer, contact.id, status.as_str(), Channel::Sms);
            message.status = status;
            fx.store.insert_message(message).await;
        }

        let report = fx
            .dispatcher(Arc::new(ScriptedChannel::default()))
            .run_once(now(), None)
            .await
            .unwrap();
        assert_eq!(report.sent, 2);
    }

    #[tokio::test]
    async fn second_pass_does_not_resend() {
        let fx = Fixture::new();
        let contact = fx.contact(false).await;
        fx.ready(&contact, "once").await;
        let channel = Arc::new(ScriptedChannel::default());
        let dispatcher = fx.dispatcher(channel.clone());

        dispatcher.run_once(now(), None).await.unwrap();
        let again = dispatcher.run_once(now(), None).await.unwrap();

        assert_eq!(again.processed, 0);
        assert_eq!(channel.calls.lock().unwrap().len(), 1);
    }

    /// Channel that lets another writer fail the message while the send is in flight.
    struct RacingChannel {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl ChannelAdapter for RacingChannel {
        async fn send(
            &self,
            _contact: &Contact,
            _content: &str,
            _channel: Channel,
            idempotency_key: &str,
        ) -> Result<SendOutcome> {
            let id: Uuid = idempotency_key.parse()?;
            let update = MessageUpdate::status(MessageStatus::Failed).failed_reason("cancelled elsewhere");
            self.store
                .update_message(id, &[MessageStatus::Queued], &update)
                .await?;
            Ok(SendOutcome::delivered(format!("ext-{}", idempotency_key)))
        }
    }

    #[tokio::test]
    async fn confirmed_send_is_counted_when_the_status_write_loses() {
        let mut fx = Fixture::new();
        fx.config.dispatch.trainer_hourly_send_cap = 1;
        let contact = fx.contact(false).await;
        let raced = fx.ready(&contact, "raced").await;
        let next = fx.ready(&contact, "next").await;

        let ctx = OutreachContext::from_parts(
            fx.config.clone(),
            fx.store.clone(),
            Arc::new(MemoryApprovalLimiter::new()),
        );
        let channel = Arc::new(RacingChannel {
            store: fx.store.clone(),
        });
        let report = Dispatcher::new(&ctx, channel).run_once(now(), None).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(fx.status(&raced).await.status, MessageStatus::Failed);

        let contact = fx.store.contact(contact.id).await.unwrap().unwrap();
        assert_eq!(contact.messages_sent_today, 1);
        assert_eq!(contact.messages_sent_this_week, 1);

        // the uncommitted send still used up the trainer's hourly window
        let capped = fx.status(&next).await;
        assert_eq!(capped.status, MessageStatus::Failed);
        assert_eq!(capped.failed_reason.as_deref(), Some(RATE_LIMIT_REASON));
    }

    #[tokio::test]
    async fn run_can_be_scoped_to_one_trainer() {
        let fx = Fixture::new();
        let contact = fx.contact(false).await;
        fx.ready(&contact, "mine").await;

        let other_trainer = Uuid::new_v4();
        let other_contact = Contact::new(other_trainer, Some("crm-2"));
        fx.store.insert_contact(other_contact.clone()).await;
        let mut theirs = Message::draft(other_trainer, other_contact.id, "theirs", Channel::Sms);
        theirs.status = MessageStatus::Queued;
        fx.store.insert_message(theirs.clone()).await;

        let report = fx
            .dispatcher(Arc::new(ScriptedChannel::default()))
            .run_once(now(), Some(fx.trainer))
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(fx.status(&theirs).await.status, MessageStatus::Queued);
    }
}
