use anyhow::Result;
use chrono::{DateTime, Utc};
use outreach_core::compliance::evaluate;
use outreach_core::{
    CapLimit, Contact, Decision, Denial, Message, MessageStatus, MessageStore, MessageUpdate,
    OutreachContext, TrainerComplianceConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    Queued,
    /// Outside quiet hours; the draft waits for the next window.
    Rescheduled { next_available: DateTime<Utc> },
    Blocked { limit: CapLimit },
    /// Another writer changed the draft first.
    Skipped,
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub message_id: Uuid,
    #[serde(flatten)]
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub processed: usize,
    pub results: Vec<SweepResult>,
}

/// Moves drafts whose auto-approval time has passed into the send queue,
/// gated by the compliance check. Never sends and never touches counters.
pub struct AutoApprovalScheduler {
    store: Arc<dyn MessageStore>,
    batch_size: usize,
}

impl AutoApprovalScheduler {
    pub fn new(ctx: &OutreachContext) -> Self {
        Self {
            store: ctx.store.clone(),
            batch_size: ctx.config.approval.batch_size,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>, trainer_id: Option<Uuid>) -> Result<SweepReport> {
        let drafts = self
            .store
            .due_for_auto_approval(now, self.batch_size, trainer_id)
            .await?;

        let mut report = SweepReport::default();
        if drafts.is_empty() {
            return Ok(report);
        }

        let mut contact_ids: Vec<Uuid> = drafts.iter().map(|m| m.contact_id).collect();
        contact_ids.sort_unstable();
        contact_ids.dedup();
        let contacts = self.store.contacts(&contact_ids).await?;
        let mut configs: HashMap<Uuid, TrainerComplianceConfig> = HashMap::new();

        for draft in &drafts {
            report.processed += 1;
            let outcome = match self
                .sweep_one(draft, contacts.get(&draft.contact_id), &mut configs, now)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Error auto-approving message {}: {}", draft.id, e);
                    SweepOutcome::Error {
                        error: e.to_string(),
                    }
                }
            };
            report.results.push(SweepResult {
                message_id: draft.id,
                outcome,
            });
        }

        tracing::info!("Auto-approval pass: processed={}", report.processed);
        Ok(report)
    }

    async fn sweep_one(
        &self,
        draft: &Message,
        contact: Option<&Contact>,
        configs: &mut HashMap<Uuid, TrainerComplianceConfig>,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let Some(contact) = contact else {
            return Ok(SweepOutcome::Error {
                error: format!("contact {} not found", draft.contact_id),
            });
        };

        let config = match configs.get(&draft.trainer_id) {
            Some(config) => *config,
            None => {
                let config = self.store.compliance_config(draft.trainer_id).await?;
                configs.insert(draft.trainer_id, config);
                config
            }
        };

        let (update, outcome) = match evaluate(now.naive_utc(), &contact.counters(), &config)? {
            Decision::Allowed { .. } => (
                MessageUpdate::status(draft.status.transition_to(MessageStatus::Queued)?)
                    .approved_at(now)
                    .clear_auto_approval(),
                SweepOutcome::Queued,
            ),
            Decision::Denied(Denial::QuietHours { next_available }) => {
                let next_available = next_available.and_utc();
                (
                    MessageUpdate::default().scheduled_for(Some(next_available)),
                    SweepOutcome::Rescheduled { next_available },
                )
            }
            Decision::Denied(Denial::FrequencyCap { limit, .. }) => (
                MessageUpdate::status(draft.status.transition_to(MessageStatus::Blocked)?),
                SweepOutcome::Blocked { limit },
            ),
        };

        if !self
            .store
            .update_message(draft.id, &[MessageStatus::Draft], &update)
            .await?
        {
            return Ok(SweepOutcome::Skipped);
        }

        tracing::debug!("Auto-approval of {}: {:?}", draft.id, outcome);
        Ok(outcome)
    }
}

/// In-process trigger: one sweep every `approval.interval_secs`.
pub async fn run(ctx: OutreachContext) -> Result<()> {
    let interval = Duration::from_secs(ctx.config.approval.interval_secs);
    tracing::info!("Starting auto-approval scheduler (interval {:?})", interval);

    let scheduler = AutoApprovalScheduler::new(&ctx);
    loop {
        if let Err(e) = scheduler.run_once(Utc::now(), None).await {
            tracing::error!("Error in auto-approval scheduler: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}
