use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::compliance::ContactComplianceCounters;
use crate::error::{TransitionError, ValidationError};

/// Longest message body accepted, counted in characters.
pub const MAX_CONTENT_CHARS: usize = 1600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Draft,
    Queued,
    Approved,
    Scheduled,
    Sent,
    Delivered,
    Read,
    Failed,
    Blocked,
}

impl MessageStatus {
    /// States the dispatcher picks up. `Queued` is canonical; `Approved` and
    /// `Scheduled` are older spellings of the same thing.
    pub const READY: [MessageStatus; 3] = [
        MessageStatus::Queued,
        MessageStatus::Approved,
        MessageStatus::Scheduled,
    ];

    pub const DELIVERED: [MessageStatus; 3] = [
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Draft => "draft",
            MessageStatus::Queued => "queued",
            MessageStatus::Approved => "approved",
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Blocked => "blocked",
        }
    }

    pub fn is_ready(self) -> bool {
        Self::READY.contains(&self)
    }

    /// Sent or further along; content is frozen from here on.
    pub fn is_delivered(self) -> bool {
        Self::DELIVERED.contains(&self)
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, next) {
            (Draft, Queued | Blocked) => true,
            // manual approval re-evaluates a blocked draft
            (Blocked, Queued) => true,
            (Queued | Approved | Scheduled, Sent | Failed) => true,
            (Queued, Scheduled) | (Scheduled, Queued) => true,
            (Sent, Delivered | Read) | (Delivered, Read) => true,
            _ => false,
        }
    }

    pub fn transition_to(self, next: MessageStatus) -> Result<MessageStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(MessageStatus::Draft),
            "queued" => Ok(MessageStatus::Queued),
            "approved" => Ok(MessageStatus::Approved),
            "scheduled" => Ok(MessageStatus::Scheduled),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            "blocked" => Ok(MessageStatus::Blocked),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
    Both,
    Dm,
    Instagram,
    Facebook,
    Whatsapp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Both => "both",
            Channel::Dm => "dm",
            Channel::Instagram => "instagram",
            Channel::Facebook => "facebook",
            Channel::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            "both" => Ok(Channel::Both),
            "dm" => Ok(Channel::Dm),
            "instagram" => Ok(Channel::Instagram),
            "facebook" => Ok(Channel::Facebook),
            "whatsapp" => Ok(Channel::Whatsapp),
            other => Err(ValidationError::UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub contact_id: Uuid,
    pub content: String,
    pub channel: Channel,
    pub status: MessageStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Set while the draft is waiting to approve itself.
    pub auto_approval_at: Option<DateTime<Utc>>,
    pub requires_approval: bool,
    /// Model confidence in the draft, 0..1. Advisory only.
    pub confidence: Option<f64>,
    pub edit_count: i32,
    /// Correlation id returned by the CRM once a send succeeds.
    pub external_id: Option<String>,
    pub failed_reason: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// A draft with nothing scheduled, as a quick action or the draft generator creates it.
    pub fn draft(trainer_id: Uuid, contact_id: Uuid, content: &str, channel: Channel) -> Self {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            trainer_id,
            contact_id,
            content: content.to_string(),
            channel,
            status: MessageStatus::Draft,
            scheduled_for: None,
            auto_approval_at: None,
            requires_approval: true,
            confidence: None,
            edit_count: 0,
            external_id: None,
            failed_reason: None,
            approved_at: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Due means `scheduled_for` is unset or not in the future.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub crm_contact_id: Option<String>,
    pub opted_out: bool,
    pub messages_sent_today: i32,
    pub messages_sent_this_week: i32,
    pub last_message_sent_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(trainer_id: Uuid, crm_contact_id: Option<&str>) -> Self {
        Contact {
            id: Uuid::new_v4(),
            trainer_id,
            crm_contact_id: crm_contact_id.map(str::to_string),
            opted_out: false,
            messages_sent_today: 0,
            messages_sent_this_week: 0,
            last_message_sent_at: None,
        }
    }

    /// Raw stored counters, before any day/week reset. Timestamps are read
    /// as UTC wall clock.
    pub fn counters(&self) -> ContactComplianceCounters {
        ContactComplianceCounters {
            messages_sent_today: u32::try_from(self.messages_sent_today).unwrap_or(0),
            messages_sent_this_week: u32::try_from(self.messages_sent_this_week).unwrap_or(0),
            last_message_sent_at: self.last_message_sent_at.map(|at| at.naive_utc()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerEdit {
    pub id: i64,
    pub message_id: Uuid,
    pub original_content: String,
    pub edited_content: String,
    pub original_confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrainerEdit {
    pub message_id: Uuid,
    pub original_content: String,
    pub edited_content: String,
    pub original_confidence: Option<f64>,
}

pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let length = content.chars().count();
    if length > MAX_CONTENT_CHARS {
        return Err(ValidationError::ContentTooLong {
            length,
            limit: MAX_CONTENT_CHARS,
        });
    }
    Ok(())
}
