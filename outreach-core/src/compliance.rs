//! Admission control for outbound messages.
//!
//! Everything here is pure: callers hand in a proposed local send time, the
//! contact's stored counters and the trainer's settings, and get back a
//! [`Decision`]. Nothing is written. Counters only move through
//! [`ContactComplianceCounters::incremented`], which the store applies after a
//! confirmed send.
//!
//! Times are naive wall-clock values. No timezone conversion happens here.

use chrono::{Days, Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

pub const DEFAULT_QUIET_HOURS_START_HOUR: u32 = 8;
pub const DEFAULT_QUIET_HOURS_END_HOUR: u32 = 21;
pub const DEFAULT_FREQUENCY_CAP_DAILY: u32 = 3;
pub const DEFAULT_FREQUENCY_CAP_WEEKLY: u32 = 5;

/// Per-trainer sending rules. `quiet_hours_start..quiet_hours_end` is the
/// window in which sends are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerComplianceConfig {
    pub quiet_hours_start: NaiveTime,
    pub quiet_hours_end: NaiveTime,
    pub frequency_cap_daily: u32,
    pub frequency_cap_weekly: u32,
}

impl Default for TrainerComplianceConfig {
    fn default() -> Self {
        TrainerComplianceConfig {
            quiet_hours_start: NaiveTime::from_hms_opt(DEFAULT_QUIET_HOURS_START_HOUR, 0, 0)
                .unwrap_or_default(),
            quiet_hours_end: NaiveTime::from_hms_opt(DEFAULT_QUIET_HOURS_END_HOUR, 0, 0)
                .unwrap_or_default(),
            frequency_cap_daily: DEFAULT_FREQUENCY_CAP_DAILY,
            frequency_cap_weekly: DEFAULT_FREQUENCY_CAP_WEEKLY,
        }
    }
}

impl TrainerComplianceConfig {
    /// Windows that wrap past midnight are not supported.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if minute_of_day(self.quiet_hours_end) <= minute_of_day(self.quiet_hours_start) {
            return Err(ValidationError::InvalidQuietHours {
                start: self.quiet_hours_start,
                end: self.quiet_hours_end,
            });
        }
        Ok(())
    }
}

/// Per-contact send counters as stored. Day and week resets are applied
/// lazily by [`effective`](Self::effective).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactComplianceCounters {
    pub messages_sent_today: u32,
    pub messages_sent_this_week: u32,
    pub last_message_sent_at: Option<NaiveDateTime>,
}

impl ContactComplianceCounters {
    /// Counters as they stand at `now`: today's count is zero unless the last
    /// send fell on `now`'s calendar day, the week's count is zero once seven
    /// days have passed since the last send.
    pub fn effective(&self, now: NaiveDateTime) -> Self {
        let Some(last) = self.last_message_sent_at else {
            return ContactComplianceCounters::default();
        };

        let today = if last.date() == now.date() {
            self.messages_sent_today
        } else {
            0
        };
        let week = if now.signed_duration_since(last) >= Duration::days(7) {
            0
        } else {
            self.messages_sent_this_week
        };

        ContactComplianceCounters {
            messages_sent_today: today,
            messages_sent_this_week: week,
            last_message_sent_at: Some(last),
        }
    }

    /// Reset-then-increment for one confirmed send at `at`.
    pub fn incremented(&self, at: NaiveDateTime) -> Self {
        let current = self.effective(at);
        ContactComplianceCounters {
            messages_sent_today: current.messages_sent_today.saturating_add(1),
            messages_sent_this_week: current.messages_sent_this_week.saturating_add(1),
            last_message_sent_at: Some(at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapLimit {
    Daily,
    Weekly,
}

impl fmt::Display for CapLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapLimit::Daily => f.write_str("daily"),
            CapLimit::Weekly => f.write_str("weekly"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Denial {
    QuietHours { next_available: NaiveDateTime },
    FrequencyCap { limit: CapLimit, sent: u32, cap: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietHours {
    Open,
    Closed { next_available: NaiveDateTime },
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Checks `proposed` against the half-open `[start, end)` window, compared at
/// minute resolution.
///
/// A closed window always defers to the *next* calendar day's opening, even
/// when `proposed` is earlier than today's opening: 06:00 with an 08:00 start
/// yields tomorrow 08:00, not today. Callers and their tests rely on this.
pub fn check_quiet_hours(
    proposed: NaiveDateTime,
    config: &TrainerComplianceConfig,
) -> Result<QuietHours, ValidationError> {
    config.validate()?;

    let minute = minute_of_day(proposed.time());
    let start = minute_of_day(config.quiet_hours_start);
    let end = minute_of_day(config.quiet_hours_end);

    if minute >= start && minute < end {
        return Ok(QuietHours::Open);
    }

    let next_day = proposed
        .date()
        .checked_add_days(Days::new(1))
        .ok_or(ValidationError::DateOutOfRange(proposed.date()))?;
    let opening = config
        .quiet_hours_start
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(config.quiet_hours_start);

    Ok(QuietHours::Closed {
        next_available: next_day.and_time(opening),
    })
}

/// Daily cap is checked before weekly.
pub fn check_frequency_cap(
    counters: &ContactComplianceCounters,
    now: NaiveDateTime,
    config: &TrainerComplianceConfig,
) -> Decision {
    let current = counters.effective(now);
    let today = current.messages_sent_today;
    let week = current.messages_sent_this_week;

    if today >= config.frequency_cap_daily {
        return Decision::Denied(Denial::FrequencyCap {
            limit: CapLimit::Daily,
            sent: today,
            cap: config.frequency_cap_daily,
        });
    }
    if week >= config.frequency_cap_weekly {
        return Decision::Denied(Denial::FrequencyCap {
            limit: CapLimit::Weekly,
            sent: week,
            cap: config.frequency_cap_weekly,
        });
    }

    Decision::Allowed {
        remaining: (config.frequency_cap_daily - today).min(config.frequency_cap_weekly - week),
    }
}

/// Full admission check. Quiet hours short-circuit: frequency caps are only
/// consulted inside the window.
pub fn evaluate(
    proposed: NaiveDateTime,
    counters: &ContactComplianceCounters,
    config: &TrainerComplianceConfig,
) -> Result<Decision, ValidationError> {
    match check_quiet_hours(proposed, config)? {
        QuietHours::Closed { next_available } => {
            Ok(Decision::Denied(Denial::QuietHours { next_available }))
        }
        QuietHours::Open => Ok(check_frequency_cap(counters, proposed, config)),
    }
}
