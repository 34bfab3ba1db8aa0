use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::config::UserPolicy;
use crate::schedule;
use crate::state::{BlockReason, UserRuntimeState};

/// Discrete things that happen to a user, published for automations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Login,
    Logout,
    TimeWarning,
    TimeExhausted,
    ScheduleBlocked,
    PauseChanged,
    BonusTime,
    Locked,
    Unlocked,
    SettingsUpdated,
    TimeRequest,
    RequestApproved,
    RequestDenied,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Login => "login",
            EventKind::Logout => "logout",
            EventKind::TimeWarning => "time_warning",
            EventKind::TimeExhausted => "time_exhausted",
            EventKind::ScheduleBlocked => "schedule_blocked",
            EventKind::PauseChanged => "pause_changed",
            EventKind::BonusTime => "bonus_time",
            EventKind::Locked => "locked",
            EventKind::Unlocked => "unlocked",
            EventKind::SettingsUpdated => "settings_updated",
            EventKind::TimeRequest => "time_request",
            EventKind::RequestApproved => "request_approved",
            EventKind::RequestDenied => "request_denied",
        }
    }
}

/// One event record, shaped for transport egress
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, username: &str) -> Self {
        Self {
            kind,
            username: username.to_string(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(kind: EventKind, username: &str, payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::new(kind, username)
        }
    }
}

/// Per-user status record, published after every tick and every command
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub username: String,
    pub active: bool,
    pub usage_minutes: u32,
    pub daily_limit: u32,
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub paused: bool,
    pub bonus_minutes: u32,
    /// Budget minutes left, absent for unlimited users
    pub minutes_remaining: Option<i64>,
    pub termination_failed: bool,
    pub has_pending_request: bool,
}

impl UserStatus {
    pub fn build(
        policy: &UserPolicy,
        state: &UserRuntimeState,
        active: bool,
        termination_failed: bool,
        now: DateTime<Local>,
    ) -> Self {
        let verdict = schedule::evaluate(policy, state, now);

        Self {
            username: state.username.clone(),
            active,
            usage_minutes: state.usage_minutes_today,
            daily_limit: policy.daily_minutes,
            blocked: state.blocked,
            block_reason: state.block_reason,
            paused: state.paused,
            bonus_minutes: state.bonus_minutes,
            minutes_remaining: verdict.minutes_remaining_budget,
            termination_failed,
            has_pending_request: state.pending_request.is_some(),
        }
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        if self.blocked {
            "blocked"
        } else if self.paused {
            "paused"
        } else if self.active {
            "active"
        } else {
            "offline"
        }
    }
}

/// Egress seam. A transport adapter forwards these records to wherever
/// the household dashboard lives; delivery is best effort.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &Event);
    fn status(&self, status: &UserStatus);
}

/// Default sink that writes records to the log
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: &Event) {
        info!(
            target: "timewarden::events",
            "event {} user={} payload={}",
            event.kind.as_str(),
            event.username,
            event.payload
        );
    }

    fn status(&self, status: &UserStatus) {
        info!(
            target: "timewarden::events",
            "status user={} {} usage={}m limit={}m bonus={}m",
            status.username,
            status.label(),
            status.usage_minutes,
            status.daily_limit,
            status.bonus_minutes
        );
    }
}

pub fn pause_changed(username: &str, paused: bool, auto: bool) -> Event {
    let payload = if auto {
        json!({ "paused": paused, "auto": true })
    } else {
        json!({ "paused": paused })
    };
    Event::with_payload(EventKind::PauseChanged, username, payload)
}
