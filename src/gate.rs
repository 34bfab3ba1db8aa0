use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::Path;

use crate::config::Config;
use crate::schedule::{self, VerdictReason};
use crate::state::{self, UserRuntimeState};

/// Outcome of a login-time check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    /// Human-readable denial reason, shown to the user at the prompt
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decide a login attempt from a policy and a state snapshot.
///
/// Counters persisted on a previous day are read as already reset, so a
/// user blocked for yesterday's budget is let back in after midnight even
/// if the agent has not ticked yet.
pub fn check_login(
    config: &Config,
    states: &HashMap<String, UserRuntimeState>,
    username: &str,
    now: DateTime<Local>,
) -> GateDecision {
    let Some(policy) = config.get_user(username) else {
        // Not under enforcement
        return GateDecision::allow();
    };

    let state = states
        .get(username)
        .map(|s| s.rolled_over(now.date_naive()))
        .unwrap_or_else(|| UserRuntimeState::new(username));

    let verdict = schedule::evaluate(policy, &state, now);
    if verdict.allowed {
        return GateDecision::allow();
    }

    GateDecision::deny(match verdict.reason {
        VerdictReason::ManualLock => "Access is currently locked".to_string(),
        VerdictReason::ScheduleClosed => "Login not allowed at this time".to_string(),
        VerdictReason::BudgetExhausted => "Daily time limit reached".to_string(),
        VerdictReason::Ok => "Access denied".to_string(),
    })
}

/// Login check against the on-disk config and state.
///
/// FAILS OPEN on purpose: a missing or corrupt state file, an unreadable
/// config, or an unknown username all allow the login. An enforcement
/// outage must never lock the whole household out of the machine. This is
/// the opposite of the enforcement loop's write path, which keeps the
/// previous state when a write fails.
pub fn pam_check(config_path: &Path, username: &str, now: DateTime<Local>) -> GateDecision {
    let Ok(config) = Config::load(config_path) else {
        return GateDecision::allow();
    };

    let states = state::load_records(&config.state_path()).unwrap_or_default();

    check_login(&config, &states, username, now)
}
