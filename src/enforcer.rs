use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{SharedConfig, UserPolicy};
use crate::events::{self, Event, EventKind, EventSink, UserStatus};
use crate::platform::{Notifier, SessionInspector, SessionTerminator, Urgency};
use crate::schedule::{self, AccessVerdict, VerdictReason};
use crate::state::{BlockReason, StateStore, UserRuntimeState};

/// An elapsed gap larger than this is agent downtime, not screen time,
/// and is dropped instead of billed.
const ACCRUAL_GAP_SECS: i64 = 900;

const TERMINATE_ATTEMPTS: u32 = 3;

/// What one tick did to one user
pub(crate) struct TickOutcome {
    pub auto_resumed: bool,
    /// (threshold, minutes remaining when it fired), largest threshold first
    pub fired: Vec<(u32, i64)>,
    /// Set when the verdict flipped from allowed to not allowed this tick
    pub flipped: Option<BlockReason>,
    pub verdict: AccessVerdict,
}

/// Advance one user's record by one tick.
///
/// Order matters: the day rolls over before anything else so stale
/// counters never feed the verdict, stale pauses resume before accrual so
/// a forgotten pause cannot stop the clock forever, and accrual lands
/// before the verdict so a budget crossed mid-tick blocks on this tick.
pub(crate) fn apply_tick(
    policy: &UserPolicy,
    state: &mut UserRuntimeState,
    now: DateTime<Local>,
    session_active: bool,
) -> TickOutcome {
    let now_utc = now.with_timezone(&Utc);
    let today = now.date_naive();

    if state.last_reset_date != Some(today) {
        state.usage_minutes_today = 0;
        state.warnings_fired_today.clear();
        state.last_reset_date = Some(today);
    }

    let mut auto_resumed = false;
    if state.paused
        && policy.pause_auto_resume_minutes > 0
        && let Some(since) = state.paused_since
    {
        let timeout = ChronoDuration::minutes(policy.pause_auto_resume_minutes as i64);
        if now_utc - since >= timeout {
            state.paused = false;
            state.paused_since = None;
            auto_resumed = true;
        }
    }

    state.session_active = session_active;

    if session_active && !state.paused {
        match state.last_tick {
            None => state.last_tick = Some(now_utc),
            Some(last) => {
                let elapsed = (now_utc - last).num_seconds();
                if !(0..=ACCRUAL_GAP_SECS).contains(&elapsed) {
                    state.last_tick = Some(now_utc);
                } else {
                    let minutes = elapsed / 60;
                    if minutes > 0 {
                        accrue(policy, state, minutes as u32);
                        // Keep the sub-minute remainder for the next tick
                        state.last_tick = Some(last + ChronoDuration::minutes(minutes));
                    }
                }
            }
        }
    } else {
        state.last_tick = Some(now_utc);
    }

    let was_allowed = !state.blocked;
    let verdict = schedule::evaluate(policy, state, now);

    if verdict.allowed {
        state.blocked = false;
        state.block_reason = None;
    } else {
        state.blocked = true;
        state.block_reason = Some(match verdict.reason {
            VerdictReason::ManualLock => BlockReason::ManualLock,
            VerdictReason::ScheduleClosed => BlockReason::Schedule,
            VerdictReason::BudgetExhausted | VerdictReason::Ok => BlockReason::TimeExhausted,
        });
    }

    let flipped = if was_allowed && !verdict.allowed {
        state.block_reason
    } else {
        None
    };

    let mut fired = Vec::new();
    if verdict.allowed
        && let Some(remaining) = verdict.minutes_remaining_budget
    {
        for threshold in policy.warning_thresholds() {
            if remaining <= threshold as i64 && !state.warnings_fired_today.contains(&threshold) {
                state.warnings_fired_today.insert(threshold);
                fired.push((threshold, remaining));
            }
        }
    }

    TickOutcome {
        auto_resumed,
        fired,
        flipped,
        verdict,
    }
}

/// Bonus minutes are spent before the daily budget is touched
fn accrue(policy: &UserPolicy, state: &mut UserRuntimeState, minutes: u32) {
    if policy.daily_minutes > 0 {
        let drained = state.bonus_minutes.min(minutes);
        state.bonus_minutes -= drained;
        state.usage_minutes_today += minutes - drained;
    } else {
        state.usage_minutes_today += minutes;
    }
}

/// The long-lived enforcement loop
pub struct EnforcementLoop {
    config: SharedConfig,
    store: Arc<StateStore>,
    sessions: Arc<dyn SessionInspector>,
    terminator: Arc<dyn SessionTerminator>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
    last_seen: HashSet<String>,
    termination_failed: HashSet<String>,
}

impl EnforcementLoop {
    pub fn new(
        config: SharedConfig,
        store: Arc<StateStore>,
        sessions: Arc<dyn SessionInspector>,
        terminator: Arc<dyn SessionTerminator>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            store,
            sessions,
            terminator,
            notifier,
            sink,
            last_seen: HashSet::new(),
            termination_failed: HashSet::new(),
        }
    }

    /// Tick until shutdown is signalled. The in-flight tick always
    /// completes before the loop exits, so no record is left with an
    /// unaccounted time gap.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval_duration = self.config.read().await.agent.tick_interval();
        let mut interval = tokio::time::interval(interval_duration);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Enforcement loop started, ticking every {}s",
            interval_duration.as_secs()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = std::time::Instant::now();
                    self.tick(Local::now()).await;

                    let took = started.elapsed();
                    if took > interval_duration {
                        warn!("Tick overran its interval, took {:.1}s", took.as_secs_f64());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Enforcement loop stopped");
    }

    /// One pass over every configured user
    pub async fn tick(&mut self, now: DateTime<Local>) {
        let config = self.config.read().await.clone();

        let logged_in = match self.sessions.logged_in_users() {
            Ok(users) => users,
            Err(e) => {
                // Keep the previous view rather than treating everyone
                // as logged out
                warn!("Could not poll sessions: {:#}", e);
                self.last_seen.clone()
            }
        };

        for policy in &config.users {
            if let Err(e) = self.process_user(policy, &logged_in, now).await {
                warn!("Enforcement failed for {}: {:#}", policy.username, e);
            }
        }

        self.last_seen = logged_in;
    }

    async fn process_user(
        &mut self,
        policy: &UserPolicy,
        logged_in: &HashSet<String>,
        now: DateTime<Local>,
    ) -> Result<()> {
        let username = policy.username.as_str();
        let active = logged_in.contains(username);
        let was_active = self.last_seen.contains(username);

        let mut outcome = None;
        let updated = self
            .store
            .atomic_update(username, |state| {
                outcome = Some(apply_tick(policy, state, now, active));
            })
            .await?;
        let Some(outcome) = outcome else {
            return Ok(());
        };

        if active && !was_active {
            info!("User {username} logged in");
            self.sink.event(&Event::new(EventKind::Login, username));
        } else if !active && was_active {
            info!("User {username} logged out");
            self.sink.event(&Event::new(EventKind::Logout, username));
        }

        if outcome.auto_resumed {
            info!("Auto-resumed paused timer for {username}");
            self.sink.event(&events::pause_changed(username, false, true));
            if active {
                let _ = self.notifier.notify(
                    username,
                    "Timer resumed",
                    "Your screen time timer is running again.",
                    Urgency::Normal,
                );
            }
        }

        for (threshold, remaining) in &outcome.fired {
            info!("Time warning for {username}: {remaining} minutes remaining");
            self.sink.event(&Event::with_payload(
                EventKind::TimeWarning,
                username,
                json!({ "minutes_remaining": remaining, "threshold": threshold }),
            ));
            if active {
                let (title, body, urgency) = warning_message(*remaining);
                let _ = self.notifier.notify(username, &title, &body, urgency);
            }
        }

        if let Some(reason) = outcome.flipped {
            warn!("Blocking {username}: {}", reason.as_str());
            let kind = match reason {
                BlockReason::Schedule => EventKind::ScheduleBlocked,
                BlockReason::TimeExhausted => EventKind::TimeExhausted,
                BlockReason::ManualLock => EventKind::Locked,
            };
            self.sink.event(&Event::with_payload(
                kind,
                username,
                json!({ "reason": reason.as_str() }),
            ));

            if active {
                let _ = self.notifier.notify(
                    username,
                    "Time's up!",
                    "Your screen time is over. Logging out now.",
                    Urgency::Critical,
                );
                self.force_terminate(username).await;
            }
        }

        let status = UserStatus::build(
            policy,
            &updated,
            active && outcome.verdict.allowed,
            self.termination_failed.contains(username),
            now,
        );
        self.sink.status(&status);

        Ok(())
    }

    /// Bounded retries; a user that cannot be logged out is flagged in
    /// status and retried on the next blocked tick.
    async fn force_terminate(&mut self, username: &str) {
        for attempt in 1..=TERMINATE_ATTEMPTS {
            match self.terminator.terminate(username) {
                Ok(()) => {
                    self.termination_failed.remove(username);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Termination attempt {attempt}/{TERMINATE_ATTEMPTS} failed for {username}: {:#}",
                        e
                    );
                    if attempt < TERMINATE_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            500 * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }

        error!("Could not terminate sessions for {username}, will retry");
        self.termination_failed.insert(username.to_string());
    }
}

fn warning_message(remaining: i64) -> (String, String, Urgency) {
    if remaining <= 1 {
        (
            "1 minute left!".to_string(),
            "Time to save your work!".to_string(),
            Urgency::Critical,
        )
    } else if remaining <= 5 {
        (
            format!("{remaining} minutes left"),
            "Almost out of time, save your work!".to_string(),
            Urgency::Critical,
        )
    } else {
        (
            format!("{remaining} minutes left"),
            format!("You have {remaining} minutes of screen time remaining."),
            Urgency::Normal,
        )
    }
}
