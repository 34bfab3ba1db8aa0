use chrono::{DateTime, Datelike, Local, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::UserPolicy;
use crate::state::{BlockReason, UserRuntimeState};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// An allowed time-of-day window, half-open `[start, end)`.
///
/// A window whose start is later than its end wraps past midnight
/// (`22:00-02:00` runs until 2 AM the next day). A window whose start
/// equals its end covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl ScheduleWindow {
    /// A window that is open around the clock
    pub fn all_day() -> Self {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        Self {
            start: midnight,
            end: midnight,
        }
    }

    /// Whether `t` falls inside the window. Membership is evaluated at
    /// minute precision.
    pub fn contains(&self, t: NaiveTime) -> bool {
        let t = minute_of_day(t);
        let start = minute_of_day(self.start);
        let end = minute_of_day(self.end);

        if start == end {
            true
        } else if start < end {
            start <= t && t < end
        } else {
            // Wraps past midnight
            t >= start || t < end
        }
    }

    /// Minutes until the window closes, or `None` when `t` is outside it.
    /// An all-day window reports a full day.
    pub fn minutes_until_close(&self, t: NaiveTime) -> Option<i64> {
        if !self.contains(t) {
            return None;
        }

        let t = minute_of_day(t);
        let end = minute_of_day(self.end);
        let diff = (end - t).rem_euclid(MINUTES_PER_DAY);
        Some(if diff == 0 { MINUTES_PER_DAY } else { diff })
    }
}

fn minute_of_day(t: NaiveTime) -> i64 {
    use chrono::Timelike;
    (t.hour() * 60 + t.minute()) as i64
}

impl FromStr for ScheduleWindow {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("schedule must be HH:MM-HH:MM, got '{s}'"))?;

        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
            .map_err(|e| anyhow::anyhow!("invalid start time in '{s}': {e}"))?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
            .map_err(|e| anyhow::anyhow!("invalid end time in '{s}': {e}"))?;

        Ok(Self { start, end })
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

impl Serialize for ScheduleWindow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScheduleWindow {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Weekday and weekend allowed windows for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub weekday: ScheduleWindow,
    pub weekend: ScheduleWindow,
}

impl ScheduleSpec {
    pub fn window_for(&self, day: Weekday) -> ScheduleWindow {
        if is_weekend(day) {
            self.weekend
        } else {
            self.weekday
        }
    }
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            weekday: ScheduleWindow::all_day(),
            weekend: ScheduleWindow::all_day(),
        }
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Why access is (or is not) currently permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Ok,
    ScheduleClosed,
    BudgetExhausted,
    ManualLock,
}

/// Combined schedule and budget decision for one user at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessVerdict {
    pub allowed: bool,
    pub reason: VerdictReason,
    /// Minutes of budget left, `None` when the user is unlimited
    pub minutes_remaining_budget: Option<i64>,
    /// Minutes until the current window closes, `None` when it is closed now
    pub minutes_remaining_schedule: Option<i64>,
}

/// Minutes of daily budget remaining, bonus included. `None` means the
/// user has no daily limit.
pub fn budget_remaining(policy: &UserPolicy, state: &UserRuntimeState) -> Option<i64> {
    if policy.daily_minutes == 0 {
        return None;
    }

    let total = policy.daily_minutes as i64 + state.bonus_minutes as i64;
    Some((total - state.usage_minutes_today as i64).max(0))
}

/// Evaluate whether a user may be using the computer right now.
///
/// Pure function of its inputs so the enforcement loop and the login gate
/// cannot diverge. A manual lock outranks a closed schedule, which
/// outranks an exhausted budget.
pub fn evaluate(policy: &UserPolicy, state: &UserRuntimeState, now: DateTime<Local>) -> AccessVerdict {
    let window = policy.schedule.window_for(now.weekday());
    let in_window = window.contains(now.time());
    let minutes_remaining_schedule = window.minutes_until_close(now.time());
    let minutes_remaining_budget = budget_remaining(policy, state);

    let manual_lock = state.blocked && state.block_reason == Some(BlockReason::ManualLock);
    let budget_ok = minutes_remaining_budget.is_none_or(|m| m > 0);

    let (allowed, reason) = if manual_lock {
        (false, VerdictReason::ManualLock)
    } else if !in_window {
        (false, VerdictReason::ScheduleClosed)
    } else if !budget_ok {
        (false, VerdictReason::BudgetExhausted)
    } else {
        (true, VerdictReason::Ok)
    };

    AccessVerdict {
        allowed,
        reason,
        minutes_remaining_budget,
        minutes_remaining_schedule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn window(s: &str) -> ScheduleWindow {
        s.parse().unwrap()
    }

    // Monday at the given time
    fn monday_at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    fn saturday_at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 13, h, m, 0).unwrap()
    }

    fn policy(daily: u32, weekday: &str, weekend: &str) -> UserPolicy {
        UserPolicy {
            username: "alice".to_string(),
            daily_minutes: daily,
            schedule: ScheduleSpec {
                weekday: window(weekday),
                weekend: window(weekend),
            },
            warnings: vec![10, 5, 1],
            pause_auto_resume_minutes: 30,
        }
    }

    #[test]
    fn parse_valid_window() {
        let w = window("09:00-17:30");
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(17, 29)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("0900-1700".parse::<ScheduleWindow>().is_err());
        assert!("09:00".parse::<ScheduleWindow>().is_err());
        assert!("25:00-17:00".parse::<ScheduleWindow>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let w = window("09:00-17:00");
        assert_eq!(w.to_string(), "09:00-17:00");
        assert_eq!(w.to_string().parse::<ScheduleWindow>().unwrap(), w);
    }

    #[test]
    fn membership_is_half_open() {
        let w = window("09:00-17:00");
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(16, 59)));
        assert!(!w.contains(t(17, 0)));
        assert!(!w.contains(t(8, 59)));
    }

    #[test]
    fn wrapped_window_crosses_midnight() {
        let w = window("22:00-02:00");
        assert!(w.contains(t(23, 30)));
        assert!(w.contains(t(1, 0)));
        assert!(w.contains(t(22, 0)));
        assert!(!w.contains(t(2, 0)));
        assert!(!w.contains(t(10, 0)));
    }

    #[test]
    fn equal_start_and_end_means_all_day() {
        let w = window("00:00-00:00");
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(t(12, 0)));
        assert!(w.contains(t(23, 59)));
    }

    #[test]
    fn minutes_until_close_inside_window() {
        let w = window("09:00-17:00");
        assert_eq!(w.minutes_until_close(t(16, 0)), Some(60));
        assert_eq!(w.minutes_until_close(t(9, 0)), Some(480));
        assert_eq!(w.minutes_until_close(t(17, 0)), None);
    }

    #[test]
    fn minutes_until_close_wrapped() {
        let w = window("22:00-02:00");
        assert_eq!(w.minutes_until_close(t(23, 0)), Some(180));
        assert_eq!(w.minutes_until_close(t(1, 0)), Some(60));
        assert_eq!(w.minutes_until_close(t(12, 0)), None);
    }

    #[test]
    fn spec_picks_weekend_window_on_saturday() {
        let spec = ScheduleSpec {
            weekday: window("15:00-20:00"),
            weekend: window("09:00-21:00"),
        };
        assert!(spec.window_for(Weekday::Sat).contains(t(10, 0)));
        assert!(!spec.window_for(Weekday::Mon).contains(t(10, 0)));
    }

    #[test]
    fn budget_remaining_basic_math() {
        let p = policy(180, "00:00-00:00", "00:00-00:00");
        let mut s = UserRuntimeState::new("alice");
        s.usage_minutes_today = 170;

        assert_eq!(budget_remaining(&p, &s), Some(10));

        s.bonus_minutes = 15;
        assert_eq!(budget_remaining(&p, &s), Some(25));
    }

    #[test]
    fn budget_remaining_never_negative() {
        let p = policy(60, "00:00-00:00", "00:00-00:00");
        let mut s = UserRuntimeState::new("alice");
        s.usage_minutes_today = 90;
        assert_eq!(budget_remaining(&p, &s), Some(0));
    }

    #[test]
    fn budget_unlimited_when_zero() {
        let p = policy(0, "00:00-00:00", "00:00-00:00");
        let mut s = UserRuntimeState::new("alice");
        s.usage_minutes_today = 9999;
        assert_eq!(budget_remaining(&p, &s), None);

        let verdict = evaluate(&p, &s, monday_at(12, 0));
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::Ok);
    }

    #[test]
    fn verdict_allows_within_schedule_and_budget() {
        let p = policy(120, "09:00-17:00", "09:00-21:00");
        let mut s = UserRuntimeState::new("alice");
        s.usage_minutes_today = 60;

        let verdict = evaluate(&p, &s, monday_at(12, 0));
        assert!(verdict.allowed);
        assert_eq!(verdict.minutes_remaining_budget, Some(60));
        assert_eq!(verdict.minutes_remaining_schedule, Some(300));
    }

    #[test]
    fn verdict_denies_outside_schedule() {
        let p = policy(120, "09:00-17:00", "09:00-21:00");
        let s = UserRuntimeState::new("alice");

        let verdict = evaluate(&p, &s, monday_at(20, 0));
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::ScheduleClosed);
        assert_eq!(verdict.minutes_remaining_schedule, None);
    }

    #[test]
    fn verdict_uses_weekend_window_on_saturday() {
        let p = policy(0, "15:00-20:00", "09:00-21:00");
        let s = UserRuntimeState::new("alice");

        assert!(evaluate(&p, &s, saturday_at(10, 0)).allowed);
        assert!(!evaluate(&p, &s, monday_at(10, 0)).allowed);
    }

    #[test]
    fn verdict_denies_exhausted_budget() {
        let p = policy(60, "00:00-00:00", "00:00-00:00");
        let mut s = UserRuntimeState::new("alice");
        s.usage_minutes_today = 60;

        let verdict = evaluate(&p, &s, monday_at(12, 0));
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::BudgetExhausted);
        assert_eq!(verdict.minutes_remaining_budget, Some(0));
    }

    #[test]
    fn manual_lock_outranks_everything() {
        let p = policy(60, "09:00-17:00", "09:00-17:00");
        let mut s = UserRuntimeState::new("alice");
        s.usage_minutes_today = 60;
        s.blocked = true;
        s.block_reason = Some(BlockReason::ManualLock);

        // Outside schedule and over budget, but the reason is the lock
        let verdict = evaluate(&p, &s, monday_at(20, 0));
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::ManualLock);
    }

    #[test]
    fn stale_block_flag_does_not_deny_by_itself() {
        let p = policy(120, "00:00-00:00", "00:00-00:00");
        let mut s = UserRuntimeState::new("alice");
        s.blocked = true;
        s.block_reason = Some(BlockReason::TimeExhausted);

        // Usage is back under budget, so the old flag no longer applies
        let verdict = evaluate(&p, &s, monday_at(12, 0));
        assert!(verdict.allowed);
    }
}
