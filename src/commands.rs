use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{SharedConfig, UserPolicy};
use crate::events::{self, Event, EventKind, EventSink, UserStatus};
use crate::platform::{Notifier, SessionTerminator, Urgency};
use crate::schedule::ScheduleWindow;
use crate::state::{BlockReason, PendingRequest, StateStore};

/// A remote mutation request, as delivered by whatever transport the
/// household uses. An omitted `user` targets every configured user.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandRequest {
    Lock {
        user: Option<String>,
    },
    Unlock {
        user: Option<String>,
    },
    Pause {
        user: Option<String>,
    },
    Resume {
        user: Option<String>,
    },
    AddBonus {
        user: Option<String>,
        minutes: i64,
    },
    UpdateSettings {
        user: Option<String>,
        fields: SettingsPatch,
    },
    RequestTime {
        user: String,
        #[serde(default = "default_request_minutes")]
        minutes: i64,
        #[serde(default)]
        reason: String,
    },
    ApproveRequest {
        user: Option<String>,
    },
    DenyRequest {
        user: Option<String>,
    },
}

fn default_request_minutes() -> i64 {
    15
}

/// Partial policy update. Every present field is validated before any of
/// them is applied.
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct SettingsPatch {
    pub daily_minutes: Option<i64>,
    pub weekday: Option<String>,
    pub weekend: Option<String>,
    pub warnings: Option<Vec<i64>>,
    pub pause_auto_resume_minutes: Option<i64>,
}

impl SettingsPatch {
    fn validate(&self) -> Result<ValidatedPatch> {
        let daily_minutes = match self.daily_minutes {
            Some(m) if m < 0 => anyhow::bail!("daily_minutes must not be negative, got {m}"),
            Some(m) => Some(m as u32),
            None => None,
        };

        let weekday = self
            .weekday
            .as_deref()
            .map(|s| s.parse::<ScheduleWindow>())
            .transpose()
            .context("Invalid weekday schedule")?;
        let weekend = self
            .weekend
            .as_deref()
            .map(|s| s.parse::<ScheduleWindow>())
            .transpose()
            .context("Invalid weekend schedule")?;

        let warnings = match &self.warnings {
            Some(list) => {
                let mut out = Vec::with_capacity(list.len());
                for &w in list {
                    if w < 0 {
                        anyhow::bail!("Warning threshold must not be negative, got {w}");
                    }
                    out.push(w as u32);
                }
                Some(out)
            }
            None => None,
        };

        let pause_auto_resume_minutes = match self.pause_auto_resume_minutes {
            Some(m) if m < 0 => {
                anyhow::bail!("pause_auto_resume_minutes must not be negative, got {m}")
            }
            Some(m) => Some(m as u32),
            None => None,
        };

        Ok(ValidatedPatch {
            daily_minutes,
            weekday,
            weekend,
            warnings,
            pause_auto_resume_minutes,
        })
    }
}

struct ValidatedPatch {
    daily_minutes: Option<u32>,
    weekday: Option<ScheduleWindow>,
    weekend: Option<ScheduleWindow>,
    warnings: Option<Vec<u32>>,
    pause_auto_resume_minutes: Option<u32>,
}

impl ValidatedPatch {
    fn apply_to(&self, policy: &mut UserPolicy) {
        if let Some(m) = self.daily_minutes {
            policy.daily_minutes = m;
        }
        if let Some(w) = self.weekday {
            policy.schedule.weekday = w;
        }
        if let Some(w) = self.weekend {
            policy.schedule.weekend = w;
        }
        if let Some(w) = &self.warnings {
            policy.warnings = w.clone();
        }
        if let Some(m) = self.pause_auto_resume_minutes {
            policy.pause_auto_resume_minutes = m;
        }
    }
}

/// Applies remote commands to the state store and emits the resulting
/// events and statuses. A command that fails validation mutates nothing.
pub struct CommandProcessor {
    config: SharedConfig,
    store: Arc<StateStore>,
    terminator: Arc<dyn SessionTerminator>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
}

impl CommandProcessor {
    pub fn new(
        config: SharedConfig,
        store: Arc<StateStore>,
        terminator: Arc<dyn SessionTerminator>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            store,
            terminator,
            notifier,
            sink,
        }
    }

    pub async fn apply(&self, command: CommandRequest) -> Result<Vec<UserStatus>> {
        match command {
            CommandRequest::Lock { user } => self.lock(user).await,
            CommandRequest::Unlock { user } => self.unlock(user).await,
            CommandRequest::Pause { user } => self.set_paused(user, true).await,
            CommandRequest::Resume { user } => self.set_paused(user, false).await,
            CommandRequest::AddBonus { user, minutes } => self.add_bonus(user, minutes).await,
            CommandRequest::UpdateSettings { user, fields } => {
                self.update_settings(user, fields).await
            }
            CommandRequest::RequestTime {
                user,
                minutes,
                reason,
            } => self.request_time(user, minutes, reason).await,
            CommandRequest::ApproveRequest { user } => self.approve_request(user).await,
            CommandRequest::DenyRequest { user } => self.deny_request(user).await,
        }
    }

    async fn lock(&self, user: Option<String>) -> Result<Vec<UserStatus>> {
        let targets = self.resolve_targets(user).await?;
        let mut statuses = Vec::new();

        for username in &targets {
            let updated = self
                .store
                .atomic_update(username, |state| {
                    state.blocked = true;
                    state.block_reason = Some(BlockReason::ManualLock);
                })
                .await?;

            info!("Locked {username}");
            if let Err(e) = self.terminator.terminate(username) {
                warn!("Could not terminate sessions for {username}: {:#}", e);
            }

            self.sink.event(&Event::new(EventKind::Locked, username));
            statuses.push(self.status_for(username, &updated).await);
        }

        Ok(statuses)
    }

    async fn unlock(&self, user: Option<String>) -> Result<Vec<UserStatus>> {
        let targets = self.resolve_targets(user).await?;
        let mut statuses = Vec::new();

        for username in &targets {
            let updated = self
                .store
                .atomic_update(username, |state| {
                    state.blocked = false;
                    state.block_reason = None;
                })
                .await?;

            info!("Unlocked {username}");
            self.sink.event(&Event::new(EventKind::Unlocked, username));
            statuses.push(self.status_for(username, &updated).await);
        }

        Ok(statuses)
    }

    async fn set_paused(&self, user: Option<String>, paused: bool) -> Result<Vec<UserStatus>> {
        let targets = self.resolve_targets(user).await?;
        let mut statuses = Vec::new();

        for username in &targets {
            let updated = self
                .store
                .atomic_update(username, |state| {
                    if paused && !state.paused {
                        state.paused = true;
                        state.paused_since = Some(Utc::now());
                    } else if !paused {
                        state.paused = false;
                        state.paused_since = None;
                    }
                })
                .await?;

            info!(
                "{} timer for {username}",
                if paused { "Paused" } else { "Resumed" }
            );
            self.sink.event(&events::pause_changed(username, paused, false));

            let (title, body) = if paused {
                ("Timer paused", "Your screen time timer has been paused.")
            } else {
                ("Timer resumed", "Your screen time timer is running again.")
            };
            let _ = self.notifier.notify(username, title, body, Urgency::Normal);

            statuses.push(self.status_for(username, &updated).await);
        }

        Ok(statuses)
    }

    async fn add_bonus(&self, user: Option<String>, minutes: i64) -> Result<Vec<UserStatus>> {
        if minutes < 0 {
            anyhow::bail!("Bonus minutes must not be negative, got {minutes}");
        }
        let targets = self.resolve_targets(user).await?;
        let mut statuses = Vec::new();

        for username in &targets {
            if minutes == 0 {
                if let Some(state) = self.store.get(username).await {
                    statuses.push(self.status_for(username, &state).await);
                }
                continue;
            }

            let updated = self
                .store
                .atomic_update(username, |state| {
                    state.bonus_minutes = state.bonus_minutes.saturating_add(minutes as u32);
                    // Fresh minutes lift a time-exhausted block right away
                    if state.blocked && state.block_reason == Some(BlockReason::TimeExhausted) {
                        state.blocked = false;
                        state.block_reason = None;
                    }
                })
                .await?;

            info!(
                "Added {minutes} bonus minutes for {username} (total bonus: {})",
                updated.bonus_minutes
            );
            self.sink.event(&Event::with_payload(
                EventKind::BonusTime,
                username,
                json!({ "minutes": minutes }),
            ));
            let _ = self.notifier.notify(
                username,
                "Bonus time!",
                &format!("You've been given {minutes} extra minutes of screen time."),
                Urgency::Normal,
            );

            statuses.push(self.status_for(username, &updated).await);
        }

        Ok(statuses)
    }

    async fn update_settings(
        &self,
        user: Option<String>,
        fields: SettingsPatch,
    ) -> Result<Vec<UserStatus>> {
        let patch = fields.validate()?;
        let targets = self.resolve_targets(user).await?;

        {
            let mut config = self.config.write().await;
            let mut updated = config.clone();
            for policy in updated
                .users
                .iter_mut()
                .filter(|p| targets.contains(&p.username))
            {
                patch.apply_to(policy);
            }
            updated.validate()?;
            *config = updated;
        }

        let mut statuses = Vec::new();
        for username in &targets {
            info!("Updated settings for {username}");
            self.sink.event(&Event::with_payload(
                EventKind::SettingsUpdated,
                username,
                serde_json::to_value(&fields).unwrap_or_default(),
            ));

            if let Some(state) = self.store.get(username).await {
                statuses.push(self.status_for(username, &state).await);
            }
        }

        Ok(statuses)
    }

    async fn request_time(
        &self,
        user: String,
        minutes: i64,
        reason: String,
    ) -> Result<Vec<UserStatus>> {
        if minutes <= 0 {
            anyhow::bail!("Requested minutes must be positive, got {minutes}");
        }
        let targets = self.resolve_targets(Some(user)).await?;
        let username = &targets[0];

        let request = PendingRequest {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            minutes: minutes as u32,
            reason: reason.clone(),
            created_at: Utc::now(),
        };
        let request_id = request.id.clone();

        let updated = self
            .store
            .atomic_update(username, |state| {
                state.pending_request = Some(request);
            })
            .await?;

        info!("Time request from {username}: {minutes} minutes");
        self.sink.event(&Event::with_payload(
            EventKind::TimeRequest,
            username,
            json!({ "request_id": request_id, "minutes": minutes, "reason": reason }),
        ));
        let _ = self.notifier.notify(
            username,
            "Request sent",
            "Your request for more time has been sent to your parent.",
            Urgency::Normal,
        );

        Ok(vec![self.status_for(username, &updated).await])
    }

    async fn approve_request(&self, user: Option<String>) -> Result<Vec<UserStatus>> {
        let targets = self.resolve_targets(user).await?;
        let mut statuses = Vec::new();

        for username in &targets {
            // Broadcasts skip users with nothing pending rather than
            // materializing empty records for them
            let has_pending = self
                .store
                .get(username)
                .await
                .is_some_and(|s| s.pending_request.is_some());
            if !has_pending {
                continue;
            }

            let mut granted = None;
            let updated = self
                .store
                .atomic_update(username, |state| {
                    if let Some(request) = state.pending_request.take() {
                        state.bonus_minutes = state.bonus_minutes.saturating_add(request.minutes);
                        if state.blocked && state.block_reason == Some(BlockReason::TimeExhausted) {
                            state.blocked = false;
                            state.block_reason = None;
                        }
                        granted = Some(request.minutes);
                    }
                })
                .await?;

            if let Some(minutes) = granted {
                info!("Approved time request for {username}: {minutes} minutes");
                self.sink.event(&Event::with_payload(
                    EventKind::RequestApproved,
                    username,
                    json!({ "minutes": minutes }),
                ));
                let _ = self.notifier.notify(
                    username,
                    "Request approved",
                    &format!("You got {minutes} extra minutes. Have fun!"),
                    Urgency::Normal,
                );
                statuses.push(self.status_for(username, &updated).await);
            }
        }

        Ok(statuses)
    }

    async fn deny_request(&self, user: Option<String>) -> Result<Vec<UserStatus>> {
        let targets = self.resolve_targets(user).await?;
        let mut statuses = Vec::new();

        for username in &targets {
            let has_pending = self
                .store
                .get(username)
                .await
                .is_some_and(|s| s.pending_request.is_some());
            if !has_pending {
                continue;
            }

            let mut denied = false;
            let updated = self
                .store
                .atomic_update(username, |state| {
                    denied = state.pending_request.take().is_some();
                })
                .await?;

            if denied {
                info!("Denied time request for {username}");
                self.sink
                    .event(&Event::new(EventKind::RequestDenied, username));
                let _ = self.notifier.notify(
                    username,
                    "Request denied",
                    "Your request for more time was denied.",
                    Urgency::Normal,
                );
                statuses.push(self.status_for(username, &updated).await);
            }
        }

        Ok(statuses)
    }

    /// Expand an optional username into the list of configured targets
    async fn resolve_targets(&self, user: Option<String>) -> Result<Vec<String>> {
        let config = self.config.read().await;

        match user {
            Some(username) => {
                if config.get_user(&username).is_none() {
                    anyhow::bail!("Unknown user: {username}");
                }
                Ok(vec![username])
            }
            None => Ok(config.users.iter().map(|u| u.username.clone()).collect()),
        }
    }

    async fn status_for(
        &self,
        username: &str,
        state: &crate::state::UserRuntimeState,
    ) -> UserStatus {
        let config = self.config.read().await;
        let policy = config.get_user(username).cloned().unwrap_or(UserPolicy {
            username: username.to_string(),
            daily_minutes: 0,
            schedule: Default::default(),
            warnings: Vec::new(),
            pause_auto_resume_minutes: 0,
        });

        let status =
            UserStatus::build(&policy, state, state.session_active, false, chrono::Local::now());
        self.sink.status(&status);
        status
    }
}
