use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::platform::common::{atomic_write, set_permissions_readable_all};

/// Why a user is currently blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    TimeExhausted,
    Schedule,
    ManualLock,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::TimeExhausted => "time_exhausted",
            BlockReason::Schedule => "schedule",
            BlockReason::ManualLock => "manual_lock",
        }
    }
}

/// A child's request for extra time, awaiting a parent's decision
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PendingRequest {
    pub id: String,
    pub minutes: u32,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Runtime state for a single user. Persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserRuntimeState {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub usage_minutes_today: u32,

    /// Local calendar day the counters belong to
    #[serde(default)]
    pub last_reset_date: Option<NaiveDate>,

    #[serde(default)]
    pub session_active: bool,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub paused_since: Option<DateTime<Utc>>,

    /// Extra minutes, drained before usage counts against the daily budget
    #[serde(default)]
    pub bonus_minutes: u32,

    #[serde(default)]
    pub blocked: bool,

    #[serde(default)]
    pub block_reason: Option<BlockReason>,

    /// Thresholds already announced today
    #[serde(default)]
    pub warnings_fired_today: BTreeSet<u32>,

    /// Instant usage was last accounted up to
    #[serde(default)]
    pub last_tick: Option<DateTime<Utc>>,

    #[serde(default)]
    pub pending_request: Option<PendingRequest>,
}

impl UserRuntimeState {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            usage_minutes_today: 0,
            last_reset_date: None,
            session_active: false,
            paused: false,
            paused_since: None,
            bonus_minutes: 0,
            blocked: false,
            block_reason: None,
            warnings_fired_today: BTreeSet::new(),
            last_tick: None,
            pending_request: None,
        }
    }

    /// View of this record as of `today`. Counters persisted on a previous
    /// day are stale and read as already reset.
    pub fn rolled_over(&self, today: NaiveDate) -> UserRuntimeState {
        if self.last_reset_date == Some(today) {
            return self.clone();
        }

        let mut state = self.clone();
        state.usage_minutes_today = 0;
        state.warnings_fired_today.clear();
        state
    }
}

const STATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct StateFile<'a> {
    version: u32,
    users: &'a HashMap<String, UserRuntimeState>,
}

/// Durable store of per-user runtime state.
///
/// Each record sits behind its own lock so an update to one user never
/// waits on an update to another. Every successful mutation rewrites the
/// state file atomically; a failed rewrite leaves the previous file intact.
pub struct StateStore {
    path: PathBuf,
    records: RwLock<HashMap<String, Arc<Mutex<UserRuntimeState>>>>,
    io: Mutex<()>,
}

impl StateStore {
    /// Open the store at `path`, creating an empty one if the file is
    /// missing. An unparsable file is quarantined and replaced rather
    /// than aborting the agent.
    pub fn open(path: &Path) -> Self {
        let users = match load_records(path) {
            Ok(users) => users,
            Err(e) => {
                warn!("State file {} unreadable: {:#}", path.display(), e);
                quarantine(path);
                HashMap::new()
            }
        };

        let records = users
            .into_iter()
            .map(|(name, state)| (name, Arc::new(Mutex::new(state))))
            .collect();

        Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
            io: Mutex::new(()),
        }
    }

    /// Read-modify-write one user's record and persist the result.
    ///
    /// The record is created with defaults on first encounter. Returns the
    /// state after mutation. On a persist failure the in-memory record
    /// keeps the new value and the previous file version stays on disk.
    pub async fn atomic_update<F>(&self, username: &str, mutate: F) -> Result<UserRuntimeState>
    where
        F: FnOnce(&mut UserRuntimeState),
    {
        let record = self.record(username).await;

        let updated = {
            let mut state = record.lock().await;
            mutate(&mut state);
            state.clone()
        };

        self.persist().await?;
        Ok(updated)
    }

    /// Current state of one user, if a record exists
    pub async fn get(&self, username: &str) -> Option<UserRuntimeState> {
        let records = self.records.read().await;
        let record = records.get(username)?.clone();
        drop(records);

        Some(record.lock().await.clone())
    }

    /// Copy of every record. Writers are only held up for the per-record
    /// clone, never for the whole pass.
    pub async fn snapshot(&self) -> HashMap<String, UserRuntimeState> {
        let records: Vec<(String, Arc<Mutex<UserRuntimeState>>)> = {
            let map = self.records.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut snapshot = HashMap::with_capacity(records.len());
        for (name, record) in records {
            snapshot.insert(name, record.lock().await.clone());
        }
        snapshot
    }

    async fn record(&self, username: &str) -> Arc<Mutex<UserRuntimeState>> {
        {
            let records = self.records.read().await;
            if let Some(record) = records.get(username) {
                return record.clone();
            }
        }

        let mut records = self.records.write().await;
        records
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserRuntimeState::new(username))))
            .clone()
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.io.lock().await;

        let users = self.snapshot().await;
        let file = StateFile {
            version: STATE_VERSION,
            users: &users,
        };

        let content = serde_json::to_string_pretty(&file).context("Failed to serialize state")?;

        atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;

        // The login gate and status tools read this file as other users
        set_permissions_readable_all(&self.path)?;

        Ok(())
    }
}

/// Read the persisted records without opening a store. Used by the login
/// gate and the status command, which must not contend with the daemon.
///
/// A record that fails to parse is replaced with defaults for that user;
/// only a file that is unreadable as a whole is an error.
pub fn load_records(path: &Path) -> Result<HashMap<String, UserRuntimeState>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;

    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    let mut users = HashMap::new();
    let Some(raw_users) = value.get("users") else {
        return Ok(users);
    };
    let raw_users = raw_users
        .as_object()
        .context("State file 'users' is not an object")?;

    for (name, raw) in raw_users {
        let mut state: UserRuntimeState = match serde_json::from_value(raw.clone()) {
            Ok(state) => state,
            Err(e) => {
                warn!("Corrupt state record for {name}, regenerating defaults: {e}");
                UserRuntimeState::new(name)
            }
        };
        state.username = name.clone();
        users.insert(name.clone(), state);
    }

    Ok(users)
}

fn quarantine(path: &Path) {
    let backup = path.with_extension("corrupt");
    if let Err(e) = std::fs::rename(path, &backup) {
        warn!(
            "Could not move corrupt state file aside to {}: {e}",
            backup.display()
        );
    } else {
        warn!("Corrupt state file moved to {}", backup.display());
    }
}

/// Default on-disk location, with a per-user fallback for unprivileged runs
pub fn default_state_path() -> PathBuf {
    if crate::config::is_root() {
        return PathBuf::from("/var/lib/timewarden/state.json");
    }

    if let Some(dirs) = directories::BaseDirs::new() {
        let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
        return base.join("timewarden").join("state.json");
    }

    PathBuf::from("/var/lib/timewarden/state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    #[test]
    fn new_state_has_defaults() {
        let state = UserRuntimeState::new("kid");
        assert_eq!(state.username, "kid");
        assert_eq!(state.usage_minutes_today, 0);
        assert!(!state.blocked);
        assert!(!state.paused);
        assert_eq!(state.bonus_minutes, 0);
        assert!(state.warnings_fired_today.is_empty());
    }

    #[test]
    fn rolled_over_resets_stale_counters() {
        let mut state = UserRuntimeState::new("kid");
        state.usage_minutes_today = 90;
        state.warnings_fired_today.insert(10);
        state.bonus_minutes = 5;
        state.last_reset_date = NaiveDate::from_ymd_opt(2024, 1, 14);

        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let view = state.rolled_over(today);

        assert_eq!(view.usage_minutes_today, 0);
        assert!(view.warnings_fired_today.is_empty());
        assert_eq!(view.bonus_minutes, 5);

        // Same-day view is unchanged
        state.last_reset_date = Some(today);
        let view = state.rolled_over(today);
        assert_eq!(view.usage_minutes_today, 90);
    }

    #[tokio::test]
    async fn atomic_update_creates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_state_path(&dir);

        let store = StateStore::open(&path);
        let state = store
            .atomic_update("kid", |s| s.usage_minutes_today = 42)
            .await
            .unwrap();
        assert_eq!(state.usage_minutes_today, 42);

        // A fresh store sees the persisted record
        let store = StateStore::open(&path);
        let state = store.get("kid").await.unwrap();
        assert_eq!(state.usage_minutes_today, 42);
        assert_eq!(state.username, "kid");
    }

    #[tokio::test]
    async fn snapshot_contains_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&temp_state_path(&dir));

        store.atomic_update("alice", |_| {}).await.unwrap();
        store
            .atomic_update("bob", |s| s.bonus_minutes = 15)
            .await
            .unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["bob"].bonus_minutes, 15);
    }

    #[tokio::test]
    async fn concurrent_updates_touch_distinct_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(&temp_state_path(&dir)));

        store
            .atomic_update("alice", |s| s.usage_minutes_today = 100)
            .await
            .unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .atomic_update("alice", |s| s.usage_minutes_today += 1)
                    .await
                    .unwrap()
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .atomic_update("bob", |s| s.bonus_minutes = 30)
                    .await
                    .unwrap()
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.usage_minutes_today, 101);
        assert_eq!(b.bonus_minutes, 30);

        // Neither update was lost or crossed records
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot["alice"].usage_minutes_today, 101);
        assert_eq!(snapshot["alice"].bonus_minutes, 0);
        assert_eq!(snapshot["bob"].bonus_minutes, 30);
    }

    #[tokio::test]
    async fn corrupt_record_regenerates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_state_path(&dir);

        std::fs::write(
            &path,
            r#"{"version":1,"users":{"kid":{"usage_minutes_today":"not a number"},"ok":{"usage_minutes_today":7}}}"#,
        )
        .unwrap();

        let store = StateStore::open(&path);
        assert_eq!(store.get("kid").await.unwrap().usage_minutes_today, 0);
        assert_eq!(store.get("ok").await.unwrap().usage_minutes_today, 7);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_state_path(&dir);

        std::fs::write(&path, "{ not json").unwrap();

        let store = StateStore::open(&path);
        assert!(store.snapshot().await.is_empty());
        assert!(path.with_extension("corrupt").exists());

        // The store still accepts writes afterwards
        store.atomic_update("kid", |_| {}).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn stray_temp_file_does_not_shadow_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_state_path(&dir);

        let store = StateStore::open(&path);
        store
            .atomic_update("kid", |s| s.usage_minutes_today = 5)
            .await
            .unwrap();

        // Simulate an interrupted rewrite
        std::fs::write(path.with_extension("tmp"), "garbage").unwrap();

        let records = load_records(&path).unwrap();
        assert_eq!(records["kid"].usage_minutes_today, 5);
    }

    #[test]
    fn load_records_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = load_records(&dir.path().join("nope.json")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn state_serialization_round_trips() {
        let mut state = UserRuntimeState::new("kid");
        state.usage_minutes_today = 45;
        state.paused = true;
        state.paused_since = Some(Utc::now());
        state.blocked = true;
        state.block_reason = Some(BlockReason::TimeExhausted);
        state.warnings_fired_today.insert(10);
        state.warnings_fired_today.insert(5);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("time_exhausted"));

        let loaded: UserRuntimeState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, state);
    }
}
