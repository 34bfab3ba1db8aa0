/// OS collaborators the enforcement loop talks to.
///
/// Session presence, forced termination and desktop notification are
/// defined as traits so the loop can run against in-memory fakes in tests
/// and against the real host in production.
pub mod common;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

/// Reports which users currently have an open session
pub trait SessionInspector: Send + Sync {
    fn logged_in_users(&self) -> Result<HashSet<String>>;
}

/// Ends a user's session. Best effort; callers decide on retries.
pub trait SessionTerminator: Send + Sync {
    fn terminate(&self, username: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    Critical,
}

/// Delivers a desktop notification into a user's session. Best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, username: &str, title: &str, body: &str, urgency: Urgency) -> Result<()>;
}

pub fn session_inspector() -> Result<Arc<dyn SessionInspector>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxSessions))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("No session inspector for this operating system")
    }
}

pub fn session_terminator() -> Result<Arc<dyn SessionTerminator>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxTerminator))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("No session terminator for this operating system")
    }
}

pub fn notifier() -> Result<Arc<dyn Notifier>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxNotifier))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("No notifier for this operating system")
    }
}
