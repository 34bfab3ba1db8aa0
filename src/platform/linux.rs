use anyhow::{Context, Result};
use std::collections::HashSet;
use std::process::Command;
use tracing::{debug, info, warn};

use super::{Notifier, SessionInspector, SessionTerminator, Urgency};

/// Session presence via `who`
pub struct LinuxSessions;

impl SessionInspector for LinuxSessions {
    fn logged_in_users(&self) -> Result<HashSet<String>> {
        let output = Command::new("who")
            .output()
            .context("Failed to run 'who'")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let users = stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect();

        Ok(users)
    }
}

/// Session termination via logind, with a process-kill fallback
pub struct LinuxTerminator;

impl SessionTerminator for LinuxTerminator {
    fn terminate(&self, username: &str) -> Result<()> {
        if try_command("loginctl", &["terminate-user", username]).is_ok() {
            info!("Terminated sessions for {username} via loginctl");
            return Ok(());
        }

        if try_command("pkill", &["-KILL", "-u", username]).is_ok() {
            info!("Killed processes for {username} via pkill");
            return Ok(());
        }

        anyhow::bail!("Could not terminate sessions for {username}")
    }
}

/// Desktop notifications via `notify-send`, run inside the target user's
/// session bus
pub struct LinuxNotifier;

impl Notifier for LinuxNotifier {
    fn notify(&self, username: &str, title: &str, body: &str, urgency: Urgency) -> Result<()> {
        let uid = user_uid(username)?;
        let bus = format!("unix:path=/run/user/{uid}/bus");
        let urgency = match urgency {
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        };

        let output = Command::new("sudo")
            .args(["-u", username, "notify-send"])
            .args(["--urgency", urgency])
            .args(["--app-name", "timewarden"])
            .arg(title)
            .arg(body)
            .env("DISPLAY", std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into()))
            .env("DBUS_SESSION_BUS_ADDRESS", bus)
            .output()
            .context("Failed to run notify-send")?;

        if output.status.success() {
            debug!("Notified {username}: {title}");
            Ok(())
        } else {
            warn!(
                "notify-send failed for {username}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            anyhow::bail!("notify-send exited with {}", output.status)
        }
    }
}

fn user_uid(username: &str) -> Result<String> {
    let output = Command::new("id")
        .args(["-u", username])
        .output()
        .context("Failed to run 'id'")?;

    if !output.status.success() {
        anyhow::bail!("Unknown user: {username}");
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd).args(args).output()?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("Command failed: {} {:?}", cmd, args)
    }
}
