use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::commands::{CommandProcessor, CommandRequest};
use crate::config::{self, Config};
use crate::enforcer::EnforcementLoop;
use crate::events::{EventSink, LogSink};
use crate::platform::{self, common};
use crate::state::StateStore;

/// Run the agent until a shutdown signal arrives.
///
/// Wires the enforcement loop, the command intake and the signal handler
/// around one shared store and one shared config snapshot.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    info!("Starting timewarden agent");
    info!(
        "Controlling users: {:?}",
        config.users.iter().map(|u| &u.username).collect::<Vec<_>>()
    );

    if !config::is_root() {
        warn!("Not running as root, enforcement may not work");
    }

    let state_path = config.state_path();
    let command_dir = config.command_dir();
    let tick_interval = config.agent.tick_interval();
    let config = config::shared(config);

    let store = Arc::new(StateStore::open(&state_path));
    let sessions = platform::session_inspector()?;
    let terminator = platform::session_terminator()?;
    let notifier = platform::notifier()?;
    let sink: Arc<dyn EventSink> = Arc::new(LogSink);

    let processor = Arc::new(CommandProcessor::new(
        config.clone(),
        store.clone(),
        terminator.clone(),
        notifier.clone(),
        sink.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    // Command intake: transports push requests into the channel; the spool
    // scanner is the built-in file-drop transport.
    let (command_tx, command_rx) = mpsc::channel::<CommandRequest>(32);
    tokio::spawn(command_spool(
        command_dir,
        tick_interval,
        command_tx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(consume_commands(
        processor,
        command_rx,
        shutdown_rx.clone(),
    ));

    let enforcement = EnforcementLoop::new(config, store, sessions, terminator, notifier, sink);
    enforcement.run(shutdown_rx).await;

    info!("Agent stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn consume_commands(
    processor: Arc<CommandProcessor>,
    mut commands: mpsc::Receiver<CommandRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = processor.apply(command).await {
                        warn!("Command rejected: {:#}", e);
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Poll a drop-in directory for JSON command files. Files are consumed
/// whether they parse or not, so a malformed file cannot wedge the intake.
async fn command_spool(
    dir: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<CommandRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = common::ensure_directory_exists(&dir) {
        warn!("Command directory unavailable: {:#}", e);
        return;
    }
    // User sessions drop request files here
    let _ = common::set_permissions_writable_all(&dir);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => scan_spool(&dir, &tx).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn scan_spool(dir: &Path, tx: &mpsc::Sender<CommandRequest>) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let content = tokio::fs::read_to_string(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove command file {}: {e}", path.display());
        }

        match content {
            Ok(content) => match serde_json::from_str::<CommandRequest>(&content) {
                Ok(command) => {
                    info!("Picked up command file {}", path.display());
                    let _ = tx.send(command).await;
                }
                Err(e) => warn!("Invalid command file {}: {e}", path.display()),
            },
            Err(e) => warn!("Could not read command file {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spool_scan_picks_up_valid_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("req1.json"),
            r#"{"action":"add_bonus","user":"alice","minutes":10}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("junk.json"), "not json").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), "nope").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        scan_spool(dir.path(), &tx).await;

        let command = rx.try_recv().unwrap();
        assert!(matches!(
            command,
            CommandRequest::AddBonus { minutes: 10, .. }
        ));
        assert!(rx.try_recv().is_err());

        // JSON files are consumed, other files are left alone
        assert!(!dir.path().join("req1.json").exists());
        assert!(!dir.path().join("junk.json").exists());
        assert!(dir.path().join("ignore.txt").exists());
    }
}
