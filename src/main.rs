use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod commands;
mod config;
mod daemon;
mod enforcer;
mod events;
mod gate;
mod platform;
mod schedule;
mod state;

use config::Config;
use events::UserStatus;
use state::UserRuntimeState;

/// Screen Time Enforcement Agent
///
/// Tracks per-user computer usage against daily budgets and allowed
/// hours, forces logout when time runs out, and answers PAM login checks
/// from the same persisted state.
#[derive(Parser, Debug)]
#[command(name = "timewarden")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the enforcement agent in the foreground
    Run,
    /// Decide a login attempt (called by PAM via pam_exec)
    PamCheck {
        /// Username to check; read from PAM_USER when omitted
        user: Option<String>,
    },
    /// Show per-user status from the persisted state
    Status,
    /// Write an example configuration file
    Init,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    match args.command {
        Commands::Run => {
            init_logging(args.verbose);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(daemon::run(&config_path))
        }
        Commands::PamCheck { user } => pam_check(&config_path, user),
        Commands::Status => {
            init_logging(args.verbose);
            status(&config_path)
        }
        Commands::Init => {
            init_logging(args.verbose);
            init_config(&config_path)
        }
    }
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// PAM invokes this once per login attempt with the candidate user in
/// PAM_USER. Exit code 0 allows the login, 1 denies it. Logging stays
/// off because stderr reaches the login prompt.
fn pam_check(config_path: &Path, user: Option<String>) -> Result<()> {
    let username = user
        .or_else(|| std::env::var("PAM_USER").ok())
        .unwrap_or_default();
    if username.is_empty() {
        return Ok(());
    }

    let decision = gate::pam_check(config_path, &username, Local::now());
    if !decision.allowed {
        let reason = decision.reason.unwrap_or_else(|| "Access denied".to_string());
        eprintln!("timewarden: {reason}");
        std::process::exit(1);
    }

    Ok(())
}

fn status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let states = state::load_records(&config.state_path()).unwrap_or_default();
    let now = Local::now();

    println!(
        "{:<16} {:<8} {:>8} {:>11} {:>7}",
        "USER", "STATUS", "USED", "REMAINING", "BONUS"
    );

    for policy in &config.users {
        let user_state = states
            .get(&policy.username)
            .map(|s| s.rolled_over(now.date_naive()))
            .unwrap_or_else(|| UserRuntimeState::new(&policy.username));

        let status = UserStatus::build(policy, &user_state, user_state.session_active, false, now);
        let remaining = status
            .minutes_remaining
            .map(|m| format!("{m}m"))
            .unwrap_or_else(|| "unlimited".to_string());

        println!(
            "{:<16} {:<8} {:>8} {:>11} {:>7}",
            status.username,
            status.label(),
            format!("{}m", status.usage_minutes),
            remaining,
            format!("{}m", status.bonus_minutes)
        );
    }

    Ok(())
}

fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config already exists at {}", config_path.display());
    }

    platform::common::atomic_write(config_path, config::EXAMPLE_CONFIG.as_bytes())?;

    println!("Wrote example config to {}", config_path.display());
    println!("Edit the user list, then start the agent with: timewarden run");

    Ok(())
}
