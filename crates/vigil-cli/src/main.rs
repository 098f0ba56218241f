//! `vigil`: command-line client for the `vigild` daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vigil_core::{AuditRecord, BatchReport, TerminalState};

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    fn authenticate(&self) -> zbus::Result<String>;
    fn cancel(&self) -> zbus::Result<bool>;
    fn register(&self, name: &str) -> zbus::Result<bool>;
    fn register_from_capture(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, name: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn list_alerts(&self, limit: u32) -> zbus::Result<String>;
}

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Face access control client")]
struct Cli {
    #[arg(long, global = true, help = "Talk to a daemon on the session bus")]
    session: bool,
    #[arg(long, global = true, help = "Print raw JSON responses")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one attempt: liveness check, then identity match.
    Authenticate,
    /// Cancel this user's in-flight attempts.
    Cancel,
    /// Register the single face in front of the camera, or every named
    /// frame of the daemon's capture directory.
    Register {
        #[arg(long, required_unless_present = "from_capture", conflicts_with = "from_capture")]
        name: Option<String>,
        #[arg(long, help = "Register each named capture frame under its name")]
        from_capture: bool,
    },
    /// List registered identities.
    List,
    /// Remove a registered identity.
    Remove {
        #[arg(long)]
        name: String,
    },
    /// Show daemon status.
    Status,
    /// Show recent alerts, newest first.
    Alerts {
        #[arg(long, default_value_t = 20, help = "Maximum alerts to show (0 for all)")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = VigilProxy::new(&conn)
        .await
        .context("creating vigild proxy")?;
    tracing::debug!(session = cli.session, command = ?cli.command, "sending request");

    match cli.command {
        Commands::Authenticate => {
            let raw = proxy.authenticate().await.context("authenticate failed")?;
            let record: AuditRecord =
                serde_json::from_str(&raw).context("daemon returned malformed audit record")?;
            if cli.json {
                println!("{raw}");
            } else {
                println!("{}", describe(&record));
            }
            Ok(ExitCode::from(exit_status(&record)))
        }
        Commands::Cancel => {
            let cancelled = proxy.cancel().await.context("cancel failed")?;
            println!(
                "{}",
                if cancelled {
                    "attempt cancelled"
                } else {
                    "no attempt in progress"
                }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Register {
            name: Some(name),
            ..
        } => {
            proxy.register(&name).await.context("register failed")?;
            println!("registered '{name}'");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Register { name: None, .. } => {
            let raw = proxy
                .register_from_capture()
                .await
                .context("bulk register failed")?;
            if cli.json {
                println!("{raw}");
                return Ok(ExitCode::SUCCESS);
            }
            let report: BatchReport =
                serde_json::from_str(&raw).context("daemon returned malformed batch report")?;
            for line in describe_batch(&report) {
                println!("{line}");
            }
            Ok(if report.registered.is_empty() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::List => {
            let raw = proxy.list_identities().await.context("list failed")?;
            if cli.json {
                println!("{raw}");
                return Ok(ExitCode::SUCCESS);
            }
            let identities: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            if identities.is_empty() {
                println!("no identities registered");
            }
            for identity in identities {
                println!(
                    "{}\t{}",
                    identity["name"].as_str().unwrap_or("?"),
                    identity["created_at"].as_str().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { name } => {
            if proxy.remove_identity(&name).await.context("remove failed")? {
                println!("removed '{name}'");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("no identity named '{name}'");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Status => {
            let raw = proxy.status().await.context("status failed")?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Alerts { limit } => {
            let raw = proxy.list_alerts(limit).await.context("list alerts failed")?;
            if cli.json {
                println!("{raw}");
                return Ok(ExitCode::SUCCESS);
            }
            let alerts: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("daemon returned malformed alert list")?;
            if alerts.is_empty() {
                println!("no alerts recorded");
            }
            for alert in &alerts {
                println!("{}", describe_alert(alert));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Per-entry lines for a bulk registration, registered names first.
fn describe_batch(report: &BatchReport) -> Vec<String> {
    let mut lines: Vec<String> = report
        .registered
        .iter()
        .map(|name| format!("registered '{name}'"))
        .collect();
    lines.extend(
        report
            .skipped
            .iter()
            .map(|entry| format!("skipped '{}': {}", entry.name, entry.reason)),
    );
    lines.push(format!(
        "{} registered, {} skipped",
        report.registered.len(),
        report.skipped.len()
    ));
    lines
}

/// Tab-separated timestamp, reason and evidence file of one alert.
fn describe_alert(alert: &serde_json::Value) -> String {
    format!(
        "{}\t{}\t{}",
        alert["timestamp"].as_str().unwrap_or(""),
        alert["reason"].as_str().unwrap_or("?"),
        alert["evidence"].as_str().unwrap_or("")
    )
}

/// One-line human summary of a decision.
fn describe(record: &AuditRecord) -> String {
    match record.state {
        TerminalState::Authorized => format!(
            "AUTHORIZED: {} (distance {})",
            record.identity.as_deref().unwrap_or("?"),
            record
                .distance
                .map(|d| format!("{d:.3}"))
                .unwrap_or_else(|| "n/a".to_string())
        ),
        TerminalState::LivenessFailed => format!(
            "DENIED: {} ({} blinks in {} frames)",
            record.reason, record.blinks, record.frames_processed
        ),
        TerminalState::Unauthorized => format!("DENIED: {}", record.reason),
    }
}

/// Process exit status for an attempt: 0 only when access was granted.
fn exit_status(record: &AuditRecord) -> u8 {
    u8::from(!record.authorized)
}
