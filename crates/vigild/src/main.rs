use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use vigil_core::Authenticator;

mod alert;
mod capture;
mod config;
mod dbus_interface;
mod engine;
mod rate_limiter;
mod store;

use crate::alert::{AuditLog, FsAlertChannel};
use crate::capture::{Capture, CaptureAnalyzer, CaptureCamera};
use crate::dbus_interface::{AppState, VigilService};
use crate::store::{BlockingIdentityStore, SqliteIdentityStore};

const BUS_NAME: &str = "org.freedesktop.Vigil1";
const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = config::Config::from_env();
    tracing::info!(?config, "configuration loaded");

    let store = SqliteIdentityStore::open(&config.db_path, config.encoding_dim)
        .await
        .with_context(|| format!("opening identity store {}", config.db_path.display()))?;
    tracing::info!(
        path = %config.db_path.display(),
        identities = store.count_all().await.unwrap_or(0),
        "identity store opened"
    );

    let capture = Capture::load(&config.capture_dir)?;
    tracing::info!(
        dir = %capture.dir().display(),
        frames = capture.frame_count(),
        "frame source ready"
    );

    let alerts = FsAlertChannel::new(&config.alert_dir);
    tracing::info!(dir = %alerts.dir().display(), "alerts and audit log directory");

    let authenticator = Authenticator::new(
        CaptureCamera::new(Arc::clone(&capture)),
        CaptureAnalyzer::new(Arc::clone(&capture)),
        BlockingIdentityStore::new(store.clone(), tokio::runtime::Handle::current()),
        alerts,
        config.auth_config(),
    );
    let engine = engine::spawn_engine(
        authenticator,
        AuditLog::new(config.audit_log_path()),
        config.warmup_frames,
    )?;

    let session_bus = config.session_bus;
    let service = VigilService {
        state: Arc::new(Mutex::new(AppState::new(config, engine, store, capture))),
    };

    let builder = if session_bus {
        tracing::warn!("serving on the session bus; caller UID checks disabled");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "vigild ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    Ok(())
}
