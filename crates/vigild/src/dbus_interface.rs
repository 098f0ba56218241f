use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use vigil_core::{AuthError, AuthorizationOutcome, CancelToken, RegistrationError};
use zbus::interface;

use crate::alert::FsAlertChannel;
use crate::capture::Capture;
use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::rate_limiter::RateLimiter;
use crate::store::SqliteIdentityStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: SqliteIdentityStore,
    /// Capture backing the camera, also used as the bulk enrollment set.
    pub capture: Arc<Capture>,
    pub rate_limiter: RateLimiter,
    /// In-flight attempts by ticket: owning caller and cancel token.
    pub active: HashMap<u64, (String, CancelToken)>,
    pub next_ticket: u64,
}

impl AppState {
    pub fn new(
        config: Config,
        engine: EngineHandle,
        store: SqliteIdentityStore,
        capture: Arc<Capture>,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            capture,
            rate_limiter: RateLimiter::new(),
            active: HashMap::new(),
            next_ticket: 0,
        }
    }
}

/// D-Bus interface for the Vigil access-control daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilService {
    pub state: Arc<Mutex<AppState>>,
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

async fn caller_uid(
    header: &zbus::message::Header<'_>,
    conn: &zbus::Connection,
) -> zbus::fdo::Result<u32> {
    let sender = header
        .sender()
        .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
    get_caller_uid(sender.as_str(), conn).await
}

/// Identity mutations are root-only on the system bus.
async fn require_root(
    session_bus: bool,
    op: &str,
    header: &zbus::message::Header<'_>,
    conn: &zbus::Connection,
) -> zbus::fdo::Result<()> {
    if session_bus {
        return Ok(());
    }
    let uid = caller_uid(header, conn).await?;
    if uid != 0 {
        tracing::warn!(op, caller_uid = uid, "non-root caller rejected");
        return Err(zbus::fdo::Error::AccessDenied(format!(
            "{op} requires root"
        )));
    }
    Ok(())
}

/// Settle one admitted attempt against the caller's throttle.
fn settle_attempt(
    limiter: &mut RateLimiter,
    caller: &str,
    result: &Result<AuthorizationOutcome, EngineError>,
) {
    match result {
        Ok(outcome) if outcome.authorized => limiter.record_success(caller),
        Ok(_) => limiter.record_denial(caller),
        Err(_) => limiter.record_abandoned(caller),
    }
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Registration(
            RegistrationError::InvalidName(_) | RegistrationError::DuplicateName(_),
        ) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Run one authentication attempt and return its audit record as JSON.
    ///
    /// Only decided denials count toward the caller's throttle, and attempts
    /// still running hold a slot in it. Capture failures, cancellation and
    /// timeouts come back as D-Bus errors.
    async fn authenticate(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller = caller_uid(&header, conn).await?.to_string();
        tracing::info!(caller = %caller, "authenticate requested");

        // --- Admission (lock released before the engine call) ---
        let (engine, timeout) = {
            let mut state = self.state.lock().await;
            state.rate_limiter.begin_attempt(&caller).map_err(|msg| {
                tracing::warn!(caller = %caller, "authenticate: rate limited");
                zbus::fdo::Error::LimitsExceeded(msg)
            })?;
            (
                state.engine.clone(),
                Duration::from_secs(state.config.attempt_timeout_secs),
            )
        };

        let handle = match engine.begin_attempt().await {
            Ok(handle) => handle,
            Err(e) => {
                self.state.lock().await.rate_limiter.record_abandoned(&caller);
                return Err(engine_error(e));
            }
        };
        let ticket = {
            let mut state = self.state.lock().await;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state
                .active
                .insert(ticket, (caller.clone(), handle.cancel_token()));
            ticket
        };

        let result = handle.outcome_within(timeout).await;

        {
            let mut state = self.state.lock().await;
            state.active.remove(&ticket);
            settle_attempt(&mut state.rate_limiter, &caller, &result);
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(EngineError::Auth(AuthError::Cancelled)) => {
                return Err(zbus::fdo::Error::Failed("attempt cancelled".to_string()));
            }
            Err(e) => {
                tracing::error!(error = %e, "authenticate failed");
                return Err(engine_error(e));
            }
        };

        serde_json::to_string(&outcome.audit_record())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Cancel the caller's in-flight attempts (all attempts for root).
    ///
    /// Returns true if anything was cancelled.
    async fn cancel(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        let uid = caller_uid(&header, conn).await?;
        let caller = uid.to_string();

        let state = self.state.lock().await;
        let mut cancelled = 0usize;
        for (owner, token) in state.active.values() {
            if uid == 0 || *owner == caller {
                token.cancel();
                cancelled += 1;
            }
        }
        tracing::info!(caller = %caller, cancelled, "cancel requested");
        Ok(cancelled > 0)
    }

    /// Capture one frame and register its single face under `name`.
    async fn register(
        &self,
        name: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "register requested");

        let (engine, session_bus) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.config.session_bus)
        };
        require_root(session_bus, "register", &header, conn).await?;

        engine.register(name).await.map_err(engine_error)?;
        tracing::info!(name, "registered successfully");
        Ok(true)
    }

    /// Register every named frame of the capture directory.
    ///
    /// Returns the JSON batch report: names registered and entries skipped
    /// with their reasons.
    async fn register_from_capture(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let (engine, capture, session_bus) = {
            let state = self.state.lock().await;
            (
                state.engine.clone(),
                Arc::clone(&state.capture),
                state.config.session_bus,
            )
        };
        require_root(session_bus, "register_from_capture", &header, conn).await?;
        tracing::info!(dir = %capture.dir().display(), "bulk registration requested");

        let entries = tokio::task::spawn_blocking(move || capture.enrollment_frames())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let report = engine.register_batch(entries).await.map_err(engine_error)?;

        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// List registered identities as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let identities = store
            .list()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&identities).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove a registered identity by name.
    async fn remove_identity(
        &self,
        name: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove_identity requested");

        let (store, session_bus) = {
            let state = self.state.lock().await;
            (state.store.clone(), state.config.session_bus)
        };
        require_root(session_bus, "remove_identity", &header, conn).await?;

        let removed = store
            .remove(name)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            tracing::info!(name, "identity removed");
        } else {
            tracing::warn!(name, "identity not found");
        }
        Ok(removed)
    }

    /// Return up to `limit` recent alert records as JSON, newest first.
    ///
    /// `limit == 0` returns the whole history.
    async fn list_alerts(
        &self,
        limit: u32,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let (alert_dir, session_bus) = {
            let state = self.state.lock().await;
            (state.config.alert_dir.clone(), state.config.session_bus)
        };
        require_root(session_bus, "list_alerts", &header, conn).await?;

        let alerts = tokio::task::spawn_blocking(move || {
            FsAlertChannel::new(alert_dir).recent(limit as usize)
        })
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
        .map_err(|e| zbus::fdo::Error::IOError(e.to_string()))?;
        tracing::debug!(limit, returned = alerts.len(), "list_alerts served");

        serde_json::to_string(&alerts).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let identities = state.store.count_all().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "capture_dir": state.config.capture_dir,
            "identities": identities,
            "encoding_dim": state.store.encoding_dim(),
            "active_attempts": state.active.len(),
            "frame_limit": state.config.frame_limit,
            "required_blinks": state.config.required_blinks,
            "head_movement_required": state.config.head_movement_required,
            "distance_threshold": state.config.distance_threshold,
            "attempt_timeout_secs": state.config.attempt_timeout_secs,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{LivenessResult, TerminalState};

    fn outcome(authorized: bool) -> AuthorizationOutcome {
        AuthorizationOutcome {
            attempt_id: uuid::Uuid::new_v4(),
            state: if authorized {
                TerminalState::Authorized
            } else {
                TerminalState::Unauthorized
            },
            authorized,
            identity: authorized.then(|| "alice".to_string()),
            reason: "x".to_string(),
            distance: None,
            liveness: LivenessResult::default(),
            evidence_frame: None,
            timestamp: chrono::Utc::now(),
            alert_delivered: None,
            error: None,
        }
    }

    #[test]
    fn test_settle_counts_only_decided_denials() {
        let mut limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.begin_attempt("1000").unwrap();
        }
        // all slots held by running attempts
        assert!(limiter.begin_attempt("1000").is_err());

        let timed_out = Err(EngineError::Timeout(Duration::from_secs(1)));
        settle_attempt(&mut limiter, "1000", &timed_out);
        settle_attempt(&mut limiter, "1000", &Err(EngineError::Auth(AuthError::Cancelled)));
        settle_attempt(&mut limiter, "1000", &Ok(outcome(false)));
        settle_attempt(&mut limiter, "1000", &Ok(outcome(false)));
        settle_attempt(&mut limiter, "1000", &Ok(outcome(false)));

        // three denials recorded, two slots freed without penalty
        limiter.begin_attempt("1000").unwrap();
        limiter.begin_attempt("1000").unwrap();
        assert!(limiter.begin_attempt("1000").is_err());

        settle_attempt(&mut limiter, "1000", &Ok(outcome(true)));
        settle_attempt(&mut limiter, "1000", &Ok(outcome(false)));
        for _ in 0..4 {
            limiter.begin_attempt("1000").unwrap();
        }
        assert!(limiter.begin_attempt("1000").is_err());
    }
}
