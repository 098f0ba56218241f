use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::{
    AlertChannel, AuthError, Authenticator, AuthorizationOutcome, BatchReport, CameraLease,
    CancelToken, CaptureError, FaceAnalyzer, Frame, FrameSource, IdentityStore, KnownIdentity,
    RegistrationError,
};

use crate::alert::AuditLog;

/// How long a timed-out attempt gets to unwind after cancellation.
const SETTLE_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("camera warmup failed: {0}")]
    Warmup(#[from] CaptureError),
    #[error("attempt exceeded {0:?} and was cancelled")]
    Timeout(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Authenticate {
        cancel: CancelToken,
        reply: oneshot::Sender<Result<AuthorizationOutcome, EngineError>>,
    },
    Register {
        name: String,
        reply: oneshot::Sender<Result<KnownIdentity, EngineError>>,
    },
    RegisterBatch {
        entries: Vec<(String, Frame)>,
        reply: oneshot::Sender<BatchReport>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

/// A queued or running attempt. Dropping the handle does not stop the
/// attempt; call [`AttemptHandle::cancel`] for that.
pub struct AttemptHandle {
    cancel: CancelToken,
    reply: oneshot::Receiver<Result<AuthorizationOutcome, EngineError>>,
}

impl AttemptHandle {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn outcome(self) -> Result<AuthorizationOutcome, EngineError> {
        self.reply.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Like [`outcome`](Self::outcome), but cancels the attempt once
    /// `timeout` has elapsed.
    ///
    /// After cancelling, the engine gets a short grace period to unwind. A
    /// step that was already deciding when the deadline hit still reports
    /// its outcome (it is audited and alerted like any other); anything else
    /// is [`EngineError::Timeout`].
    pub async fn outcome_within(self, timeout: Duration) -> Result<AuthorizationOutcome, EngineError> {
        let cancel = self.cancel.clone();
        let reply = self.outcome();
        tokio::pin!(reply);
        match tokio::time::timeout(timeout, &mut reply).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(timeout_secs = timeout.as_secs(), "attempt timed out, cancelling");
                match tokio::time::timeout(SETTLE_GRACE, reply).await {
                    Ok(Ok(outcome)) => {
                        tracing::warn!(
                            attempt = %outcome.attempt_id,
                            state = ?outcome.state,
                            "attempt decided after its deadline"
                        );
                        Ok(outcome)
                    }
                    _ => Err(EngineError::Timeout(timeout)),
                }
            }
        }
    }
}

impl EngineHandle {
    /// Queue an attempt with a fresh cancellation token.
    pub async fn begin_attempt(&self) -> Result<AttemptHandle, EngineError> {
        self.begin_attempt_with(CancelToken::new()).await
    }

    /// Queue an attempt controlled by `cancel`.
    pub async fn begin_attempt_with(&self, cancel: CancelToken) -> Result<AttemptHandle, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Authenticate {
                cancel: cancel.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(AttemptHandle {
            cancel,
            reply: reply_rx,
        })
    }

    /// Capture one frame and register its face under `name`.
    pub async fn register(&self, name: &str) -> Result<KnownIdentity, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                name: name.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Register pre-captured `(name, frame)` pairs, skipping bad entries.
    pub async fn register_batch(
        &self,
        entries: Vec<(String, Frame)>,
    ) -> Result<BatchReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::RegisterBatch {
                entries,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the authenticator, and with it the camera, so attempts
/// and registrations are serialized. Warmup frames are discarded before the
/// thread starts; a camera that cannot be acquired fails startup.
pub fn spawn_engine<S, A, G, N>(
    mut authenticator: Authenticator<S, A, G, N>,
    audit: AuditLog,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + Send + 'static,
    A: FaceAnalyzer + Send + 'static,
    G: IdentityStore + Send + 'static,
    N: AlertChannel + Send + 'static,
{
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        let mut camera = CameraLease::acquire(authenticator.source_mut())?;
        for _ in 0..warmup_frames {
            if camera.next_frame().is_none() {
                break;
            }
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("vigil-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Authenticate { cancel, reply } => {
                        let result = run_attempt(&mut authenticator, &audit, &cancel);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Register { name, reply } => {
                        let result = authenticator.enroll(&name).map_err(EngineError::from);
                        match &result {
                            Ok(identity) => tracing::info!(
                                name = %identity.name,
                                dim = identity.encoding.dim(),
                                "identity registered"
                            ),
                            Err(e) => tracing::warn!(name = %name, error = %e, "registration failed"),
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::RegisterBatch { entries, reply } => {
                        tracing::info!(entries = entries.len(), "bulk registration requested");
                        let _ = reply.send(authenticator.enroll_frames(entries));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_attempt<S, A, G, N>(
    authenticator: &mut Authenticator<S, A, G, N>,
    audit: &AuditLog,
    cancel: &CancelToken,
) -> Result<AuthorizationOutcome, EngineError>
where
    S: FrameSource,
    A: FaceAnalyzer,
    G: IdentityStore,
    N: AlertChannel,
{
    let outcome = authenticator.authenticate(cancel).map_err(|e| {
        match &e {
            AuthError::Cancelled => tracing::info!("attempt cancelled"),
            other => tracing::error!(error = %other, "attempt aborted"),
        }
        e
    })?;

    tracing::info!(
        attempt = %outcome.attempt_id,
        state = ?outcome.state,
        authorized = outcome.authorized,
        identity = ?outcome.identity,
        reason = %outcome.reason,
        "attempt complete"
    );

    if let Err(e) = audit.append(&outcome.audit_record()) {
        tracing::error!(error = %e, "failed to append audit record");
    }
    Ok(outcome)
}
