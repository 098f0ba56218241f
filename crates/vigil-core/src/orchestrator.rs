//! Authorization pipeline: liveness, then identity extraction, then matching.
//!
//! ```text
//! Idle ──begin_attempt──▶ CapturingLiveness ──fail──▶ LivenessFailed
//!                               │ pass
//!                               ▼
//!                      ExtractingIdentity ──no face / encode error──▶ Unauthorized
//!                               │ face
//!                               ▼
//!                           Matching ──match──▶ Authorized
//!                               ├────no match──▶ Unauthorized
//!                               └─store error──▶ Unauthorized
//! ```
//!
//! Every terminal state produces exactly one [`AuthorizationOutcome`].
//! `LivenessFailed` and `Unauthorized` notify the alert channel with the
//! evidence frame; `Authorized` never does and drops the frame. Once a
//! post-liveness frame exists, collaborator failures deny with an alert and
//! carry the error on the outcome instead of aborting the attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::alert::AlertChannel;
use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::liveness::{LivenessConfig, LivenessError, LivenessResult, LivenessSession, SessionStatus};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_DISTANCE_THRESHOLD};
use crate::registration::{self, RegistrationError};
use crate::source::{CameraLease, CaptureError, FrameSource};
use crate::store::{IdentityStore, StoreError};
use crate::types::{FaceEncoding, Frame, KnownIdentity, LandmarkSet};

pub const REASON_SPOOFING: &str = "possible spoofing attempt";
pub const REASON_NO_FACE: &str = "no face detected";
pub const REASON_UNAUTHORIZED: &str = "unauthorized person";
pub const REASON_AUTHORIZED: &str = "authorized";
pub const REASON_STORE_UNAVAILABLE: &str = "identity store unavailable";
pub const REASON_ENCODING_FAILED: &str = "face encoding failed";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("invalid biometric input: {0}")]
    InvalidInput(String),
    #[error("face analyzer error: {0}")]
    Analyzer(String),
    #[error("identity store error: {0}")]
    Store(#[from] StoreError),
    #[error("attempt cancelled")]
    Cancelled,
    #[error("attempt already reached a terminal state")]
    AttemptFinished,
}

impl From<CaptureError> for AuthError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Unavailable(msg) => Self::CaptureFailed(msg),
        }
    }
}

impl From<LivenessError> for AuthError {
    fn from(err: LivenessError) -> Self {
        match err {
            LivenessError::InvalidInput(e) => Self::InvalidInput(e.to_string()),
        }
    }
}

impl From<AnalyzerError> for AuthError {
    fn from(err: AnalyzerError) -> Self {
        match err {
            AnalyzerError::InvalidInput(e) => Self::InvalidInput(e.to_string()),
            AnalyzerError::Failed(msg) => Self::Analyzer(msg),
        }
    }
}

/// Decision tunables for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub liveness: LivenessConfig,
    /// Maximum encoding distance accepted as a match.
    pub distance_threshold: f64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

/// Cooperative cancellation flag shared between an attempt and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    Idle,
    CapturingLiveness,
    LivenessFailed,
    ExtractingIdentity,
    Matching,
    Authorized,
    Unauthorized,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::LivenessFailed | Self::Authorized | Self::Unauthorized
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalState {
    LivenessFailed,
    Authorized,
    Unauthorized,
}

impl From<TerminalState> for AttemptState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::LivenessFailed => Self::LivenessFailed,
            TerminalState::Authorized => Self::Authorized,
            TerminalState::Unauthorized => Self::Unauthorized,
        }
    }
}

/// The single result of one authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthorizationOutcome {
    pub attempt_id: Uuid,
    pub state: TerminalState,
    pub authorized: bool,
    pub identity: Option<String>,
    pub reason: String,
    /// Distance to the nearest known encoding, when matching ran.
    pub distance: Option<f64>,
    pub liveness: LivenessResult,
    /// Retained for denials only.
    pub evidence_frame: Option<Frame>,
    pub timestamp: DateTime<Utc>,
    /// `None` when no alert was due; otherwise whether delivery succeeded.
    pub alert_delivered: Option<bool>,
    /// Collaborator failure that forced a denial, if any.
    pub error: Option<String>,
}

/// Pixel-free summary of an outcome, suitable for logs and IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub attempt_id: Uuid,
    pub state: TerminalState,
    pub authorized: bool,
    pub identity: Option<String>,
    pub reason: String,
    pub distance: Option<f64>,
    pub blinks: u32,
    pub frames_processed: u32,
    pub evidence_retained: bool,
    pub alert_delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuthorizationOutcome {
    pub fn audit_record(&self) -> AuditRecord {
        AuditRecord {
            attempt_id: self.attempt_id,
            state: self.state,
            authorized: self.authorized,
            identity: self.identity.clone(),
            reason: self.reason.clone(),
            distance: self.distance.filter(|d| d.is_finite()),
            blinks: self.liveness.blinks,
            frames_processed: self.liveness.frames_processed,
            evidence_retained: self.evidence_frame.is_some(),
            alert_delivered: self.alert_delivered,
            error: self.error.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Owns the collaborators and runs attempts against them, one at a time.
pub struct Authenticator<S, A, G, N, M = EuclideanMatcher> {
    source: S,
    analyzer: A,
    store: G,
    alerts: N,
    matcher: M,
    config: AuthConfig,
}

impl<S, A, G, N> Authenticator<S, A, G, N, EuclideanMatcher>
where
    S: FrameSource,
    A: FaceAnalyzer,
    G: IdentityStore,
    N: AlertChannel,
{
    pub fn new(source: S, analyzer: A, store: G, alerts: N, config: AuthConfig) -> Self {
        Self {
            source,
            analyzer,
            store,
            alerts,
            matcher: EuclideanMatcher,
            config,
        }
    }
}

impl<S, A, G, N, M> Authenticator<S, A, G, N, M>
where
    S: FrameSource,
    A: FaceAnalyzer,
    G: IdentityStore,
    N: AlertChannel,
    M: Matcher,
{
    /// Swap the matching policy.
    pub fn with_matcher<M2: Matcher>(self, matcher: M2) -> Authenticator<S, A, G, N, M2> {
        Authenticator {
            source: self.source,
            analyzer: self.analyzer,
            store: self.store,
            alerts: self.alerts,
            matcher,
            config: self.config,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn store(&self) -> &G {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn alerts(&self) -> &N {
        &self.alerts
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    /// Acquire the camera and start a fresh liveness session.
    pub fn begin_attempt(&mut self) -> Result<Attempt<'_, S, A, G, N, M>, AuthError> {
        let camera = CameraLease::acquire(&mut self.source)?;
        let id = Uuid::new_v4();
        tracing::debug!(attempt = %id, from = ?AttemptState::Idle, to = ?AttemptState::CapturingLiveness, "attempt transition");

        Ok(Attempt {
            id,
            camera,
            analyzer: &mut self.analyzer,
            store: &self.store,
            alerts: &self.alerts,
            matcher: &self.matcher,
            config: &self.config,
            state: AttemptState::CapturingLiveness,
            session: Some(LivenessSession::new(self.config.liveness.clone())),
            liveness: None,
            last_frame: None,
            candidate: None,
        })
    }

    /// Run one attempt to completion.
    pub fn authenticate(&mut self, cancel: &CancelToken) -> Result<AuthorizationOutcome, AuthError> {
        self.begin_attempt()?.run(cancel)
    }

    /// Capture one frame and register its single face under `name`.
    pub fn enroll(&mut self, name: &str) -> Result<KnownIdentity, RegistrationError> {
        crate::types::validate_name(name).map_err(RegistrationError::InvalidName)?;
        let frame = {
            let mut camera = CameraLease::acquire(&mut self.source)
                .map_err(|e| RegistrationError::CaptureFailed(e.to_string()))?;
            camera.next_frame().ok_or_else(|| {
                RegistrationError::CaptureFailed("frame source returned no frame".to_string())
            })?
        };
        registration::register(&self.store, &mut self.analyzer, name, &frame)
    }

    /// Register pre-captured frames in bulk; see [`registration::register_batch`].
    pub fn enroll_frames(&mut self, entries: Vec<(String, Frame)>) -> registration::BatchReport {
        registration::register_batch(&self.store, &mut self.analyzer, entries)
    }
}

/// One in-flight authentication attempt.
///
/// Holds the camera for its whole lifetime; dropping it (including after
/// cancellation) releases the camera without any alert or store write.
pub struct Attempt<'a, S, A, G, N, M>
where
    S: FrameSource,
{
    id: Uuid,
    camera: CameraLease<'a, S>,
    analyzer: &'a mut A,
    store: &'a G,
    alerts: &'a N,
    matcher: &'a M,
    config: &'a AuthConfig,
    state: AttemptState,
    session: Option<LivenessSession>,
    liveness: Option<LivenessResult>,
    last_frame: Option<Frame>,
    candidate: Option<(FaceEncoding, Frame)>,
}

impl<'a, S, A, G, N, M> Attempt<'a, S, A, G, N, M>
where
    S: FrameSource,
    A: FaceAnalyzer,
    G: IdentityStore,
    N: AlertChannel,
    M: Matcher,
{
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Frames consumed by the liveness session so far.
    pub fn frames_seen(&self) -> u32 {
        match (&self.session, &self.liveness) {
            (Some(session), _) => session.frames_seen(),
            (None, Some(result)) => result.frames_processed,
            (None, None) => 0,
        }
    }

    /// Step until a terminal state, checking `cancel` before every step.
    pub fn run(mut self, cancel: &CancelToken) -> Result<AuthorizationOutcome, AuthError> {
        loop {
            if cancel.is_cancelled() {
                tracing::info!(attempt = %self.id, state = ?self.state, "attempt cancelled");
                return Err(AuthError::Cancelled);
            }
            if let Some(outcome) = self.step()? {
                return Ok(outcome);
            }
        }
    }

    /// Advance by one transition (one frame while capturing liveness).
    ///
    /// Returns the outcome once a terminal state is reached.
    pub fn step(&mut self) -> Result<Option<AuthorizationOutcome>, AuthError> {
        match self.state {
            AttemptState::CapturingLiveness => self.step_liveness(),
            AttemptState::ExtractingIdentity => self.step_extract(),
            AttemptState::Matching => self.step_match().map(Some),
            _ => Err(AuthError::AttemptFinished),
        }
    }

    fn step_liveness(&mut self) -> Result<Option<AuthorizationOutcome>, AuthError> {
        let status = self
            .session
            .as_ref()
            .map(LivenessSession::status)
            .ok_or(AuthError::AttemptFinished)?;

        if status == SessionStatus::Collecting {
            let frame = self.capture()?;
            let faces = self.analyzer.detect_faces(&frame)?;
            let landmarks: Vec<LandmarkSet> = faces.into_iter().map(|f| f.landmarks).collect();
            if let Some(session) = self.session.as_mut() {
                session.observe(&landmarks)?;
            }
            self.last_frame = Some(frame);
            return Ok(None);
        }

        let result = match self.session.take() {
            Some(session) => session.verdict(),
            None => return Err(AuthError::AttemptFinished),
        };
        tracing::info!(
            attempt = %self.id,
            passed = result.passed,
            blinks = result.blinks,
            frames = result.frames_processed,
            head_movement = result.head_movement,
            "liveness verdict"
        );
        self.liveness = Some(result.clone());

        if result.passed {
            self.transition(AttemptState::ExtractingIdentity);
            return Ok(None);
        }

        let evidence = match self.last_frame.take() {
            Some(frame) => frame,
            None => self.capture()?,
        };
        Ok(Some(self.finish(
            TerminalState::LivenessFailed,
            REASON_SPOOFING,
            None,
            None,
            Some(evidence),
        )))
    }

    fn step_extract(&mut self) -> Result<Option<AuthorizationOutcome>, AuthError> {
        let frame = self.capture()?;
        let faces = self.analyzer.detect_faces(&frame)?;

        let Some(face) = faces.first() else {
            tracing::warn!(attempt = %self.id, "no face in identity frame");
            return Ok(Some(self.finish(
                TerminalState::Unauthorized,
                REASON_NO_FACE,
                None,
                None,
                Some(frame),
            )));
        };
        if faces.len() > 1 {
            tracing::debug!(attempt = %self.id, faces = faces.len(), "multiple faces, using first");
        }

        let encoding = match self.analyzer.encode(&frame, &face.bbox) {
            Ok(encoding) => encoding,
            Err(e) => {
                tracing::error!(attempt = %self.id, error = %e, "face encoding failed");
                let mut outcome = self.finish(
                    TerminalState::Unauthorized,
                    REASON_ENCODING_FAILED,
                    None,
                    None,
                    Some(frame),
                );
                outcome.error = Some(e.to_string());
                return Ok(Some(outcome));
            }
        };
        self.candidate = Some((encoding, frame));
        self.transition(AttemptState::Matching);
        Ok(None)
    }

    fn step_match(&mut self) -> Result<AuthorizationOutcome, AuthError> {
        let (candidate, frame) = self.candidate.take().ok_or(AuthError::AttemptFinished)?;
        let known = match self.store.load() {
            Ok(known) => known,
            Err(e) => {
                tracing::error!(attempt = %self.id, error = %e, "identity store load failed");
                let mut outcome = self.finish(
                    TerminalState::Unauthorized,
                    REASON_STORE_UNAVAILABLE,
                    None,
                    None,
                    Some(frame),
                );
                outcome.error = Some(e.to_string());
                return Ok(outcome);
            }
        };
        let result = self
            .matcher
            .compare(&candidate, &known, self.config.distance_threshold);

        tracing::debug!(
            attempt = %self.id,
            known = known.len(),
            matched = result.matched,
            distance = result.distance,
            "match computed"
        );

        if result.matched {
            drop(frame);
            Ok(self.finish(
                TerminalState::Authorized,
                REASON_AUTHORIZED,
                result.name,
                Some(result.distance),
                None,
            ))
        } else {
            Ok(self.finish(
                TerminalState::Unauthorized,
                REASON_UNAUTHORIZED,
                None,
                Some(result.distance),
                Some(frame),
            ))
        }
    }

    fn capture(&mut self) -> Result<Frame, AuthError> {
        self.camera.next_frame().ok_or_else(|| {
            tracing::error!(attempt = %self.id, state = ?self.state, "frame source returned no frame");
            AuthError::CaptureFailed("frame source returned no frame".to_string())
        })
    }

    fn transition(&mut self, next: AttemptState) {
        tracing::debug!(attempt = %self.id, from = ?self.state, to = ?next, "attempt transition");
        self.state = next;
    }

    fn finish(
        &mut self,
        terminal: TerminalState,
        reason: &str,
        identity: Option<String>,
        distance: Option<f64>,
        evidence: Option<Frame>,
    ) -> AuthorizationOutcome {
        self.transition(terminal.into());
        let timestamp = Utc::now();

        let alert_delivered = match (&evidence, terminal) {
            (_, TerminalState::Authorized) => None,
            (Some(frame), _) => match self.alerts.notify(frame, reason, timestamp) {
                Ok(()) => Some(true),
                Err(e) => {
                    tracing::warn!(attempt = %self.id, error = %e, reason, "alert delivery failed");
                    Some(false)
                }
            },
            (None, _) => Some(false),
        };

        let authorized = terminal == TerminalState::Authorized;
        if authorized {
            tracing::info!(attempt = %self.id, identity = ?identity, distance = ?distance, "access authorized");
        } else {
            tracing::warn!(attempt = %self.id, state = ?terminal, reason, "access denied");
        }

        AuthorizationOutcome {
            attempt_id: self.id,
            state: terminal,
            authorized,
            identity,
            reason: reason.to_string(),
            distance,
            liveness: self.liveness.clone().unwrap_or_default(),
            evidence_frame: evidence,
            timestamp,
            alert_delivered,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchResult;
    use crate::store::MemoryIdentityStore;
    use crate::testing::{detected_face, RecordingAlerts, ScriptedAnalyzer, ScriptedCamera};
    use std::cell::Cell;

    const OPEN: f32 = 0.3;
    const CLOSED: f32 = 0.1;

    fn alice() -> FaceEncoding {
        FaceEncoding::new(vec![0.2, 0.4, 0.6, 0.8]).unwrap()
    }

    fn store_with_alice() -> MemoryIdentityStore {
        MemoryIdentityStore::with_identities(vec![KnownIdentity {
            name: "alice".to_string(),
            encoding: alice(),
        }])
        .unwrap()
    }

    fn config(frame_limit: u32, required_blinks: u32) -> AuthConfig {
        AuthConfig {
            liveness: LivenessConfig {
                frame_limit,
                required_blinks,
                ..LivenessConfig::default()
            },
            ..AuthConfig::default()
        }
    }

    /// Analyzer scripted for `limit` liveness frames (blinking at `closed`)
    /// followed by one identity frame.
    fn blinking_analyzer(limit: u64, closed: &[u64]) -> ScriptedAnalyzer {
        let mut analyzer = ScriptedAnalyzer::new();
        for seq in 0..limit {
            let ear = if closed.contains(&seq) { CLOSED } else { OPEN };
            analyzer = analyzer.with_faces(seq, vec![detected_face(ear, 0.0)]);
        }
        analyzer
    }

    type TestAuth = Authenticator<ScriptedCamera, ScriptedAnalyzer, MemoryIdentityStore, RecordingAlerts>;

    fn authenticator(analyzer: ScriptedAnalyzer, frames: u64, limit: u32, blinks: u32) -> TestAuth {
        Authenticator::new(
            ScriptedCamera::with_blank_frames(frames),
            analyzer,
            store_with_alice(),
            RecordingAlerts::default(),
            config(limit, blinks),
        )
    }

    #[test]
    fn test_authorized_no_alert_evidence_dropped() {
        let analyzer = blinking_analyzer(10, &[2, 6])
            .with_faces(10, vec![detected_face(OPEN, 0.0)])
            .with_encoding(10, FaceEncoding::new(vec![0.3, 0.4, 0.6, 0.8]).unwrap());
        let mut auth = authenticator(analyzer, 11, 10, 2);

        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::Authorized);
        assert!(outcome.authorized);
        assert_eq!(outcome.identity.as_deref(), Some("alice"));
        assert!((outcome.distance.unwrap() - 0.1).abs() < 1e-9);
        assert!(outcome.evidence_frame.is_none());
        assert_eq!(outcome.alert_delivered, None);
        assert_eq!(outcome.liveness.blinks, 2);
        assert!(auth.alerts().calls().is_empty());
        assert_eq!(auth.source().released, 1);
    }

    #[test]
    fn test_liveness_failure_alerts_once_with_last_frame() {
        let analyzer = blinking_analyzer(50, &[20]);
        let mut auth = authenticator(analyzer, 60, 50, 2);

        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::LivenessFailed);
        assert!(!outcome.authorized);
        assert_eq!(outcome.reason, REASON_SPOOFING);
        assert_eq!(outcome.liveness.blinks, 1);
        assert_eq!(outcome.liveness.frames_processed, 50);
        assert_eq!(outcome.alert_delivered, Some(true));

        let calls = auth.alerts().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (49, REASON_SPOOFING.to_string()));
        assert_eq!(outcome.evidence_frame.as_ref().map(|f| f.seq), Some(49));
        // no identity frame consumed
        assert_eq!(auth.source().remaining(), 10);
    }

    #[test]
    fn test_no_face_in_identity_frame_is_unauthorized() {
        let analyzer = blinking_analyzer(10, &[1, 5]);
        let mut auth = authenticator(analyzer, 11, 10, 2).with_matcher(CountingMatcher::default());

        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::Unauthorized);
        assert_eq!(outcome.reason, REASON_NO_FACE);
        assert!(outcome.identity.is_none());
        assert!(outcome.distance.is_none());
        assert_eq!(auth.matcher().calls.get(), 0);
        assert_eq!(auth.alerts().calls().len(), 1);
        assert_eq!(outcome.evidence_frame.map(|f| f.seq), Some(10));
    }

    #[test]
    fn test_stranger_is_unauthorized_with_alert() {
        let analyzer = blinking_analyzer(10, &[1, 5])
            .with_faces(10, vec![detected_face(OPEN, 0.0)])
            .with_encoding(10, FaceEncoding::new(vec![5.0, 5.0, 5.0, 5.0]).unwrap());
        let mut auth = authenticator(analyzer, 11, 10, 2);

        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::Unauthorized);
        assert_eq!(outcome.reason, REASON_UNAUTHORIZED);
        assert!(outcome.distance.unwrap() > DEFAULT_DISTANCE_THRESHOLD);
        assert!(outcome.evidence_frame.is_some());
        assert_eq!(auth.alerts().calls(), vec![(10, REASON_UNAUTHORIZED.to_string())]);
    }

    /// Store whose backend is gone.
    struct UnreachableStore;

    impl IdentityStore for UnreachableStore {
        fn load(&self) -> Result<Vec<KnownIdentity>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn save(&self, _identities: &[KnownIdentity]) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[test]
    fn test_store_failure_denies_with_alert() {
        let analyzer = blinking_analyzer(4, &[1])
            .with_faces(4, vec![detected_face(OPEN, 0.0)])
            .with_encoding(4, alice());
        let mut auth = Authenticator::new(
            ScriptedCamera::with_blank_frames(5),
            analyzer,
            UnreachableStore,
            RecordingAlerts::default(),
            config(4, 1),
        );

        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::Unauthorized);
        assert!(!outcome.authorized);
        assert_eq!(outcome.reason, REASON_STORE_UNAVAILABLE);
        assert_eq!(outcome.evidence_frame.as_ref().map(|f| f.seq), Some(4));
        assert_eq!(outcome.alert_delivered, Some(true));
        assert_eq!(auth.alerts().calls(), vec![(4, REASON_STORE_UNAVAILABLE.to_string())]);

        let record = outcome.audit_record();
        assert_eq!(record.error, Some(StoreError::Poisoned.to_string()));
        assert!(serde_json::to_string(&record).unwrap().contains("\"error\""));
    }

    #[test]
    fn test_encoding_failure_denies_with_alert() {
        // face detected on the identity frame, but no encoding scripted for it
        let analyzer = blinking_analyzer(4, &[1]).with_faces(4, vec![detected_face(OPEN, 0.0)]);
        let mut auth = authenticator(analyzer, 5, 4, 1).with_matcher(CountingMatcher::default());

        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::Unauthorized);
        assert_eq!(outcome.reason, REASON_ENCODING_FAILED);
        assert!(outcome.error.is_some());
        assert_eq!(auth.matcher().calls.get(), 0);
        assert_eq!(auth.alerts().calls(), vec![(4, REASON_ENCODING_FAILED.to_string())]);
    }

    #[test]
    fn test_empty_store_is_unauthorized() {
        let analyzer = blinking_analyzer(4, &[1])
            .with_faces(4, vec![detected_face(OPEN, 0.0)])
            .with_encoding(4, alice());
        let mut auth = Authenticator::new(
            ScriptedCamera::with_blank_frames(5),
            analyzer,
            MemoryIdentityStore::new(),
            RecordingAlerts::default(),
            config(4, 1),
        );
        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::Unauthorized);
        assert!(outcome.audit_record().distance.is_none());
    }

    #[test]
    fn test_failed_delivery_keeps_decision() {
        let analyzer = blinking_analyzer(5, &[]);
        let mut auth = Authenticator::new(
            ScriptedCamera::with_blank_frames(5),
            analyzer,
            store_with_alice(),
            RecordingAlerts::failing(),
            config(5, 1),
        );
        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(outcome.state, TerminalState::LivenessFailed);
        assert_eq!(outcome.alert_delivered, Some(false));
    }

    #[test]
    fn test_camera_exhausted_is_capture_failed() {
        let analyzer = blinking_analyzer(10, &[]);
        let mut auth = authenticator(analyzer, 5, 10, 2);
        let err = auth.authenticate(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, AuthError::CaptureFailed(_)));
        assert!(auth.alerts().calls().is_empty());
        assert_eq!(auth.source().released, 1);
    }

    #[test]
    fn test_unavailable_camera() {
        let mut auth = Authenticator::new(
            ScriptedCamera::unavailable(),
            ScriptedAnalyzer::new(),
            store_with_alice(),
            RecordingAlerts::default(),
            AuthConfig::default(),
        );
        assert!(matches!(
            auth.authenticate(&CancelToken::new()),
            Err(AuthError::CaptureFailed(_))
        ));
        assert_eq!(auth.source().released, 0);
    }

    #[test]
    fn test_cancel_between_frames_has_no_side_effects() {
        let analyzer = blinking_analyzer(10, &[1, 5]);
        let store = Arc::new(store_with_alice());
        let mut auth = Authenticator::new(
            ScriptedCamera::with_blank_frames(11),
            analyzer,
            Arc::clone(&store),
            RecordingAlerts::default(),
            config(10, 2),
        );

        let cancel = CancelToken::new();
        {
            let mut attempt = auth.begin_attempt().unwrap();
            for _ in 0..3 {
                assert!(attempt.step().unwrap().is_none());
            }
            assert_eq!(attempt.frames_seen(), 3);
            cancel.cancel();
            assert!(matches!(attempt.run(&cancel), Err(AuthError::Cancelled)));
        }

        assert!(auth.alerts().calls().is_empty());
        assert_eq!(auth.source().released, 1);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_dropping_attempt_releases_camera() {
        let mut auth = authenticator(blinking_analyzer(10, &[]), 11, 10, 2);
        {
            let mut attempt = auth.begin_attempt().unwrap();
            attempt.step().unwrap();
        }
        assert_eq!(auth.source().released, 1);
    }

    #[test]
    fn test_state_progression() {
        let analyzer = blinking_analyzer(3, &[1])
            .with_faces(3, vec![detected_face(OPEN, 0.0)])
            .with_encoding(3, alice());
        let mut auth = authenticator(analyzer, 4, 3, 1);
        let mut attempt = auth.begin_attempt().unwrap();

        assert_eq!(attempt.state(), AttemptState::CapturingLiveness);
        for _ in 0..3 {
            attempt.step().unwrap();
        }
        assert_eq!(attempt.state(), AttemptState::CapturingLiveness);
        attempt.step().unwrap();
        assert_eq!(attempt.state(), AttemptState::ExtractingIdentity);
        attempt.step().unwrap();
        assert_eq!(attempt.state(), AttemptState::Matching);
        let outcome = attempt.step().unwrap().unwrap();
        assert_eq!(attempt.state(), AttemptState::Authorized);
        assert!(outcome.authorized);
        assert!(matches!(attempt.step(), Err(AuthError::AttemptFinished)));
    }

    #[test]
    fn test_malformed_landmarks_surface_as_invalid_input() {
        let mut face = detected_face(OPEN, 0.0);
        let mut points = face.landmarks.points().to_vec();
        points[39] = points[36];
        face.landmarks = LandmarkSet::new(points).unwrap();
        let analyzer = ScriptedAnalyzer::new().with_faces(0, vec![face]);
        let mut auth = authenticator(analyzer, 5, 5, 1);

        let err = auth.authenticate(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidInput(_)));
        assert!(auth.alerts().calls().is_empty());
    }

    #[test]
    fn test_fresh_session_per_attempt() {
        let analyzer = blinking_analyzer(4, &[1])
            .with_faces(4, vec![detected_face(OPEN, 0.0)])
            .with_encoding(4, alice());
        let mut auth = authenticator(analyzer, 10, 4, 1);

        let first = auth.authenticate(&CancelToken::new()).unwrap();
        assert!(first.authorized);
        // second attempt sees faceless frames 5..9 -> no blinks
        let second = auth.authenticate(&CancelToken::new()).unwrap();
        assert_eq!(second.state, TerminalState::LivenessFailed);
        assert_eq!(second.liveness.blinks, 0);
        assert_ne!(first.attempt_id, second.attempt_id);
        assert_eq!(auth.source().acquired, 2);
        assert_eq!(auth.source().released, 2);
    }

    #[test]
    fn test_audit_record_serializes() {
        let analyzer = blinking_analyzer(2, &[]);
        let mut auth = authenticator(analyzer, 2, 2, 1);
        let outcome = auth.authenticate(&CancelToken::new()).unwrap();
        let record = outcome.audit_record();
        assert!(record.evidence_retained);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("LivenessFailed"));
        assert!(json.contains(REASON_SPOOFING));
    }

    #[derive(Default)]
    struct CountingMatcher {
        calls: Cell<u32>,
    }

    impl Matcher for CountingMatcher {
        fn compare(&self, candidate: &FaceEncoding, known: &[KnownIdentity], threshold: f64) -> MatchResult {
            self.calls.set(self.calls.get() + 1);
            EuclideanMatcher.compare(candidate, known, threshold)
        }
    }
}
