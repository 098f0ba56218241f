//! Vigil core: the authentication decision engine.
//!
//! Decides, for one person in front of a camera, whether to grant access:
//! blink-based liveness first, then nearest-encoding identity matching
//! against the enrolled set. Camera, face model, persistence and alerting
//! are collaborators behind the traits in [`source`], [`analyzer`],
//! [`store`] and [`alert`].

pub mod alert;
pub mod analyzer;
pub mod geometry;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod registration;
pub mod source;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use alert::{AlertChannel, DeliveryError};
pub use analyzer::{AnalyzerError, FaceAnalyzer};
pub use geometry::{euclidean_distance, eye_aspect_ratio, GeometryError, Point};
pub use liveness::{start_session, LivenessConfig, LivenessResult, LivenessSession, SessionStatus};
pub use matcher::{match_identity, EuclideanMatcher, MatchResult, Matcher};
pub use orchestrator::{
    Attempt, AttemptState, AuditRecord, AuthConfig, AuthError, AuthorizationOutcome,
    Authenticator, CancelToken, TerminalState,
};
pub use registration::{BatchReport, RegistrationError, SkippedEntry};
pub use source::{CameraLease, CaptureError, FrameSource};
pub use store::{IdentityStore, MemoryIdentityStore, StoreError};
pub use types::{BoundingBox, DetectedFace, FaceEncoding, Frame, KnownIdentity, LandmarkSet};
