//! Enrollment and removal of authorized identities.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::store::{IdentityStore, StoreError};
use crate::types::{validate_name, Frame, KnownIdentity};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); exactly one person must be in frame")]
    MultipleFacesDetected(usize),
    #[error("identity '{0}' is already registered")]
    DuplicateName(String),
    #[error("identity '{0}' not found")]
    NotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("face analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("identity store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RegistrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateName(name) => Self::DuplicateName(name),
            other => Self::Store(other),
        }
    }
}

/// Register the single face in `frame` under `name`.
///
/// Rejects the frame unless it contains exactly one face. Nothing is written
/// on any error.
pub fn register<G, A>(
    store: &G,
    analyzer: &mut A,
    name: &str,
    frame: &Frame,
) -> Result<KnownIdentity, RegistrationError>
where
    G: IdentityStore + ?Sized,
    A: FaceAnalyzer + ?Sized,
{
    validate_name(name).map_err(RegistrationError::InvalidName)?;

    let faces = analyzer.detect_faces(frame)?;
    let face = match faces.as_slice() {
        [] => return Err(RegistrationError::NoFaceDetected),
        [face] => face,
        many => return Err(RegistrationError::MultipleFacesDetected(many.len())),
    };

    let encoding = analyzer.encode(frame, &face.bbox)?;
    let identity = KnownIdentity {
        name: name.to_string(),
        encoding,
    };
    store.insert(identity.clone())?;

    tracing::info!(name, dim = identity.encoding.dim(), "identity registered");
    Ok(identity)
}

/// Outcome of a bulk enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Names registered, in input order.
    pub registered: Vec<String>,
    /// Entries that were not registered, with the reason.
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Register every `(name, frame)` pair that holds exactly one face.
///
/// Each entry goes through [`register`] on its own; a rejected entry is
/// logged and reported, and the rest still proceed.
pub fn register_batch<G, A, I>(store: &G, analyzer: &mut A, entries: I) -> BatchReport
where
    G: IdentityStore + ?Sized,
    A: FaceAnalyzer + ?Sized,
    I: IntoIterator<Item = (String, Frame)>,
{
    let mut report = BatchReport::default();
    for (name, frame) in entries {
        match register(store, analyzer, &name, &frame) {
            Ok(identity) => report.registered.push(identity.name),
            Err(e) => {
                tracing::warn!(name = %name, seq = frame.seq, error = %e, "skipping enrollment entry");
                report.skipped.push(SkippedEntry {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }
    tracing::info!(
        registered = report.registered.len(),
        skipped = report.skipped.len(),
        "bulk enrollment finished"
    );
    report
}

/// Remove the identity called `name`.
pub fn remove<G: IdentityStore + ?Sized>(store: &G, name: &str) -> Result<(), RegistrationError> {
    if store.remove(name)? {
        tracing::info!(name, "identity removed");
        Ok(())
    } else {
        Err(RegistrationError::NotFound(name.to_string()))
    }
}

/// Registered names, in store order.
pub fn list<G: IdentityStore + ?Sized>(store: &G) -> Result<Vec<String>, RegistrationError> {
    Ok(store.load()?.into_iter().map(|identity| identity.name).collect())
}
