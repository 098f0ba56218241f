//! Alert channel contract.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Frame;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("alert delivery failed: {0}")]
    Failed(String),
    #[error("alert I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives evidence of denied attempts.
pub trait AlertChannel {
    fn notify(
        &self,
        evidence: &Frame,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DeliveryError>;
}

impl<T: AlertChannel + ?Sized> AlertChannel for std::sync::Arc<T> {
    fn notify(
        &self,
        evidence: &Frame,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        (**self).notify(evidence, reason, timestamp)
    }
}
