//! Facial feature extractor contract.

use thiserror::Error;

use crate::geometry::GeometryError;
use crate::types::{BoundingBox, DetectedFace, FaceEncoding, Frame};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("face analysis failed: {0}")]
    Failed(String),
    #[error("malformed analyzer output: {0}")]
    InvalidInput(#[from] GeometryError),
}

/// Detects faces and produces encodings. The model behind it is opaque.
pub trait FaceAnalyzer {
    /// Faces in `frame`, in a stable order (the first face is the one
    /// authenticated).
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, AnalyzerError>;

    /// Encoding of the face inside `bbox`.
    fn encode(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<FaceEncoding, AnalyzerError>;
}
