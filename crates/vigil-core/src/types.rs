//! Domain types shared by the verifier, matcher and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::geometry::{GeometryError, Point};

/// Number of points in a landmark set (68-point facial landmark model).
pub const LANDMARK_COUNT: usize = 68;

/// Right-eye landmark indices (external model convention).
pub const RIGHT_EYE: Range<usize> = 36..42;
/// Left-eye landmark indices (external model convention).
pub const LEFT_EYE: Range<usize> = 42..48;

/// Longest accepted identity name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// A raw RGB8 image captured from the frame source.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position of this frame in the source's stream.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8 pixel data, `width * height * 3` bytes when present.
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(seq: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            seq,
            width,
            height,
            data,
            captured_at: Utc::now(),
        }
    }
}

/// Exactly 68 ordered facial landmark points for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point>", into = "Vec<Point>")]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Result<Self, GeometryError> {
        if points.len() != LANDMARK_COUNT {
            return Err(GeometryError::InvalidInput(format!(
                "landmark set requires {LANDMARK_COUNT} points, got {}",
                points.len()
            )));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(GeometryError::InvalidInput(
                "landmark coordinates must be finite".to_string(),
            ));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.points[RIGHT_EYE]
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.points[LEFT_EYE]
    }
}

impl TryFrom<Vec<Point>> for LandmarkSet {
    type Error = GeometryError;

    fn try_from(points: Vec<Point>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<LandmarkSet> for Vec<Point> {
    fn from(set: LandmarkSet) -> Self {
        set.points
    }
}

/// Axis-aligned face bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// One face reported by the feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: LandmarkSet,
}

/// Fixed-length face encoding produced by the external extractor.
///
/// Immutable once constructed; never empty and never contains NaN/Inf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct FaceEncoding {
    values: Vec<f64>,
}

impl FaceEncoding {
    pub fn new(values: Vec<f64>) -> Result<Self, GeometryError> {
        if values.is_empty() {
            return Err(GeometryError::InvalidInput(
                "face encoding must not be empty".to_string(),
            ));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::InvalidInput(
                "face encoding contains NaN/Inf".to_string(),
            ));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`.
    ///
    /// Encodings of different dimension are infinitely far apart, so they
    /// can never satisfy a match threshold.
    pub fn distance(&self, other: &FaceEncoding) -> f64 {
        if self.values.len() != other.values.len() {
            return f64::INFINITY;
        }
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

impl TryFrom<Vec<f64>> for FaceEncoding {
    type Error = GeometryError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FaceEncoding> for Vec<f64> {
    fn from(encoding: FaceEncoding) -> Self {
        encoding.values
    }
}

/// An authorized person: unique name plus enrolled encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub name: String,
    pub encoding: FaceEncoding,
}

/// Check that `name` is usable as an identity key.
///
/// Names are non-empty after trimming, at most [`MAX_NAME_LEN`] characters
/// and free of control characters and path separators (they end up in
/// audit records and file names).
pub fn validate_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if trimmed.len() != name.len() {
        return Err("name must not have leading or trailing whitespace".to_string());
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(format!("name longer than {MAX_NAME_LEN} characters"));
    }
    if name
        .chars()
        .any(|c| c.is_control() || c == '/' || c == '\\')
    {
        return Err("name contains control characters or path separators".to_string());
    }
    Ok(())
}

/// Return the first name that appears more than once, if any.
pub fn find_duplicate(identities: &[KnownIdentity]) -> Option<&str> {
    let mut seen = std::collections::HashSet::with_capacity(identities.len());
    identities
        .iter()
        .map(|id| id.name.as_str())
        .find(|name| !seen.insert(*name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landmarks_require_68_points() {
        let err = LandmarkSet::new(vec![(0.0, 0.0); 67]).unwrap_err();
        assert!(matches!(err, GeometryError::InvalidInput(_)));
        assert!(LandmarkSet::new(vec![(0.0, 0.0); 68]).is_ok());
    }

    #[test]
    fn test_landmarks_reject_nan() {
        let mut pts = vec![(1.0, 1.0); 68];
        pts[40] = (f32::NAN, 0.0);
        assert!(LandmarkSet::new(pts).is_err());
    }

    #[test]
    fn test_eye_slices() {
        let pts: Vec<Point> = (0..68).map(|i| (i as f32, 0.0)).collect();
        let set = LandmarkSet::new(pts).unwrap();
        assert_eq!(set.right_eye()[0].0, 36.0);
        assert_eq!(set.left_eye()[5].0, 47.0);
    }

    #[test]
    fn test_encoding_validation() {
        assert!(FaceEncoding::new(vec![]).is_err());
        assert!(FaceEncoding::new(vec![0.1, f64::INFINITY]).is_err());
        assert!(FaceEncoding::new(vec![0.1, 0.2]).is_ok());
    }

    #[test]
    fn test_encoding_distance() {
        let a = FaceEncoding::new(vec![0.0, 0.0]).unwrap();
        let b = FaceEncoding::new(vec![3.0, 4.0]).unwrap();
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);

        let c = FaceEncoding::new(vec![0.0, 0.0, 0.0]).unwrap();
        assert!(a.distance(&c).is_infinite());
    }

    #[test]
    fn test_encoding_serde_rejects_empty() {
        let err = serde_json::from_str::<FaceEncoding>("[]");
        assert!(err.is_err());
        let ok: FaceEncoding = serde_json::from_str("[0.5, 0.25]").unwrap();
        assert_eq!(ok.dim(), 2);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("Alice Smith").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("  ").is_err());
        assert!(validate_name(" bob").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a\nb").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_find_duplicate() {
        let enc = FaceEncoding::new(vec![0.0]).unwrap();
        let ids = vec![
            KnownIdentity { name: "a".into(), encoding: enc.clone() },
            KnownIdentity { name: "b".into(), encoding: enc.clone() },
            KnownIdentity { name: "a".into(), encoding: enc },
        ];
        assert_eq!(find_duplicate(&ids), Some("a"));
        assert_eq!(find_duplicate(&ids[..2]), None);
    }
}
