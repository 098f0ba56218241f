//! Planar geometry helpers used by the liveness verifier.

use thiserror::Error;

/// A 2D image-space point `(x, y)` in pixels.
pub type Point = (f32, f32);

/// Horizontal eye widths at or below this are treated as degenerate.
const MIN_EYE_WIDTH: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Euclidean distance between two points.
pub fn euclidean_distance(p1: Point, p2: Point) -> f32 {
    let dx = p2.0 - p1.0;
    let dy = p2.1 - p1.1;
    (dx * dx + dy * dy).sqrt()
}

/// Eye aspect ratio over the 6-point per-eye landmark convention.
///
/// `p0`/`p3` are the horizontal corners; `(p1, p5)` and `(p2, p4)` are the
/// vertical lid pairs:
///
/// ```text
/// ear = (|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)
/// ```
///
/// Only the first six points are read. Fails with
/// [`GeometryError::InvalidInput`] if fewer than six are supplied or if the
/// eye has no horizontal extent.
pub fn eye_aspect_ratio(eye: &[Point]) -> Result<f32, GeometryError> {
    if eye.len() < 6 {
        return Err(GeometryError::InvalidInput(format!(
            "eye requires 6 landmark points, got {}",
            eye.len()
        )));
    }

    let vertical_a = euclidean_distance(eye[1], eye[5]);
    let vertical_b = euclidean_distance(eye[2], eye[4]);
    let horizontal = euclidean_distance(eye[0], eye[3]);

    if !horizontal.is_finite() || horizontal <= MIN_EYE_WIDTH {
        return Err(GeometryError::InvalidInput(
            "eye corners coincide (zero horizontal distance)".to_string(),
        ));
    }

    Ok((vertical_a + vertical_b) / (2.0 * horizontal))
}

/// Mean point-wise displacement between two equally sized point sequences.
///
/// Returns `None` when the sequences are empty or differ in length.
pub fn mean_displacement(prev: &[Point], curr: &[Point]) -> Option<f32> {
    if prev.is_empty() || prev.len() != curr.len() {
        return None;
    }
    let total: f32 = prev
        .iter()
        .zip(curr)
        .map(|(&a, &b)| euclidean_distance(a, b))
        .sum();
    Some(total / prev.len() as f32)
}
