//! Active liveness detection via blink counting.
//!
//! A printed photograph or a paused replay cannot blink. The verifier watches
//! the eye aspect ratio (EAR) of the first detected face across a bounded
//! number of frames and counts *blink edges*: transitions from closed
//! (`ear < threshold`) back to open (`ear >= threshold`). A closure spanning
//! several frames is one blink, not several.
//!
//! Optionally the verifier also requires head movement: the mean
//! displacement of all 68 landmarks between two consecutive face-bearing
//! frames must exceed a pixel threshold at least once.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images on a screen.
//! - **Does not block:** Video replay of a blinking subject, 3D masks with
//!   moving eyelids.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{eye_aspect_ratio, mean_displacement, GeometryError};
use crate::types::LandmarkSet;

/// Default number of frames observed per session.
pub const DEFAULT_FRAME_LIMIT: u32 = 50;
/// Default number of blink edges needed to pass.
pub const DEFAULT_REQUIRED_BLINKS: u32 = 2;
/// Default EAR below which the eyes are considered closed.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.2;
/// Default mean landmark displacement (pixels) that counts as head movement.
pub const DEFAULT_HEAD_MOVEMENT_THRESHOLD: f32 = 10.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LivenessError {
    #[error("invalid landmark data: {0}")]
    InvalidInput(#[from] GeometryError),
}

/// Tunables for one liveness session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Frames observed before the session completes.
    pub frame_limit: u32,
    /// Blink edges required for a pass.
    pub required_blinks: u32,
    /// EAR strictly below this value means "eyes closed".
    pub ear_threshold: f32,
    /// Additionally require at least one head movement event.
    pub require_head_movement: bool,
    /// Mean landmark displacement (pixels) between consecutive frames that
    /// counts as a head movement event.
    pub head_movement_threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            frame_limit: DEFAULT_FRAME_LIMIT,
            required_blinks: DEFAULT_REQUIRED_BLINKS,
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            require_head_movement: false,
            head_movement_threshold: DEFAULT_HEAD_MOVEMENT_THRESHOLD,
        }
    }
}

/// Whether a session still wants frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Collecting,
    Complete,
}

/// Result of a blink liveness check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    /// Whether the session passed (true = likely live).
    pub passed: bool,
    /// Blink edges counted.
    pub blinks: u32,
    /// Frames observed, including frames without a face.
    pub frames_processed: u32,
    /// Whether any consecutive frame pair exceeded the movement threshold.
    pub head_movement: bool,
    /// Largest mean landmark displacement seen between consecutive frames.
    pub max_displacement: f32,
}

/// Mutable state for one liveness check. Never persisted.
#[derive(Debug, Clone)]
pub struct LivenessSession {
    config: LivenessConfig,
    frames_seen: u32,
    blink_count: u32,
    eye_closed: bool,
    previous: Option<LandmarkSet>,
    max_displacement: f32,
}

/// Start a session with the given frame budget and blink requirement and
/// default thresholds.
pub fn start_session(frame_limit: u32, required_blinks: u32) -> LivenessSession {
    LivenessSession::new(LivenessConfig {
        frame_limit,
        required_blinks,
        ..LivenessConfig::default()
    })
}

impl LivenessSession {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            frames_seen: 0,
            blink_count: 0,
            eye_closed: false,
            previous: None,
            max_displacement: 0.0,
        }
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }

    pub fn eye_closed(&self) -> bool {
        self.eye_closed
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        if self.frames_seen >= self.config.frame_limit {
            SessionStatus::Complete
        } else {
            SessionStatus::Collecting
        }
    }

    /// Feed the landmark sets detected in one frame.
    ///
    /// Only the first face is considered. A frame with no faces counts
    /// toward the frame budget but leaves the blink state untouched. Frames
    /// offered after completion are ignored. On error the session is left
    /// unchanged.
    pub fn observe(&mut self, faces: &[LandmarkSet]) -> Result<SessionStatus, LivenessError> {
        if self.status() == SessionStatus::Complete {
            return Ok(SessionStatus::Complete);
        }

        let Some(face) = faces.first() else {
            self.frames_seen += 1;
            self.previous = None;
            return Ok(self.status());
        };

        let left = eye_aspect_ratio(face.left_eye())?;
        let right = eye_aspect_ratio(face.right_eye())?;
        let ear = (left + right) / 2.0;

        self.frames_seen += 1;

        if ear < self.config.ear_threshold {
            self.eye_closed = true;
        } else if self.eye_closed {
            self.eye_closed = false;
            self.blink_count += 1;
            tracing::debug!(
                blinks = self.blink_count,
                frame = self.frames_seen,
                "blink detected"
            );
        }

        if let Some(prev) = &self.previous {
            if let Some(disp) = mean_displacement(prev.points(), face.points()) {
                self.max_displacement = self.max_displacement.max(disp);
            }
        }
        self.previous = Some(face.clone());

        Ok(self.status())
    }

    /// Consume the session and decide.
    pub fn verdict(self) -> LivenessResult {
        let head_movement = self.max_displacement > self.config.head_movement_threshold;
        let blinks_ok = self.blink_count >= self.config.required_blinks;
        let movement_ok = !self.config.require_head_movement || head_movement;

        LivenessResult {
            passed: blinks_ok && movement_ok,
            blinks: self.blink_count,
            frames_processed: self.frames_seen,
            head_movement,
            max_displacement: self.max_displacement,
        }
    }
}
