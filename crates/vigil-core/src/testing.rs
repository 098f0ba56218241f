//! Scripted collaborators for tests.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::alert::{AlertChannel, DeliveryError};
use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::geometry::Point;
use crate::source::{CaptureError, FrameSource};
use crate::types::{BoundingBox, DetectedFace, FaceEncoding, Frame, LandmarkSet, LANDMARK_COUNT};

/// A 2x2 black frame with the given sequence number.
pub fn blank_frame(seq: u64) -> Frame {
    Frame::new(seq, 2, 2, vec![0; 12])
}

/// 68 landmarks whose eyes (30px wide) have the given aspect ratio, with
/// every point shifted right by `offset` pixels.
pub fn face_with_ear(ear: f32, offset: f32) -> LandmarkSet {
    let mut points: Vec<Point> = (0..LANDMARK_COUNT)
        .map(|i| (offset + (i % 17) as f32 * 8.0, 100.0 + (i / 17) as f32 * 20.0))
        .collect();

    let half = ear * 30.0 / 2.0;
    for (start, x0) in [(36usize, 40.0f32), (42, 100.0)] {
        let x0 = x0 + offset;
        let y = 60.0;
        let eye = [
            (x0, y),
            (x0 + 10.0, y - half),
            (x0 + 20.0, y - half),
            (x0 + 30.0, y),
            (x0 + 20.0, y + half),
            (x0 + 10.0, y + half),
        ];
        points[start..start + 6].copy_from_slice(&eye);
    }

    LandmarkSet::new(points).expect("68 finite points")
}

pub fn detected_face(ear: f32, offset: f32) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            left: offset,
            top: 0.0,
            width: 160.0,
            height: 180.0,
        },
        landmarks: face_with_ear(ear, offset),
    }
}

/// Camera that serves a fixed queue of frames and counts acquire/release.
#[derive(Debug, Default)]
pub struct ScriptedCamera {
    frames: VecDeque<Frame>,
    available: bool,
    pub acquired: u32,
    pub released: u32,
}

impl ScriptedCamera {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            available: true,
            acquired: 0,
            released: 0,
        }
    }

    /// `count` blank frames with sequence numbers `0..count`.
    pub fn with_blank_frames(count: u64) -> Self {
        Self::new((0..count).map(blank_frame).collect())
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedCamera {
    fn acquire(&mut self) -> Result<(), CaptureError> {
        if !self.available {
            return Err(CaptureError::Unavailable("scripted camera offline".to_string()));
        }
        self.acquired += 1;
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    fn release(&mut self) {
        self.released += 1;
    }
}

/// Analyzer answering from per-frame scripts keyed by `Frame::seq`.
#[derive(Debug, Default)]
pub struct ScriptedAnalyzer {
    faces: HashMap<u64, Vec<DetectedFace>>,
    encodings: HashMap<u64, FaceEncoding>,
    detect_calls: u32,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faces(mut self, seq: u64, faces: Vec<DetectedFace>) -> Self {
        self.faces.insert(seq, faces);
        self
    }

    pub fn with_encoding(mut self, seq: u64, encoding: FaceEncoding) -> Self {
        self.encodings.insert(seq, encoding);
        self
    }

    pub fn detect_calls(&self) -> u32 {
        self.detect_calls
    }
}

impl FaceAnalyzer for ScriptedAnalyzer {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, AnalyzerError> {
        self.detect_calls += 1;
        Ok(self.faces.get(&frame.seq).cloned().unwrap_or_default())
    }

    fn encode(&mut self, frame: &Frame, _bbox: &BoundingBox) -> Result<FaceEncoding, AnalyzerError> {
        self.encodings
            .get(&frame.seq)
            .cloned()
            .ok_or_else(|| AnalyzerError::Failed(format!("no encoding scripted for frame {}", frame.seq)))
    }
}

/// Alert channel that records `(frame seq, reason)` per call.
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    calls: Mutex<Vec<(u64, String)>>,
    fail: bool,
}

impl RecordingAlerts {
    /// Records calls but reports every delivery as failed.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::default(),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<(u64, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl AlertChannel for RecordingAlerts {
    fn notify(
        &self,
        evidence: &Frame,
        reason: &str,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((evidence.seq, reason.to_string()));
        }
        if self.fail {
            return Err(DeliveryError::Failed("scripted delivery failure".to_string()));
        }
        Ok(())
    }
}
