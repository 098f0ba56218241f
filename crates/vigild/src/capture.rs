//! Annotated capture backend.
//!
//! A capture directory holds `manifest.json` plus optional PNG/JPEG frames.
//! Each manifest frame lists the faces a detector found in it (bounding box,
//! 68 landmarks, optional encoding). The directory acts as both the frame
//! source and the face analyzer, so the daemon can run a recorded session
//! end-to-end without a camera driver or a recognition model:
//!
//! Frames can also serve as an enrollment set: each frame with a `name`, or
//! failing that an `image`, registers under that name (the image file stem).
//!
//! ```json
//! {
//!   "width": 640, "height": 480, "loop": true,
//!   "frames": [
//!     { "image": "f000.png", "name": "alice",
//!       "faces": [ { "bbox": {"left": 200, "top": 120, "width": 180, "height": 200},
//!                    "landmarks": [[x, y], ...68],
//!                    "encoding": [0.01, ...] } ] }
//!   ]
//! }
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use vigil_core::{
    AnalyzerError, BoundingBox, CaptureError, DetectedFace, FaceAnalyzer, FaceEncoding, Frame,
    FrameSource, LandmarkSet,
};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum CaptureLoadError {
    #[error("failed to read capture manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid capture manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("capture manifest {0} lists no frames")]
    Empty(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    #[serde(default, rename = "loop")]
    looping: bool,
    frames: Vec<ManifestFrame>,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestFrame {
    image: Option<String>,
    name: Option<String>,
    #[serde(default)]
    faces: Vec<AnnotatedFace>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnnotatedFace {
    bbox: BoundingBox,
    landmarks: LandmarkSet,
    encoding: Option<FaceEncoding>,
}

/// A loaded capture, shared by its camera and analyzer views.
#[derive(Debug)]
pub struct Capture {
    dir: PathBuf,
    manifest: Manifest,
}

impl Capture {
    pub fn load(dir: &Path) -> Result<Arc<Self>, CaptureLoadError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| CaptureLoadError::Read {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|source| CaptureLoadError::Parse {
                path: path.clone(),
                source,
            })?;
        if manifest.frames.is_empty() {
            return Err(CaptureLoadError::Empty(path));
        }

        tracing::info!(
            dir = %dir.display(),
            frames = manifest.frames.len(),
            looping = manifest.looping,
            "capture loaded"
        );
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            manifest,
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frame_count(&self) -> usize {
        self.manifest.frames.len()
    }

    /// `(name, frame)` pairs for bulk enrollment.
    ///
    /// A frame is named by its `name` field or else its image file stem.
    /// Frames with neither, or whose image cannot be decoded, are skipped.
    pub fn enrollment_frames(&self) -> Vec<(String, Frame)> {
        let mut entries = Vec::new();
        for (index, entry) in self.manifest.frames.iter().enumerate() {
            let seq = index as u64;
            let name = entry.name.clone().or_else(|| {
                entry
                    .image
                    .as_deref()
                    .and_then(|file| Path::new(file).file_stem())
                    .map(|stem| stem.to_string_lossy().into_owned())
            });
            let Some(name) = name else {
                continue;
            };
            match self.pixels(seq) {
                Ok((width, height, data)) => {
                    entries.push((name, Frame::new(seq, width, height, data)));
                }
                Err(e) => tracing::warn!(seq, name = %name, error = %e, "skipping enrollment frame"),
            }
        }
        entries
    }

    fn entry(&self, seq: u64) -> &ManifestFrame {
        &self.manifest.frames[(seq % self.frame_count() as u64) as usize]
    }

    /// Pixels for frame `seq`: the referenced image, or black if none.
    fn pixels(&self, seq: u64) -> Result<(u32, u32, Vec<u8>), String> {
        match &self.entry(seq).image {
            Some(file) => {
                let path = self.dir.join(file);
                let img = image::open(&path)
                    .map_err(|e| format!("{}: {e}", path.display()))?
                    .to_rgb8();
                Ok((img.width(), img.height(), img.into_raw()))
            }
            None => {
                let (w, h) = (self.manifest.width, self.manifest.height);
                Ok((w, h, vec![0; (w as usize) * (h as usize) * 3]))
            }
        }
    }
}

/// Frame source view of a [`Capture`]. The stream position survives
/// release/acquire, like a camera that keeps running between attempts.
pub struct CaptureCamera {
    capture: Arc<Capture>,
    next_seq: u64,
    open: bool,
}

impl CaptureCamera {
    pub fn new(capture: Arc<Capture>) -> Self {
        Self {
            capture,
            next_seq: 0,
            open: false,
        }
    }
}

impl FrameSource for CaptureCamera {
    fn acquire(&mut self) -> Result<(), CaptureError> {
        if !self.capture.manifest.looping && self.next_seq >= self.capture.frame_count() as u64 {
            return Err(CaptureError::Unavailable(format!(
                "capture {} exhausted",
                self.capture.dir.display()
            )));
        }
        self.open = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if !self.open {
            return None;
        }
        let seq = self.next_seq;
        if !self.capture.manifest.looping && seq >= self.capture.frame_count() as u64 {
            return None;
        }

        match self.capture.pixels(seq) {
            Ok((width, height, data)) => {
                self.next_seq += 1;
                Some(Frame::new(seq, width, height, data))
            }
            Err(e) => {
                tracing::error!(seq, error = %e, "failed to load capture frame");
                None
            }
        }
    }

    fn release(&mut self) {
        self.open = false;
    }
}

/// Face analyzer view of a [`Capture`]: answers from the annotations of the
/// frame with the same sequence number.
pub struct CaptureAnalyzer {
    capture: Arc<Capture>,
}

impl CaptureAnalyzer {
    pub fn new(capture: Arc<Capture>) -> Self {
        Self { capture }
    }
}

impl FaceAnalyzer for CaptureAnalyzer {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, AnalyzerError> {
        Ok(self
            .capture
            .entry(frame.seq)
            .faces
            .iter()
            .map(|face| DetectedFace {
                bbox: face.bbox,
                landmarks: face.landmarks.clone(),
            })
            .collect())
    }

    fn encode(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<FaceEncoding, AnalyzerError> {
        self.capture
            .entry(frame.seq)
            .faces
            .iter()
            .find(|face| face.bbox == *bbox)
            .and_then(|face| face.encoding.clone())
            .ok_or_else(|| {
                AnalyzerError::Failed(format!("frame {} has no encoding for that face", frame.seq))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn landmarks() -> Vec<[f32; 2]> {
        (0..68).map(|i| [i as f32 * 3.0, 50.0 + (i % 7) as f32]).collect()
    }

    fn write_manifest(dir: &Path, looping: bool) {
        let manifest = json!({
            "width": 4,
            "height": 2,
            "loop": looping,
            "frames": [
                { "faces": [] },
                { "faces": [ {
                    "bbox": { "left": 1.0, "top": 2.0, "width": 3.0, "height": 4.0 },
                    "landmarks": landmarks(),
                    "encoding": [0.1, 0.2, 0.3]
                } ] }
            ]
        });
        std::fs::write(dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
    }

    #[test]
    fn test_replay_without_loop_ends() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), false);
        let capture = Capture::load(dir.path()).unwrap();
        let mut camera = CaptureCamera::new(Arc::clone(&capture));

        assert!(camera.next_frame().is_none(), "closed camera yields nothing");
        camera.acquire().unwrap();
        let f0 = camera.next_frame().unwrap();
        assert_eq!((f0.seq, f0.width, f0.height, f0.data.len()), (0, 4, 2, 24));
        assert_eq!(camera.next_frame().unwrap().seq, 1);
        assert!(camera.next_frame().is_none());
        camera.release();
        assert!(camera.acquire().is_err());
    }

    #[test]
    fn test_replay_loops_and_analyzer_follows() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), true);
        let capture = Capture::load(dir.path()).unwrap();
        let mut camera = CaptureCamera::new(Arc::clone(&capture));
        let mut analyzer = CaptureAnalyzer::new(capture);

        camera.acquire().unwrap();
        let frames: Vec<Frame> = (0..4).filter_map(|_| camera.next_frame()).collect();
        assert_eq!(frames.len(), 4);

        assert!(analyzer.detect_faces(&frames[2]).unwrap().is_empty());
        let faces = analyzer.detect_faces(&frames[3]).unwrap();
        assert_eq!(faces.len(), 1);
        let encoding = analyzer.encode(&frames[3], &faces[0].bbox).unwrap();
        assert_eq!(encoding.values(), &[0.1, 0.2, 0.3]);

        let other = BoundingBox { left: 0.0, top: 0.0, width: 1.0, height: 1.0 };
        assert!(analyzer.encode(&frames[3], &other).is_err());
    }

    #[test]
    fn test_image_frames_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        img.save(dir.path().join("f0.png")).unwrap();
        let manifest = json!({ "frames": [ { "image": "f0.png" } ] });
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest.to_string()).unwrap();

        let mut camera = CaptureCamera::new(Capture::load(dir.path()).unwrap());
        camera.acquire().unwrap();
        let frame = camera.next_frame().unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(&frame.data[..3], &[10, 20, 30]);
    }

    #[test]
    fn test_enrollment_frames_are_named() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        img.save(dir.path().join("carol.png")).unwrap();
        let manifest = json!({
            "frames": [
                { "faces": [] },
                { "image": "carol.png" },
                { "name": "dave" },
                { "image": "missing.png" },
            ]
        });
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest.to_string()).unwrap();

        let capture = Capture::load(dir.path()).unwrap();
        let entries = capture.enrollment_frames();
        let named: Vec<(&str, u64)> = entries.iter().map(|(n, f)| (n.as_str(), f.seq)).collect();
        assert_eq!(named, vec![("carol", 1), ("dave", 2)]);
        assert_eq!((entries[0].1.width, entries[0].1.height), (3, 2));
        assert_eq!((entries[1].1.width, entries[1].1.height), (640, 480));
    }

    #[test]
    fn test_rejects_bad_manifests() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Capture::load(dir.path()),
            Err(CaptureLoadError::Read { .. })
        ));

        std::fs::write(dir.path().join(MANIFEST_FILE), r#"{"frames": []}"#).unwrap();
        assert!(matches!(
            Capture::load(dir.path()),
            Err(CaptureLoadError::Empty(_))
        ));

        // 3 landmarks instead of 68
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"frames": [{"faces": [{"bbox": {"left":0,"top":0,"width":1,"height":1}, "landmarks": [[0,0],[1,1],[2,2]]}]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            Capture::load(dir.path()),
            Err(CaptureLoadError::Parse { .. })
        ));
    }
}
