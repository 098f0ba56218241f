//! Frame source contract and scoped camera acquisition.

use thiserror::Error;

use crate::types::Frame;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
}

/// A stream of raw frames, typically a camera.
///
/// `acquire` and `release` bracket one authentication attempt. Callers should
/// go through [`CameraLease`] rather than pairing them by hand.
pub trait FrameSource {
    /// Prepare the device for capture.
    fn acquire(&mut self) -> Result<(), CaptureError>;

    /// Next frame, or `None` when the device is unavailable or the stream ended.
    fn next_frame(&mut self) -> Option<Frame>;

    /// Return the device. Must be safe to call after a failed capture.
    fn release(&mut self);
}

/// Exclusive hold on a [`FrameSource`] for the duration of one attempt.
///
/// The source is released when the lease is dropped, whichever way the
/// attempt ends.
pub struct CameraLease<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: FrameSource + ?Sized> CameraLease<'a, S> {
    pub fn acquire(source: &'a mut S) -> Result<Self, CaptureError> {
        source.acquire()?;
        tracing::debug!("camera acquired");
        Ok(Self { source })
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        self.source.next_frame()
    }
}

impl<S: FrameSource + ?Sized> Drop for CameraLease<'_, S> {
    fn drop(&mut self) {
        self.source.release();
        tracing::debug!("camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCamera;

    #[test]
    fn test_lease_releases_on_drop() {
        let mut cam = ScriptedCamera::with_blank_frames(3);
        {
            let mut lease = CameraLease::acquire(&mut cam).unwrap();
            assert!(lease.next_frame().is_some());
        }
        assert_eq!(cam.acquired, 1);
        assert_eq!(cam.released, 1);
    }

    #[test]
    fn test_failed_acquire_does_not_release() {
        let mut cam = ScriptedCamera::unavailable();
        assert!(CameraLease::acquire(&mut cam).is_err());
        assert_eq!(cam.released, 0);
    }
}
