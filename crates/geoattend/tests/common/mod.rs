//! In-memory detector, matcher and camera for pipeline tests.

#![allow(dead_code)]

use geoattend::{SessionEvent, SessionObserver, SessionState};
use geoattend_core::{
    BoundingBox, DetectedFace, DetectorError, FaceDetector, FaceMatcher, Identity, MatchResult,
};
use geoattend_hw::{CameraError, Frame, FrameSource};
use image::GrayImage;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

pub const FRAME_EDGE: u32 = 34;

/// Deterministic texture so LBPH histograms are non-trivial.
pub fn textured_frame(seed: u32) -> Vec<u8> {
    (0..FRAME_EDGE * FRAME_EDGE)
        .map(|i| {
            let (x, y) = (i % FRAME_EDGE, i / FRAME_EDGE);
            ((x * 7 + y * 13 + seed * 31) % 256) as u8
        })
        .collect()
}

/// Counts opens, reads and releases of [`FakeCamera`]s.
#[derive(Clone, Default)]
pub struct DeviceCounter {
    pub opened: Rc<Cell<usize>>,
    pub reads: Rc<Cell<usize>>,
    pub released: Rc<Cell<usize>>,
}

impl DeviceCounter {
    pub fn open(&self, failing: bool) -> Result<FakeCamera, CameraError> {
        self.opened.set(self.opened.get() + 1);
        Ok(FakeCamera {
            devices: self.clone(),
            failing,
            stall: None,
            on_read: None,
        })
    }

    /// Every read blocks for `timeout`, then fails the way a camera read
    /// timeout does.
    pub fn open_stalled(&self, timeout: Duration) -> Result<FakeCamera, CameraError> {
        self.opened.set(self.opened.get() + 1);
        Ok(FakeCamera {
            devices: self.clone(),
            failing: true,
            stall: Some(timeout),
            on_read: None,
        })
    }

    pub fn open_with(&self, on_read: impl FnMut(usize) + 'static) -> Result<FakeCamera, CameraError> {
        self.opened.set(self.opened.get() + 1);
        Ok(FakeCamera {
            devices: self.clone(),
            failing: false,
            stall: None,
            on_read: Some(Box::new(on_read)),
        })
    }
}

pub struct FakeCamera {
    devices: DeviceCounter,
    failing: bool,
    stall: Option<Duration>,
    on_read: Option<Box<dyn FnMut(usize)>>,
}

impl FrameSource for FakeCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let n = self.devices.reads.get() + 1;
        self.devices.reads.set(n);
        if let Some(hook) = self.on_read.as_mut() {
            hook(n);
        }
        if let Some(timeout) = self.stall {
            std::thread::sleep(timeout);
            return Err(CameraError::CaptureFailed(format!(
                "no frame within {}ms",
                timeout.as_millis()
            )));
        }
        std::thread::sleep(Duration::from_millis(1));
        if self.failing {
            return Err(CameraError::CaptureFailed("no signal".into()));
        }
        Frame::from_gray(textured_frame(0), FRAME_EDGE, FRAME_EDGE, n as u32)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.devices.released.set(self.devices.released.get() + 1);
    }
}

/// Reports the whole frame as one face.
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let bbox = BoundingBox::new(0, 0, frame.width(), frame.height());
        Ok(vec![DetectedFace::crop(frame, bbox)])
    }
}

/// Never finds a face.
pub struct BlindDetector;

impl FaceDetector for BlindDetector {
    fn detect(&mut self, _frame: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
        Ok(Vec::new())
    }
}

/// Always predicts the same result.
pub struct FixedMatcher(pub MatchResult);

impl FixedMatcher {
    pub fn new(identity: u64, distance: f64) -> Self {
        Self(MatchResult {
            identity: Identity(identity),
            distance,
        })
    }
}

impl FaceMatcher for FixedMatcher {
    fn predict(&self, _face: &DetectedFace) -> MatchResult {
        self.0
    }
}

/// Records what a session reports.
#[derive(Default)]
pub struct RecordingObserver {
    pub states: Vec<SessionState>,
    pub accepted: usize,
    pub unknown: usize,
    pub frames: usize,
    pub completed: usize,
    pub aborted: usize,
    pub samples: usize,
}

impl SessionObserver for RecordingObserver {
    fn on_event(&mut self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::StateChanged { state, .. } => self.states.push(*state),
            SessionEvent::Accepted { .. } => self.accepted += 1,
            SessionEvent::Unknown { .. } => self.unknown += 1,
            SessionEvent::Frame { .. } => self.frames += 1,
            SessionEvent::Completed(_) => self.completed += 1,
            SessionEvent::Aborted(_) => self.aborted += 1,
            SessionEvent::SampleSaved { .. } => self.samples += 1,
            SessionEvent::Geofence(_) | SessionEvent::LedgerWritten(_) => {}
        }
    }
}
