//! Timed capture-and-match session.
//!
//! `Idle -> Validating -> Running -> Finalizing -> Completed`, with any
//! failure before `Finalizing` landing in `Aborted`. The camera is a local
//! owned value inside `Running`, so it is released on every exit path before
//! [`CaptureSession::run`] returns.

use crate::enrollment::EnrollmentRegistry;
use crate::events::{ClassifiedFace, SessionEvent, SessionObserver};
use chrono::{DateTime, Local};
use geoattend_core::{FaceDetector, FaceMatcher, Identity, MatcherError};
use geoattend_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("template store unavailable: {0}")]
    Config(#[from] MatcherError),
    #[error("camera unavailable: {0}")]
    Device(#[from] CameraError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Validating,
    Running,
    Finalizing,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

/// Shared cancel flag, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub identity: Identity,
    pub display_name: String,
    pub capture_time: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub window: Duration,
    /// Strictly below this distance is a match.
    pub threshold: f64,
    pub warmup_frames: usize,
    pub read_retry: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(20),
            threshold: 70.0,
            warmup_frames: 4,
            read_retry: Duration::from_millis(10),
        }
    }
}

/// Outcome of a session that reached `Completed`.
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub session_id: Uuid,
    pub subject_label: String,
    pub window: Duration,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// Deduplicated by identity, first capture wins.
    pub entries: Vec<AttendanceEntry>,
    pub frames_read: usize,
    pub failed_reads: usize,
    pub cancelled: bool,
}

#[derive(Default)]
struct CaptureStats {
    frames_read: usize,
    failed_reads: usize,
    cancelled: bool,
}

/// Keep the first entry per identity, preserving capture order.
pub fn dedup_by_identity(entries: Vec<AttendanceEntry>) -> Vec<AttendanceEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.identity))
        .collect()
}

/// Reject labels that are empty or would escape the ledger directory.
pub(crate) fn validate_subject(label: &str) -> Result<&str, String> {
    let label = label.trim();
    if label.is_empty() {
        return Err("subject label is empty".into());
    }
    if label.contains(['/', '\\']) || label == "." || label == ".." {
        return Err(format!("subject label {label:?} is not a valid file name"));
    }
    Ok(label)
}

/// One attendance capture for one subject. Single use.
pub struct CaptureSession<'a, D: FaceDetector> {
    id: Uuid,
    settings: SessionSettings,
    registry: &'a EnrollmentRegistry,
    detector: D,
    observer: &'a mut dyn SessionObserver,
    cancel: CancelToken,
    state: SessionState,
}

impl<'a, D: FaceDetector> CaptureSession<'a, D> {
    pub fn new(
        settings: SessionSettings,
        registry: &'a EnrollmentRegistry,
        detector: D,
        observer: &'a mut dyn SessionObserver,
        cancel: CancelToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            registry,
            detector,
            observer,
            cancel,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Validate, capture for the configured window, then deduplicate.
    ///
    /// `load_matcher` runs during validation; `open_camera` only after
    /// validation passed. Neither runs once the session has left `Idle`.
    pub fn run<M, S, L, C>(
        &mut self,
        subject_label: &str,
        load_matcher: L,
        open_camera: C,
    ) -> Result<CompletedSession, SessionError>
    where
        M: FaceMatcher,
        S: FrameSource,
        L: FnOnce() -> Result<M, MatcherError>,
        C: FnOnce() -> Result<S, CameraError>,
    {
        if self.state != SessionState::Idle {
            return Err(SessionError::Validation(format!(
                "session {} already ran (state {:?})",
                self.id, self.state
            )));
        }

        match self.execute(subject_label, load_matcher, open_camera) {
            Ok(completed) => {
                self.transition(SessionState::Completed);
                self.observer.on_event(&SessionEvent::Completed(&completed));
                Ok(completed)
            }
            Err(e) => {
                self.transition(SessionState::Aborted);
                self.observer.on_event(&SessionEvent::Aborted(&e));
                Err(e)
            }
        }
    }

    fn execute<M, S, L, C>(
        &mut self,
        subject_label: &str,
        load_matcher: L,
        open_camera: C,
    ) -> Result<CompletedSession, SessionError>
    where
        M: FaceMatcher,
        S: FrameSource,
        L: FnOnce() -> Result<M, MatcherError>,
        C: FnOnce() -> Result<S, CameraError>,
    {
        self.transition(SessionState::Validating);
        let subject = validate_subject(subject_label).map_err(SessionError::Validation)?;
        let matcher = load_matcher()?;

        self.transition(SessionState::Running);
        let started_at = Local::now();
        let (provisional, stats) = {
            let mut camera = open_camera()?;
            tracing::info!(session_id = %self.id, subject, "camera acquired");
            camera.warm_up(self.settings.warmup_frames);
            self.capture(&mut camera, &matcher)
        };
        tracing::debug!(session_id = %self.id, "camera released");

        self.transition(SessionState::Finalizing);
        let raw = provisional.len();
        let entries = dedup_by_identity(provisional);
        tracing::info!(
            session_id = %self.id,
            raw_matches = raw,
            entries = entries.len(),
            "session finalized"
        );

        Ok(CompletedSession {
            session_id: self.id,
            subject_label: subject.to_string(),
            window: self.settings.window,
            started_at,
            finished_at: Local::now(),
            entries,
            frames_read: stats.frames_read,
            failed_reads: stats.failed_reads,
            cancelled: stats.cancelled,
        })
    }

    /// Frame loop. Runs until the deadline or cancellation.
    fn capture<M: FaceMatcher, S: FrameSource>(
        &mut self,
        camera: &mut S,
        matcher: &M,
    ) -> (Vec<AttendanceEntry>, CaptureStats) {
        let registry = self.registry;
        let threshold = self.settings.threshold;
        let deadline = Instant::now() + self.settings.window;
        let mut provisional = Vec::new();
        let mut stats = CaptureStats::default();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(session_id = %self.id, "session cancelled");
                stats.cancelled = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let frame = match camera.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    stats.failed_reads += 1;
                    tracing::debug!(error = %e, "frame read failed; retrying");
                    std::thread::sleep(self.settings.read_retry.min(deadline - now));
                    continue;
                }
            };
            stats.frames_read += 1;

            let faces = match self.detector.detect(&frame.image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, sequence = frame.sequence, "detection failed; skipping frame");
                    continue;
                }
            };

            let mut classified = Vec::with_capacity(faces.len());
            for face in &faces {
                let result = matcher.predict(face);
                let name = if result.is_match(threshold) {
                    registry.display_name(result.identity)
                } else {
                    None
                };

                match name {
                    Some(name) => {
                        let entry = AttendanceEntry {
                            identity: result.identity,
                            display_name: name.to_string(),
                            capture_time: Local::now(),
                        };
                        self.observer.on_event(&SessionEvent::Accepted {
                            entry: &entry,
                            distance: result.distance,
                        });
                        provisional.push(entry);
                    }
                    None => self.observer.on_event(&SessionEvent::Unknown {
                        bbox: face.bbox,
                        result,
                    }),
                }

                classified.push(ClassifiedFace {
                    bbox: face.bbox,
                    result,
                    display_name: name.map(str::to_string),
                });
            }

            self.observer.on_event(&SessionEvent::Frame {
                frame: &frame,
                faces: &classified,
            });
        }

        (provisional, stats)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        self.observer.on_event(&SessionEvent::StateChanged {
            session_id: self.id,
            state: next,
        });
    }
}
