//! Pipeline events for presentation layers.
//!
//! Observers only watch: nothing they do feeds back into a decision.

use crate::geofence::GateDecision;
use crate::session::{AttendanceEntry, CompletedSession, SessionError, SessionState};
use geoattend_core::{BoundingBox, Identity, MatchResult};
use geoattend_hw::Frame;
use std::path::Path;
use uuid::Uuid;

/// One face from a frame, as the session classified it.
#[derive(Debug, Clone)]
pub struct ClassifiedFace {
    pub bbox: BoundingBox,
    pub result: MatchResult,
    /// Set only when the face produced an attendance entry.
    pub display_name: Option<String>,
}

#[derive(Debug)]
pub enum SessionEvent<'a> {
    Geofence(&'a GateDecision),
    StateChanged {
        session_id: Uuid,
        state: SessionState,
    },
    Accepted {
        entry: &'a AttendanceEntry,
        distance: f64,
    },
    Unknown {
        bbox: BoundingBox,
        result: MatchResult,
    },
    /// Every processed frame, for live preview.
    Frame {
        frame: &'a Frame,
        faces: &'a [ClassifiedFace],
    },
    Completed(&'a CompletedSession),
    Aborted(&'a SessionError),
    LedgerWritten(&'a Path),
    SampleSaved {
        identity: Identity,
        count: usize,
        quota: usize,
    },
}

pub trait SessionObserver {
    fn on_event(&mut self, event: &SessionEvent<'_>);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_event(&mut self, _event: &SessionEvent<'_>) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&mut self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::Geofence(decision) => {
                tracing::info!(accepted = decision.is_accepted(), "{decision}")
            }
            SessionEvent::StateChanged { session_id, state } => {
                tracing::debug!(%session_id, ?state, "session state changed")
            }
            SessionEvent::Accepted { entry, distance } => tracing::info!(
                identity = %entry.identity,
                name = %entry.display_name,
                distance,
                "attendance recorded"
            ),
            SessionEvent::Unknown { bbox, result } => tracing::debug!(
                x = bbox.x,
                y = bbox.y,
                nearest = %result.identity,
                distance = result.distance,
                "unknown face"
            ),
            SessionEvent::Frame { frame, faces } => {
                tracing::trace!(sequence = frame.sequence, faces = faces.len(), "frame processed")
            }
            SessionEvent::Completed(session) => tracing::info!(
                session_id = %session.session_id,
                subject = %session.subject_label,
                entries = session.entries.len(),
                frames = session.frames_read,
                failed_reads = session.failed_reads,
                cancelled = session.cancelled,
                "session completed"
            ),
            SessionEvent::Aborted(error) => tracing::warn!(%error, "session aborted"),
            SessionEvent::LedgerWritten(path) => {
                tracing::info!(path = %path.display(), "attendance ledger written")
            }
            SessionEvent::SampleSaved { identity, count, quota } => {
                tracing::debug!(%identity, count, quota, "enrollment sample saved")
            }
        }
    }
}
