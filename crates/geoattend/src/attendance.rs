//! Full attendance run: geofence gate, capture session, ledger write.

use crate::enrollment::EnrollmentRegistry;
use crate::events::{SessionEvent, SessionObserver};
use crate::geofence::{DenyReason, GateDecision, GeofenceGate, LocationProvider, ZoneDistance};
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::session::{CancelToken, CaptureSession, CompletedSession, SessionError, SessionSettings};
use geoattend_core::{FaceDetector, FaceMatcher, MatcherError};
use geoattend_hw::{CameraError, FrameSource};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendError {
    #[error("access denied: {0}")]
    Denied(DenyReason),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug)]
pub struct AttendanceReport {
    pub zone: ZoneDistance,
    pub session: CompletedSession,
    pub ledger_path: PathBuf,
}

/// Wires the gate, registry and ledger for attendance runs.
pub struct AttendancePipeline<'a> {
    pub gate: &'a GeofenceGate,
    pub registry: &'a EnrollmentRegistry,
    pub ledger: &'a AttendanceLedger,
    pub settings: SessionSettings,
    pub cancel: CancelToken,
}

impl<'a> AttendancePipeline<'a> {
    /// Gate on location, then capture, then persist.
    ///
    /// Nothing touches the matcher or camera unless the gate accepts.
    pub fn run<D, M, S, L, C>(
        &self,
        subject_label: &str,
        provider: &dyn LocationProvider,
        detector: D,
        load_matcher: L,
        open_camera: C,
        observer: &mut dyn SessionObserver,
    ) -> Result<AttendanceReport, AttendError>
    where
        D: FaceDetector,
        M: FaceMatcher,
        S: FrameSource,
        L: FnOnce() -> Result<M, MatcherError>,
        C: FnOnce() -> Result<S, CameraError>,
    {
        let decision = self.gate.check(provider);
        observer.on_event(&SessionEvent::Geofence(&decision));
        let zone = match decision {
            GateDecision::Accept(zone) => zone,
            GateDecision::Deny(reason) => return Err(AttendError::Denied(reason)),
        };

        let session = {
            let mut capture = CaptureSession::new(
                self.settings.clone(),
                self.registry,
                detector,
                &mut *observer,
                self.cancel.clone(),
            );
            capture.run(subject_label, load_matcher, open_camera)?
        };

        let ledger_path =
            self.ledger
                .persist(&session.entries, &session.subject_label, session.finished_at)?;
        observer.on_event(&SessionEvent::LedgerWritten(&ledger_path));

        Ok(AttendanceReport {
            zone,
            session,
            ledger_path,
        })
    }
}
