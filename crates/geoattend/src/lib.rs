//! Geofence-gated face recognition attendance.
//!
//! An attendance run resolves the requester's location, checks it against the
//! allowed zones, then captures from the camera for a bounded window, matching
//! faces against the trained templates. Matches are deduplicated and written
//! to a per-session ledger.

pub mod attendance;
pub mod config;
pub mod enrollment;
pub mod events;
pub mod geofence;
pub mod ledger;
pub mod session;

pub use attendance::{AttendError, AttendancePipeline, AttendanceReport};
pub use config::{Config, ConfigError};
pub use enrollment::{
    EnrollError, EnrollmentCapture, EnrollmentRecord, EnrollmentRegistry, EnrollmentSettings,
    EnrollmentSummary, RegistryError, SampleError, SampleStore,
};
pub use events::{ClassifiedFace, NoopObserver, SessionEvent, SessionObserver, TracingObserver};
pub use geofence::{
    AllowedZone, DenyReason, FixedLocation, GateDecision, GeoCoordinate, GeofenceGate, IpLocator,
    LocationError, LocationProvider, ZoneDistance,
};
pub use ledger::{AttendanceLedger, LedgerError, LedgerRow};
pub use session::{
    dedup_by_identity, AttendanceEntry, CancelToken, CaptureSession, CompletedSession,
    SessionError, SessionSettings, SessionState,
};
