//! rollcall-core: attendance domain logic.
//!
//! Normalizes recognition payloads against a course roster, folds in
//! resolved identities, plans one attendance mark per enrolled student and
//! reconciles persisted rows into sessions, stats and an anomaly audit.
//! No I/O happens here.

pub mod attendance;
pub mod normalizer;
pub mod reconcile;
pub mod resolver;
pub mod types;

pub use attendance::{plan_attendance, AttendancePlan, StudentStatus, SubmissionSummary};
pub use normalizer::{normalize, normalize_value, RawRecognitionPayload, RawStudentEntry};
pub use reconcile::{AuditReport, CourseReport, DataAnomaly, DateRange, Session, StudentOverview, StudentStats};
pub use resolver::ResolvedIdentity;
pub use types::{
    AttendanceRecord, BoundingBox, Course, RecognitionDetection, RecognitionResult, Roster, Student,
    StudentIdentity, UnresolvedEntry,
};
