use crate::client::TrainingService;
use crate::inflight::{InFlight, Operation};
use crate::reconciliation::{ReconcileError, Reconciler};
use crate::store::SqliteStore;
use crate::submission::{SubmissionCoordinator, SubmissionError};
use crate::workflow::{CourseContext, Workflow, WorkflowError};
use chrono::{DateTime, Utc};
use rollcall_core::{DateRange, RecognitionResult};
use serde::Serialize;
use std::sync::Arc;
use zbus::{fdo, interface};

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method returns a JSON document.
pub struct AttendanceService {
    pub store: SqliteStore,
    pub workflow: Arc<Workflow>,
    pub submission: SubmissionCoordinator,
    pub reconciler: Reconciler,
    pub training: Arc<dyn TrainingService>,
    pub inflight: InFlight,
    pub camera_device: String,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Capture frames for a course and return the recognition outcome.
    async fn capture(&self, course_id: &str) -> fdo::Result<String> {
        tracing::info!(course_id, "capture requested");
        let guard = self
            .inflight
            .begin(course_id, Operation::Capture)
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;

        let ctx = CourseContext::load(&self.store, course_id)
            .await
            .map_err(workflow_error)?;
        let outcome = self
            .workflow
            .capture_and_recognize(&ctx, &guard)
            .await
            .map_err(workflow_error)?;
        to_json(&outcome)
    }

    /// Abort a capture that has not reached the recognition service yet.
    async fn abort_capture(&self, course_id: &str) -> fdo::Result<String> {
        let outcome = self.inflight.abort(course_id);
        tracing::info!(course_id, ?outcome, "abort requested");
        to_json(&serde_json::json!({ "courseId": course_id, "outcome": outcome }))
    }

    /// Record attendance for every enrolled student from a recognition result.
    ///
    /// `timestamp` is RFC 3339; empty means now. Submitting the same result
    /// with the same timestamp again writes nothing new; a different result
    /// at a timestamp already recorded is refused.
    async fn submit(&self, course_id: &str, result_json: &str, timestamp: &str) -> fdo::Result<String> {
        let result: RecognitionResult = serde_json::from_str(result_json)
            .map_err(|e| fdo::Error::InvalidArgs(format!("invalid recognition result: {e}")))?;
        let at = parse_timestamp(timestamp)?;
        tracing::info!(course_id, %at, recognized = result.recognized_students.len(), "submit requested");

        let _guard = self
            .inflight
            .begin(course_id, Operation::Submit)
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        let receipt = self
            .submission
            .submit_attendance(course_id, &result, at)
            .await
            .map_err(submission_error)?;
        to_json(&receipt)
    }

    /// Sessions of a course with student names, newest first.
    async fn sessions(&self, course_id: &str) -> fdo::Result<String> {
        to_json(&self.reconciler.history(course_id).await.map_err(reconcile_error)?)
    }

    async fn student_stats(&self, student_id: &str, course_id: &str) -> fdo::Result<String> {
        to_json(
            &self
                .reconciler
                .per_student_stats(student_id, course_id)
                .await
                .map_err(reconcile_error)?,
        )
    }

    async fn student_overview(&self, student_id: &str) -> fdo::Result<String> {
        to_json(&self.reconciler.student_overview(student_id).await.map_err(reconcile_error)?)
    }

    /// Per-student report over `start..=end` (YYYY-MM-DD, empty = open).
    async fn report(&self, course_id: &str, start: &str, end: &str) -> fdo::Result<String> {
        let range = DateRange::parse(start, end).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        to_json(
            &self
                .reconciler
                .per_course_report(course_id, range)
                .await
                .map_err(reconcile_error)?,
        )
    }

    /// Data-quality findings for a course. Nothing is modified.
    async fn audit(&self, course_id: &str) -> fdo::Result<String> {
        let report = self.reconciler.audit(course_id).await.map_err(reconcile_error)?;
        if !report.is_clean() {
            tracing::warn!(course_id, anomalies = report.anomalies.len(), "audit found anomalies");
        }
        to_json(&report)
    }

    /// Trigger model training for a course and record who was trained.
    async fn train(&self, course_id: &str) -> fdo::Result<String> {
        tracing::info!(course_id, "training requested");
        if self.store.course(course_id).await.map_err(failed)?.is_none() {
            return Err(fdo::Error::InvalidArgs(format!("unknown course: {course_id}")));
        }

        let report = self.training.run_training(course_id).await.map_err(failed)?;
        let marked = self
            .store
            .mark_trained(report.trained_student_ids.clone())
            .await
            .map_err(failed)?;
        tracing::info!(
            course_id,
            students_trained = report.students_trained,
            total_samples = report.total_samples,
            marked,
            "training complete"
        );
        to_json(&serde_json::json!({ "courseId": course_id, "report": report, "marked": marked }))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let mut courses = Vec::new();
        for course in self.store.courses().await.map_err(failed)? {
            let sessions = self.reconciler.session_count(&course.id).await.map_err(reconcile_error)?;
            courses.push(serde_json::json!({ "id": course.id, "name": course.name, "sessions": sessions }));
        }
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "courses": courses,
            "busy": self.inflight.busy(),
        }))
    }
}

fn parse_timestamp(raw: &str) -> fdo::Result<DateTime<Utc>> {
    if raw.trim().is_empty() {
        return Ok(Utc::now());
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| fdo::Error::InvalidArgs(format!("invalid timestamp {raw:?}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

fn failed(err: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(err.to_string())
}

fn workflow_error(err: WorkflowError) -> fdo::Error {
    tracing::warn!(error = %err, "capture failed");
    match err {
        WorkflowError::UnknownCourse(_) => fdo::Error::InvalidArgs(err.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn submission_error(err: SubmissionError) -> fdo::Error {
    match err {
        SubmissionError::UnknownCourse(_) | SubmissionError::Conflict { .. } => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn reconcile_error(err: ReconcileError) -> fdo::Error {
    match err {
        ReconcileError::UnknownCourse(_) | ReconcileError::UnknownStudent(_) => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}
