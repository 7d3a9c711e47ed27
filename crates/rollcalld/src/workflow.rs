//! Capture workflow: frames → recognition → normalization → resolution.
//!
//! Everything a run needs is passed in explicitly through a
//! [`CourseContext`]; the workflow keeps no per-course state of its own.

use crate::client::{IdResolutionService, RecognitionService, RecognitionServiceError};
use crate::engine::{EngineError, EngineHandle};
use crate::inflight::InFlightGuard;
use crate::store::{SqliteStore, StoreError};
use chrono::{DateTime, Utc};
use rollcall_core::{normalizer, resolver, Course, RecognitionResult, Roster, StudentIdentity};
use rollcall_hw::{CaptureError, CapturePlan};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("unknown course: {0}")]
    UnknownCourse(String),
    #[error("failed to load course: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(EngineError),
    #[error("capture aborted before dispatch")]
    Aborted,
    #[error(transparent)]
    Recognition(#[from] RecognitionServiceError),
}

impl From<EngineError> for WorkflowError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Capture(CaptureError::Aborted) => Self::Aborted,
            other => Self::Engine(other),
        }
    }
}

/// The course a capture is taken for, with its roster as of capture start.
#[derive(Debug, Clone)]
pub struct CourseContext {
    pub course: Course,
    pub roster: Roster,
    pub started_at: DateTime<Utc>,
}

impl CourseContext {
    pub async fn load(store: &SqliteStore, course_id: &str) -> Result<Self, WorkflowError> {
        let course = store
            .course(course_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownCourse(course_id.to_string()))?;
        let roster = store.roster(course_id).await?;
        Ok(Self {
            course,
            roster,
            started_at: Utc::now(),
        })
    }
}

/// How the optional identity-resolution step went.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Nothing was unresolved.
    NotNeeded,
    Applied { asked: usize, promoted: usize },
    /// The lookup failed; the unresolved entries are kept as they were.
    Failed { error: String },
}

/// Result of one capture, ready to show the operator and to submit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutcome {
    pub course_id: String,
    pub batch_id: String,
    pub frames: usize,
    pub result: RecognitionResult,
    pub resolution: ResolutionStatus,
    /// Enrolled students the recognition service cannot match yet.
    pub untrained: Vec<StudentIdentity>,
}

pub struct Workflow {
    engine: EngineHandle,
    recognition: Arc<dyn RecognitionService>,
    resolution: Arc<dyn IdResolutionService>,
    plan: CapturePlan,
}

impl Workflow {
    pub fn new(
        engine: EngineHandle,
        recognition: Arc<dyn RecognitionService>,
        resolution: Arc<dyn IdResolutionService>,
        plan: CapturePlan,
    ) -> Self {
        Self {
            engine,
            recognition,
            resolution,
            plan,
        }
    }

    /// Capture frames for `ctx.course`, recognize them and resolve what can
    /// be resolved. The guard's token aborts the run until the frames are
    /// dispatched.
    pub async fn capture_and_recognize(
        &self,
        ctx: &CourseContext,
        guard: &InFlightGuard,
    ) -> Result<CaptureOutcome, WorkflowError> {
        let course_id = ctx.course.id.as_str();
        let batch_id = Uuid::new_v4().to_string();

        let untrained: Vec<StudentIdentity> = ctx.roster.untrained().map(StudentIdentity::from).collect();
        if !untrained.is_empty() {
            tracing::warn!(
                course_id,
                untrained = untrained.len(),
                "some enrolled students have no trained face model and cannot be recognized"
            );
        }

        let batch = self.engine.capture(self.plan.clone(), guard.token().clone()).await?;
        if !guard.mark_dispatched() {
            tracing::info!(course_id, %batch_id, "capture aborted before dispatch; frames discarded");
            return Err(WorkflowError::Aborted);
        }

        tracing::info!(
            course_id,
            %batch_id,
            frames = batch.frames.len(),
            width = batch.width,
            height = batch.height,
            waited_ms = (Utc::now() - ctx.started_at).num_milliseconds(),
            "dispatching frames for recognition"
        );
        let raw = self.recognition.recognize(course_id, &batch_id, &batch.frames).await?;
        let result = normalizer::normalize_value(&raw, &ctx.roster);
        let (result, resolution) = self.resolve(result, &ctx.roster).await;

        tracing::info!(
            course_id,
            %batch_id,
            faces = result.total_faces,
            recognized = result.recognized_students.len(),
            unresolved = result.unresolved.len(),
            "recognition complete"
        );

        Ok(CaptureOutcome {
            course_id: course_id.to_string(),
            batch_id,
            frames: batch.frames.len(),
            result,
            resolution,
            untrained,
        })
    }

    /// Best effort: a failed lookup leaves the result usable as is.
    async fn resolve(&self, result: RecognitionResult, roster: &Roster) -> (RecognitionResult, ResolutionStatus) {
        let ids = resolver::pending_ids(&result);
        if ids.is_empty() {
            return (result, ResolutionStatus::NotNeeded);
        }

        match self.resolution.resolve(&ids).await {
            Ok(answers) => {
                let before = result.recognized_students.len();
                let merged = resolver::merge(result, roster, &answers);
                let promoted = merged.recognized_students.len() - before;
                (
                    merged,
                    ResolutionStatus::Applied {
                        asked: ids.len(),
                        promoted,
                    },
                )
            }
            Err(e) => {
                tracing::warn!(
                    course_id = %roster.course_id,
                    ids = ids.len(),
                    error = %e,
                    "identity resolution failed; keeping entries unresolved"
                );
                (result, ResolutionStatus::Failed { error: e.to_string() })
            }
        }
    }
}
