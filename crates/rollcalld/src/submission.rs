//! Attendance submission: one row per enrolled student, written atomically.

use crate::store::{BatchOutcome, SqliteStore, StoreError};
use chrono::{DateTime, Utc};
use rollcall_core::{plan_attendance, RecognitionResult, StudentStatus, SubmissionSummary};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("unknown course: {0}")]
    UnknownCourse(String),
    #[error("failed to load roster: {0}")]
    Roster(#[source] StoreError),
    /// Rows already stored at this timestamp say otherwise. Recorded rows
    /// are never rewritten; nothing from this submission was kept.
    #[error("course {course_id} already has a different session recorded at {timestamp} ({} students differ)", .students.len())]
    Conflict {
        course_id: String,
        timestamp: DateTime<Utc>,
        students: Vec<String>,
    },
    /// The batch was rolled back; resubmitting the same result is safe.
    #[error("attendance batch rolled back: {0}")]
    Transaction(#[source] StoreError),
}

/// What a submission wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub course_id: String,
    /// Session key shared by every row of this submission.
    pub timestamp: DateTime<Utc>,
    pub summary: SubmissionSummary,
    pub statuses: Vec<StudentStatus>,
    pub inserted: usize,
    pub already_present: usize,
}

#[derive(Clone)]
pub struct SubmissionCoordinator {
    store: SqliteStore,
}

impl SubmissionCoordinator {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Mark every enrolled student of `course_id` present or absent from
    /// `result`, all at `timestamp`.
    ///
    /// The timestamp is truncated to the stored millisecond precision before
    /// any row is written. Resubmitting the same result at the same
    /// timestamp writes nothing new; a different result at that timestamp
    /// is refused with [`SubmissionError::Conflict`].
    pub async fn submit_attendance(
        &self,
        course_id: &str,
        result: &RecognitionResult,
        timestamp: DateTime<Utc>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        if self
            .store
            .course(course_id)
            .await
            .map_err(SubmissionError::Roster)?
            .is_none()
        {
            return Err(SubmissionError::UnknownCourse(course_id.to_string()));
        }

        let timestamp = session_timestamp(timestamp);
        let roster = self.store.roster(course_id).await.map_err(SubmissionError::Roster)?;
        let plan = plan_attendance(&roster, result);
        let summary = plan.summary();

        if plan.is_empty() {
            tracing::warn!(course_id, "roster is empty; no attendance rows written");
            return Ok(SubmissionReceipt {
                course_id: course_id.to_string(),
                timestamp,
                summary,
                statuses: Vec::new(),
                inserted: 0,
                already_present: 0,
            });
        }

        if !result.unresolved.is_empty() {
            tracing::info!(
                course_id,
                unresolved = result.unresolved.len(),
                "unresolved entries excluded from present count"
            );
        }

        let BatchOutcome {
            inserted,
            already_present,
        } = self
            .store
            .create_attendance_batch(course_id, timestamp, plan.statuses.clone())
            .await
            .map_err(|e| match e {
                StoreError::SessionConflict { students, .. } => {
                    tracing::warn!(
                        course_id,
                        %timestamp,
                        differing = students.len(),
                        "a different session is already recorded at this timestamp; nothing written"
                    );
                    SubmissionError::Conflict {
                        course_id: course_id.to_string(),
                        timestamp,
                        students,
                    }
                }
                e => {
                    tracing::error!(course_id, error = %e, "attendance batch rolled back");
                    SubmissionError::Transaction(e)
                }
            })?;

        if already_present > 0 {
            tracing::warn!(
                course_id,
                %timestamp,
                already_present,
                "session already recorded at this timestamp; matching rows kept"
            );
        }
        tracing::info!(
            course_id,
            %timestamp,
            total = summary.total,
            present = summary.present,
            absent = summary.absent,
            inserted,
            "attendance submitted"
        );

        Ok(SubmissionReceipt {
            course_id: course_id.to_string(),
            timestamp,
            summary,
            statuses: plan.statuses,
            inserted,
            already_present,
        })
    }
}

/// Truncate to whole milliseconds, the precision rows are stored at.
pub fn session_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::seeded_store;
    use crate::store::AttendanceFilter;
    use chrono::{Duration, TimeZone};
    use rollcall_core::{StudentIdentity, UnresolvedEntry};

    fn recognized(ids: &[&str]) -> RecognitionResult {
        RecognitionResult {
            recognized_students: ids
                .iter()
                .map(|id| StudentIdentity {
                    id: (*id).into(),
                    name: String::new(),
                    email: String::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_submit_marks_roster() {
        let store = seeded_store().await;
        let coordinator = SubmissionCoordinator::new(store.clone());
        let receipt = coordinator
            .submit_attendance("IT-701", &recognized(&["S1", "S3"]), t1())
            .await
            .unwrap();
        assert_eq!(receipt.summary.total, 3);
        assert_eq!(receipt.summary.present, 2);
        assert_eq!(receipt.inserted, 3);

        let rows = store.query_attendance("IT-701", AttendanceFilter::default()).await.unwrap();
        let marks: Vec<_> = rows.iter().map(|r| (r.student_id.as_str(), r.status)).collect();
        assert_eq!(marks, vec![("S1", true), ("S2", false), ("S3", true)]);
    }

    #[tokio::test]
    async fn test_unresolved_never_marked_present() {
        let store = seeded_store().await;
        let mut result = recognized(&[]);
        result.unresolved.push(UnresolvedEntry {
            identity: StudentIdentity {
                id: "Unknown Face".into(),
                name: "Unknown Face".into(),
                email: String::new(),
            },
            from_id: false,
        });
        let receipt = SubmissionCoordinator::new(store)
            .submit_attendance("IT-701", &result, t1())
            .await
            .unwrap();
        assert_eq!(receipt.summary.present, 0);
        assert_eq!(receipt.summary.absent, 3);
    }

    #[tokio::test]
    async fn test_unknown_course() {
        let coordinator = SubmissionCoordinator::new(seeded_store().await);
        let err = coordinator
            .submit_attendance("NOPE", &recognized(&["S1"]), t1())
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::UnknownCourse(c) if c == "NOPE"));
    }

    #[tokio::test]
    async fn test_empty_roster_writes_nothing() {
        let store = seeded_store().await;
        let receipt = SubmissionCoordinator::new(store.clone())
            .submit_attendance("EMPTY-1", &recognized(&["S1"]), t1())
            .await
            .unwrap();
        assert_eq!(receipt.summary, SubmissionSummary::default());
        assert!(store
            .query_attendance("EMPTY-1", AttendanceFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_resubmit_same_result_is_idempotent() {
        let store = seeded_store().await;
        let coordinator = SubmissionCoordinator::new(store.clone());
        let at = t1() + Duration::nanoseconds(123_456_789);
        let result = recognized(&["S1"]);
        coordinator.submit_attendance("IT-701", &result, at).await.unwrap();
        let again = coordinator.submit_attendance("IT-701", &result, at).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_present, 3);
        assert_eq!(again.timestamp, t1() + Duration::milliseconds(123));

        let rows = store.query_attendance("IT-701", AttendanceFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_different_result_at_same_timestamp_conflicts() {
        let store = seeded_store().await;
        let coordinator = SubmissionCoordinator::new(store.clone());
        coordinator
            .submit_attendance("IT-701", &recognized(&["S1", "S3"]), t1())
            .await
            .unwrap();

        let err = coordinator
            .submit_attendance("IT-701", &recognized(&["S2"]), t1())
            .await
            .unwrap_err();
        match err {
            SubmissionError::Conflict {
                course_id,
                timestamp,
                students,
            } => {
                assert_eq!(course_id, "IT-701");
                assert_eq!(timestamp, t1());
                assert_eq!(students, vec!["S1", "S2", "S3"]);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        let rows = store.query_attendance("IT-701", AttendanceFilter::default()).await.unwrap();
        let marks: Vec<_> = rows.iter().map(|r| (r.student_id.as_str(), r.status)).collect();
        assert_eq!(marks, vec![("S1", true), ("S2", false), ("S3", true)]);

        // a later session is unaffected
        let later = coordinator
            .submit_attendance("IT-701", &recognized(&["S2"]), t1() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(later.inserted, 3);
        assert_eq!(later.summary.present, 1);
    }
}
