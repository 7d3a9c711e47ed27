//! Turning a recognition result into one attendance mark per enrolled student.

use crate::types::{RecognitionResult, Roster};
use serde::{Deserialize, Serialize};

/// Present/absent mark for one enrolled student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatus {
    pub student_id: String,
    pub present: bool,
}

/// Counts reported back to the operator after a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub total: u32,
    pub present: u32,
    pub absent: u32,
    /// Present share of the roster, 0–100.
    pub rate: f64,
}

impl SubmissionSummary {
    pub fn from_statuses(statuses: &[StudentStatus]) -> Self {
        let total = u32::try_from(statuses.len()).unwrap_or(u32::MAX);
        let present = u32::try_from(statuses.iter().filter(|s| s.present).count()).unwrap_or(u32::MAX);
        Self {
            total,
            present,
            absent: total - present,
            rate: percentage(present, total),
        }
    }
}

/// Every roster member with a mark, in roster order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendancePlan {
    pub course_id: String,
    pub statuses: Vec<StudentStatus>,
}

impl AttendancePlan {
    pub fn summary(&self) -> SubmissionSummary {
        SubmissionSummary::from_statuses(&self.statuses)
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

/// Mark each enrolled student present iff the result recognized them.
///
/// Unresolved entries never mark anyone present, and recognized ids that are
/// not on this roster are ignored.
pub fn plan_attendance(roster: &Roster, result: &RecognitionResult) -> AttendancePlan {
    AttendancePlan {
        course_id: roster.course_id.clone(),
        statuses: roster
            .students
            .iter()
            .map(|s| StudentStatus {
                student_id: s.id.clone(),
                present: result.is_recognized(&s.id),
            })
            .collect(),
    }
}

/// `part / whole × 100`, or 0 when `whole` is 0.
pub fn percentage(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(whole) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Student, StudentIdentity, UnresolvedEntry};

    fn roster(ids: &[&str]) -> Roster {
        Roster::new(
            "IT-701",
            ids.iter()
                .map(|id| Student {
                    id: (*id).into(),
                    name: format!("Student {id}"),
                    email: format!("{}@uni.edu", id.to_lowercase()),
                    trained: true,
                })
                .collect(),
        )
    }

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

    #[test]
    fn test_plan_marks_recognized_present() {
        let plan = plan_attendance(&roster(&["S1", "S2", "S3"]), &recognized(&["S1", "S3"]));
        let marks: Vec<_> = plan.statuses.iter().map(|s| (s.student_id.as_str(), s.present)).collect();
        assert_eq!(marks, vec![("S1", true), ("S2", false), ("S3", true)]);

        let summary = plan.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.present, 2);
        assert_eq!(summary.absent, 1);
        assert!((summary.rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_plan_ignores_unresolved_and_foreign_ids() {
        let mut result = recognized(&["S9"]);
        result.unresolved.push(UnresolvedEntry {
            identity: StudentIdentity {
                id: "S2".into(),
                name: "Unknown".into(),
                email: String::new(),
            },
            from_id: true,
        });
        let plan = plan_attendance(&roster(&["S1", "S2"]), &result);
        assert!(plan.statuses.iter().all(|s| !s.present));
        assert_eq!(plan.statuses.len(), 2);
    }

    #[test]
    fn test_plan_empty_roster() {
        let plan = plan_attendance(&roster(&[]), &recognized(&["S1"]));
        assert!(plan.is_empty());
        assert_eq!(plan.summary(), SubmissionSummary::default());
    }

    #[test]
    fn test_percentage_zero_whole() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 2), 50.0);
    }
}
