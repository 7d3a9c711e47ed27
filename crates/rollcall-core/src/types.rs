use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An enrolled student as the roster provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Whether the recognition service holds an embedding for this student.
    #[serde(default)]
    pub trained: bool,
}

/// A course offered in a term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub code: String,
    pub name: String,
}

/// The enrolled students of one course.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Roster {
    pub course_id: String,
    pub students: Vec<Student>,
}

impl Roster {
    pub fn new(course_id: impl Into<String>, students: Vec<Student>) -> Self {
        Self {
            course_id: course_id.into(),
            students,
        }
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn get(&self, student_id: &str) -> Option<&Student> {
        self.students.iter().find(|s| s.id == student_id)
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.get(student_id).is_some()
    }

    /// Students the recognition service cannot possibly match.
    pub fn untrained(&self) -> impl Iterator<Item = &Student> {
        self.students.iter().filter(|s| !s.trained)
    }
}

/// The `{id, name, email}` triple every recognized entry is normalized to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl From<&Student> for StudentIdentity {
    fn from(s: &Student) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            email: s.email.clone(),
        }
    }
}

/// A recognized entry that matched no roster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedEntry {
    #[serde(flatten)]
    pub identity: StudentIdentity,
    /// `identity.id` was read from an id field. Otherwise it is a name,
    /// email or raw text standing in for one, and cannot be looked up.
    #[serde(default)]
    pub from_id: bool,
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from corner coordinates `[x1, y1, x2, y2]`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }
}

/// One face found in one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionDetection {
    pub image_index: u32,
    pub face_index: u32,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    /// Match confidence in [0, 1].
    pub confidence: f32,
    /// Roster id of the matched student, `None` for an unrecognized face.
    #[serde(default)]
    pub student_id: Option<String>,
}

/// Canonical outcome of one capture, ready for submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub total_faces: u32,
    /// Roster members seen in the capture, deduplicated by id.
    pub recognized_students: Vec<StudentIdentity>,
    /// Entries that matched no roster member. Shown, never marked present.
    #[serde(default)]
    pub unresolved: Vec<UnresolvedEntry>,
    /// Mean confidence in [0, 1].
    pub average_confidence: f32,
    #[serde(default)]
    pub detections: Vec<RecognitionDetection>,
}

impl RecognitionResult {
    pub fn is_recognized(&self, student_id: &str) -> bool {
        self.recognized_students.iter().any(|s| s.id == student_id)
    }

    /// Add a roster identity unless one with the same id is already present.
    pub(crate) fn push_recognized(&mut self, identity: StudentIdentity) -> bool {
        if self.is_recognized(&identity.id) {
            return false;
        }
        self.recognized_students.push(identity);
        true
    }
}

/// One persisted attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    /// Session key shared by every row of one submission.
    pub timestamp: DateTime<Utc>,
    /// `true` = present.
    pub status: bool,
}
