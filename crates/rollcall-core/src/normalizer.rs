//! Recognition payload normalization.
//!
//! The recognition backend evolves independently of this crate, so its
//! response is read as untyped JSON and converted by explicit variant
//! matching into a [`RecognitionResult`]. Every step is total: unknown
//! shapes degrade to "unresolved" or to defaults, never to an error.

use crate::types::{
    BoundingBox, RecognitionDetection, RecognitionResult, Roster, Student, StudentIdentity, UnresolvedEntry,
};
use serde_json::{Map, Value};

/// Shortest string allowed to take part in a substring match.
const MIN_SUBSTRING_LEN: usize = 3;
/// Name given to entries that carry no usable name.
pub(crate) const UNKNOWN_NAME: &str = "Unknown";
/// Identity given to entries that carry nothing usable at all.
const UNKNOWN_ID: &str = "unknown";

const ID_KEYS: &[&str] = &["id", "studentId", "student_id"];
const NAME_KEYS: &[&str] = &["name", "studentName", "student_name", "displayName", "display_name"];
const EMAIL_KEYS: &[&str] = &["email", "studentEmail", "student_email"];

/// One entry of the raw `recognizedStudents` list.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStudentEntry {
    /// A bare id string (numbers are stringified).
    BareId(String),
    /// An object exposing any subset of the known identity fields.
    Record(RawStudentRecord),
    /// Anything else, kept as its JSON text.
    Opaque(String),
}

/// Identity fields an object entry may carry, under any of their aliases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStudentRecord {
    pub ids: Vec<String>,
    pub names: Vec<String>,
    pub emails: Vec<String>,
    /// JSON text of the original object, the identity of last resort.
    pub raw: String,
}

/// One entry of the raw `detections` list, fields coerced but not yet resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetection {
    pub image_index: u32,
    pub face_index: u32,
    pub bbox: Option<BoundingBox>,
    pub confidence: f32,
    pub student_id: Option<String>,
}

/// The recognition response after tolerant parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecognitionPayload {
    pub total_faces: Option<u32>,
    pub recognized_students: Vec<RawStudentEntry>,
    pub average_confidence: f32,
    pub detections: Vec<RawDetection>,
    /// An `error` string the service embedded in an otherwise normal body.
    pub service_error: Option<String>,
}

impl RawRecognitionPayload {
    pub fn from_value(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::default();
        };

        let detections: Vec<RawDetection> = list(map, &["detections", "faces"])
            .iter()
            .map(RawDetection::from_value)
            .collect();

        Self {
            total_faces: first(map, &["totalFaces", "total_faces"]).and_then(coerce_u32),
            recognized_students: list(map, &["recognizedStudents", "recognized_students", "students"])
                .iter()
                .map(RawStudentEntry::from_value)
                .collect(),
            average_confidence: first(map, &["averageConfidence", "average_confidence"])
                .and_then(coerce_f32)
                .map(unit_interval)
                .unwrap_or(0.0),
            detections,
            service_error: first(map, &["error"]).and_then(text),
        }
    }
}

impl RawStudentEntry {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) if !s.trim().is_empty() => Self::BareId(s.trim().to_string()),
            Value::Number(n) => Self::BareId(n.to_string()),
            Value::Object(map) => Self::Record(RawStudentRecord {
                ids: texts(map, ID_KEYS),
                names: texts(map, NAME_KEYS),
                emails: texts(map, EMAIL_KEYS),
                raw: value.to_string(),
            }),
            other => Self::Opaque(other.to_string()),
        }
    }

    /// The values this entry offers for each matching rule.
    fn candidates(&self) -> Candidates<'_> {
        match self {
            Self::BareId(id) => Candidates {
                ids: std::slice::from_ref(id),
                names: std::slice::from_ref(id),
                emails: std::slice::from_ref(id),
            },
            Self::Record(r) => Candidates {
                ids: &r.ids,
                names: &r.names,
                emails: &r.emails,
            },
            Self::Opaque(_) => Candidates::default(),
        }
    }

    /// Whether the fallback identity's id comes from an id field.
    fn has_id(&self) -> bool {
        match self {
            Self::BareId(_) => true,
            Self::Record(r) => !r.ids.is_empty(),
            Self::Opaque(_) => false,
        }
    }

    /// Identity used when no roster member matches.
    fn fallback_identity(&self) -> StudentIdentity {
        match self {
            Self::BareId(id) => StudentIdentity {
                id: id.clone(),
                name: UNKNOWN_NAME.to_string(),
                email: String::new(),
            },
            Self::Record(r) => {
                let id = r
                    .ids
                    .iter()
                    .chain(&r.names)
                    .chain(&r.emails)
                    .next()
                    .cloned()
                    .unwrap_or_else(|| non_empty_or(&r.raw, UNKNOWN_ID));
                StudentIdentity {
                    name: r.names.first().cloned().unwrap_or_else(|| UNKNOWN_NAME.to_string()),
                    email: r.emails.first().cloned().unwrap_or_default(),
                    id,
                }
            }
            Self::Opaque(raw) => StudentIdentity {
                id: non_empty_or(raw, UNKNOWN_ID),
                name: UNKNOWN_NAME.to_string(),
                email: String::new(),
            },
        }
    }
}

impl RawDetection {
    pub fn from_value(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::default();
        };
        Self {
            image_index: first(map, &["imageIndex", "image_index", "frameIndex", "frame_index", "frame"])
                .and_then(coerce_u32)
                .unwrap_or(0),
            face_index: first(map, &["faceIndex", "face_index", "face"])
                .and_then(coerce_u32)
                .unwrap_or(0),
            bbox: first(map, &["bbox", "box"]).and_then(coerce_bbox),
            confidence: first(map, &["confidence", "score", "similarity"])
                .and_then(coerce_f32)
                .map(unit_interval)
                .unwrap_or(0.0),
            student_id: first(map, &["studentId", "student_id", "id", "name"]).and_then(text),
        }
    }
}

/// Matching rules in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    ExactId,
    IdIgnoreCase,
    NameIgnoreCase,
    EmailIgnoreCase,
    Substring,
}

/// A roster member found for a raw entry, and the rule that found it.
#[derive(Debug, Clone, Copy)]
pub struct RosterMatch<'a> {
    pub student: &'a Student,
    pub rule: MatchRule,
}

#[derive(Default)]
struct Candidates<'a> {
    ids: &'a [String],
    names: &'a [String],
    emails: &'a [String],
}

impl<'a> Candidates<'a> {
    fn all(&self) -> impl Iterator<Item = &'a String> + 'a {
        self.ids.iter().chain(self.names).chain(self.emails)
    }
}

/// Find the roster member a raw entry refers to. The first rule with any
/// hit wins; within a rule, roster order decides.
pub fn match_entry<'a>(entry: &RawStudentEntry, roster: &'a Roster) -> Option<RosterMatch<'a>> {
    let cand = entry.candidates();
    let hit = move |rule: MatchRule, pred: &dyn Fn(&Student) -> bool| {
        roster
            .students
            .iter()
            .find(|&s| pred(s))
            .map(|student| RosterMatch { student, rule })
    };

    hit(MatchRule::ExactId, &|s| cand.ids.iter().any(|c| *c == s.id))
        .or_else(|| hit(MatchRule::IdIgnoreCase, &|s| cand.ids.iter().any(|c| eq_ic(c, &s.id))))
        .or_else(|| hit(MatchRule::NameIgnoreCase, &|s| cand.names.iter().any(|c| eq_ic(c, &s.name))))
        .or_else(|| hit(MatchRule::EmailIgnoreCase, &|s| cand.emails.iter().any(|c| eq_ic(c, &s.email))))
        .or_else(|| {
            hit(MatchRule::Substring, &|s| {
                cand
                    .all()
                    .any(|c| [&s.id, &s.name, &s.email].into_iter().any(|field| contains_ic(c, field)))
            })
        })
}

/// An entry after roster matching.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub identity: StudentIdentity,
    pub resolved: bool,
}

/// Normalize one raw entry. Total: always yields a well-formed identity.
pub fn normalize_entry(entry: &RawStudentEntry, roster: &Roster) -> NormalizedEntry {
    match match_entry(entry, roster) {
        Some(m) => NormalizedEntry {
            identity: StudentIdentity::from(m.student),
            resolved: true,
        },
        None => NormalizedEntry {
            identity: entry.fallback_identity(),
            resolved: false,
        },
    }
}

/// Normalize a parsed payload against the course roster.
pub fn normalize(payload: &RawRecognitionPayload, roster: &Roster) -> RecognitionResult {
    let mut result = RecognitionResult::default();

    for entry in &payload.recognized_students {
        let normalized = normalize_entry(entry, roster);
        if normalized.resolved {
            result.push_recognized(normalized.identity);
        } else if !result.unresolved.iter().any(|u| u.identity.id == normalized.identity.id) {
            tracing::debug!(
                course_id = %roster.course_id,
                entry = %normalized.identity.id,
                "recognized entry matches no roster member; keeping as unresolved"
            );
            result.unresolved.push(UnresolvedEntry {
                identity: normalized.identity,
                from_id: entry.has_id(),
            });
        }
    }

    result.detections = payload
        .detections
        .iter()
        .map(|d| RecognitionDetection {
            image_index: d.image_index,
            face_index: d.face_index,
            bbox: d.bbox.clone(),
            confidence: d.confidence,
            student_id: d.student_id.as_ref().and_then(|id| {
                match_entry(&RawStudentEntry::BareId(id.clone()), roster).map(|m| m.student.id.clone())
            }),
        })
        .collect();

    result.total_faces = payload
        .total_faces
        .unwrap_or_else(|| u32::try_from(result.detections.len()).unwrap_or(u32::MAX));
    result.average_confidence = payload.average_confidence;

    tracing::debug!(
        course_id = %roster.course_id,
        recognized = result.recognized_students.len(),
        unresolved = result.unresolved.len(),
        detections = result.detections.len(),
        "normalized recognition payload"
    );

    result
}

/// Parse and normalize in one step.
pub fn normalize_value(value: &Value, roster: &Roster) -> RecognitionResult {
    normalize(&RawRecognitionPayload::from_value(value), roster)
}

fn first<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| map.get(*k)).find(|v| !v.is_null())
}

fn list<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> &'a [Value] {
    match first(map, keys) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn texts(map: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    keys.iter().filter_map(|k| map.get(*k)).filter_map(text).collect()
}

fn coerce_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
}

fn coerce_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .or_else(|| n.as_f64().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v.min(u32::MAX as f64) as u32)),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn coerce_bbox(value: &Value) -> Option<BoundingBox> {
    match value {
        Value::Array(items) if items.len() >= 4 => {
            let c: Vec<f32> = items[..4].iter().filter_map(coerce_f32).collect();
            (c.len() == 4 && c.iter().all(|v| v.is_finite()))
                .then(|| BoundingBox::from_corners(c[0], c[1], c[2], c[3]))
        }
        Value::Object(map) => {
            let get = |keys: &[&str]| first(map, keys).and_then(coerce_f32).filter(|v| v.is_finite());
            Some(BoundingBox {
                x: get(&["x", "left"])?,
                y: get(&["y", "top"])?,
                width: get(&["width", "w"])?,
                height: get(&["height", "h"])?,
            })
        }
        _ => None,
    }
}

/// Clamp to [0, 1]; NaN becomes 0.
fn unit_interval(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn eq_ic(a: &str, b: &str) -> bool {
    !a.is_empty() && a.to_lowercase() == b.to_lowercase()
}

/// Case-insensitive containment in either direction, ignoring short strings.
fn contains_ic(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    (b.chars().count() >= MIN_SUBSTRING_LEN && a.contains(&b))
        || (a.chars().count() >= MIN_SUBSTRING_LEN && b.contains(&a))
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
