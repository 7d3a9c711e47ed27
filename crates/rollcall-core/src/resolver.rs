//! Identity resolution merge.
//!
//! Unresolved entries can be looked up by id in an external resolution
//! service. The lookup itself lives in the daemon; this module only decides
//! which ids to ask for and how answers fold back into a result.

use crate::normalizer::{match_entry, RawStudentEntry, RawStudentRecord, UNKNOWN_NAME};
use crate::types::{RecognitionResult, Roster, StudentIdentity, UnresolvedEntry};
use serde::{Deserialize, Serialize};

/// One answer from the resolution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Ids worth sending to the resolution service, in result order. Entries
/// identified only by a name, email or raw text are left out.
pub fn pending_ids(result: &RecognitionResult) -> Vec<String> {
    result
        .unresolved
        .iter()
        .filter(|u| u.from_id)
        .map(|u| u.identity.id.clone())
        .collect()
}

/// Fold resolution answers into `result`.
///
/// Each unresolved entry with an answer is enriched with the answer's name
/// and email and matched against the roster again. Hits move into
/// `recognized_students` (no duplicates); misses stay unresolved, enriched.
/// Merging the same answers twice changes nothing.
pub fn merge(mut result: RecognitionResult, roster: &Roster, resolved: &[ResolvedIdentity]) -> RecognitionResult {
    let pending = std::mem::take(&mut result.unresolved);
    let mut promoted = 0usize;

    for mut entry in pending {
        if let Some(answer) = resolved.iter().find(|r| entry.from_id && r.id == entry.identity.id) {
            enrich(&mut entry.identity, answer);
        }

        match match_entry(&as_record(&entry.identity), roster) {
            Some(m) => {
                result.push_recognized(StudentIdentity::from(m.student));
                promoted += 1;
            }
            None => {
                if !result.unresolved.iter().any(|u| u.identity.id == entry.identity.id) {
                    result.unresolved.push(entry);
                }
            }
        }
    }

    if promoted > 0 {
        tracing::debug!(
            course_id = %roster.course_id,
            promoted,
            still_unresolved = result.unresolved.len(),
            "merged resolved identities"
        );
    }
    result
}

fn enrich(identity: &mut StudentIdentity, answer: &ResolvedIdentity) {
    if let Some(name) = answer.name.as_deref().filter(|n| !n.trim().is_empty()) {
        identity.name = name.trim().to_string();
    }
    if let Some(email) = answer.email.as_deref().filter(|e| !e.trim().is_empty()) {
        identity.email = email.trim().to_string();
    }
}

fn as_record(identity: &StudentIdentity) -> RawStudentEntry {
    let non_empty = |s: &str| -> Vec<String> {
        if s.is_empty() {
            Vec::new()
        } else {
            vec![s.to_string()]
        }
    };
    RawStudentEntry::Record(RawStudentRecord {
        ids: non_empty(&identity.id),
        names: non_empty(&identity.name).into_iter().filter(|n| n != UNKNOWN_NAME).collect(),
        emails: non_empty(&identity.email),
        raw: identity.id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Student;

    fn roster() -> Roster {
        Roster::new(
            "IT-701",
            vec![
                Student {
                    id: "S1".into(),
                    name: "Asha Rao".into(),
                    email: "asha@uni.edu".into(),
                    trained: true,
                },
                Student {
                    id: "S2".into(),
                    name: "Bilal Khan".into(),
                    email: "bilal@uni.edu".into(),
                    trained: true,
                },
            ],
        )
    }

    fn unresolved(id: &str) -> UnresolvedEntry {
        UnresolvedEntry {
            identity: StudentIdentity {
                id: id.into(),
                name: "Unknown".into(),
                email: String::new(),
            },
            from_id: true,
        }
    }

    fn result_with(unresolved_ids: &[&str]) -> RecognitionResult {
        RecognitionResult {
            unresolved: unresolved_ids.iter().map(|id| unresolved(id)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_pending_ids() {
        let result = result_with(&["emb-7", "emb-9"]);
        assert_eq!(pending_ids(&result), vec!["emb-7", "emb-9"]);
    }

    #[test]
    fn test_pending_ids_skip_stand_in_ids() {
        let mut result = result_with(&["emb-7"]);
        result.unresolved.push(UnresolvedEntry {
            identity: StudentIdentity {
                id: "Unknown Face".into(),
                name: "Unknown Face".into(),
                email: String::new(),
            },
            from_id: false,
        });
        result.unresolved.push(UnresolvedEntry {
            identity: StudentIdentity {
                id: r#"{"confidence":0.4}"#.into(),
                name: "Unknown".into(),
                email: String::new(),
            },
            from_id: false,
        });
        assert_eq!(pending_ids(&result), vec!["emb-7"]);

        // an answer keyed by a stand-in id is not applied to it
        let answers = vec![ResolvedIdentity {
            id: "Unknown Face".into(),
            name: Some("Bilal Khan".into()),
            email: None,
        }];
        let merged = merge(result, &roster(), &answers);
        assert!(merged.recognized_students.is_empty());
        assert_eq!(merged.unresolved.len(), 3);
    }

    #[test]
    fn test_merge_promotes_by_email() {
        let answers = vec![ResolvedIdentity {
            id: "emb-7".into(),
            name: None,
            email: Some("BILAL@uni.edu".into()),
        }];
        let merged = merge(result_with(&["emb-7"]), &roster(), &answers);
        assert!(merged.is_recognized("S2"));
        assert!(merged.unresolved.is_empty());
    }

    #[test]
    fn test_merge_miss_stays_unresolved_but_enriched() {
        let answers = vec![ResolvedIdentity {
            id: "emb-9".into(),
            name: Some("Dana Visitor".into()),
            email: Some("dana@elsewhere.org".into()),
        }];
        let merged = merge(result_with(&["emb-9"]), &roster(), &answers);
        assert!(merged.recognized_students.is_empty());
        assert_eq!(merged.unresolved.len(), 1);
        assert_eq!(merged.unresolved[0].identity.name, "Dana Visitor");
        assert_eq!(merged.unresolved[0].identity.email, "dana@elsewhere.org");
        assert!(merged.unresolved[0].from_id);
    }

    #[test]
    fn test_merge_does_not_duplicate_recognized() {
        let mut result = result_with(&["emb-1"]);
        result.recognized_students.push(StudentIdentity::from(&roster().students[0]));
        let answers = vec![ResolvedIdentity {
            id: "emb-1".into(),
            name: Some("Asha Rao".into()),
            email: None,
        }];
        let merged = merge(result, &roster(), &answers);
        assert_eq!(merged.recognized_students.len(), 1);
        assert!(merged.unresolved.is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let answers = vec![
            ResolvedIdentity {
                id: "emb-7".into(),
                name: Some("Bilal Khan".into()),
                email: None,
            },
            ResolvedIdentity {
                id: "emb-9".into(),
                name: Some("Dana Visitor".into()),
                email: None,
            },
        ];
        let once = merge(result_with(&["emb-7", "emb-9"]), &roster(), &answers);
        let twice = merge(once.clone(), &roster(), &answers);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_without_answers_keeps_result() {
        let result = result_with(&["emb-7"]);
        let merged = merge(result.clone(), &roster(), &[]);
        assert_eq!(merged, result);
    }

    #[test]
    fn test_resolved_identity_optional_fields() {
        let r: ResolvedIdentity = serde_json::from_str(r#"{"id":"emb-1"}"#).unwrap();
        assert_eq!(r.name, None);
        assert_eq!(r.email, None);
    }
}
