//! Per-course in-flight guard.
//!
//! At most one capture or submission runs per course. A capture can be
//! aborted until its frames are dispatched to the recognition service;
//! after that it runs to completion or timeout.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Capture,
    Submit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOutcome {
    Aborted,
    /// The recognition call was already dispatched.
    TooLate,
    /// Nothing abortable is running for the course.
    Idle,
}

#[derive(Debug, thiserror::Error)]
#[error("course {course_id} is busy with a {operation:?} in progress")]
pub struct Busy {
    pub course_id: String,
    pub operation: Operation,
}

struct Entry {
    operation: Operation,
    token: CancellationToken,
    dispatched: bool,
}

#[derive(Clone, Default)]
pub struct InFlight {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim `course_id` for `operation`, or report what already holds it.
    pub fn begin(&self, course_id: &str, operation: Operation) -> Result<InFlightGuard, Busy> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(course_id) {
            return Err(Busy {
                course_id: course_id.to_string(),
                operation: existing.operation,
            });
        }
        let token = CancellationToken::new();
        entries.insert(
            course_id.to_string(),
            Entry {
                operation,
                token: token.clone(),
                dispatched: false,
            },
        );
        Ok(InFlightGuard {
            owner: self.clone(),
            course_id: course_id.to_string(),
            token,
        })
    }

    /// Cancel a capture that has not been dispatched yet.
    pub fn abort(&self, course_id: &str) -> AbortOutcome {
        let entries = self.lock();
        match entries.get(course_id) {
            Some(entry) if entry.operation == Operation::Capture => {
                if entry.dispatched {
                    AbortOutcome::TooLate
                } else {
                    entry.token.cancel();
                    AbortOutcome::Aborted
                }
            }
            _ => AbortOutcome::Idle,
        }
    }

    /// Courses with work in progress.
    pub fn busy(&self) -> Vec<String> {
        let mut courses: Vec<String> = self.lock().keys().cloned().collect();
        courses.sort();
        courses
    }
}

/// Holds a course until dropped.
pub struct InFlightGuard {
    owner: InFlight,
    course_id: String,
    token: CancellationToken,
}

impl InFlightGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Close the abort window. Returns `false` if an abort got in first.
    pub fn mark_dispatched(&self) -> bool {
        let mut entries = self.owner.lock();
        if self.token.is_cancelled() {
            return false;
        }
        if let Some(entry) = entries.get_mut(&self.course_id) {
            entry.dispatched = true;
        }
        true
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.course_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_busy() {
        let inflight = InFlight::new();
        let _guard = inflight.begin("IT-701", Operation::Capture).unwrap();
        let busy = inflight.begin("IT-701", Operation::Submit).err().unwrap();
        assert_eq!(busy.operation, Operation::Capture);
        assert!(inflight.begin("CS-210", Operation::Capture).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let inflight = InFlight::new();
        drop(inflight.begin("IT-701", Operation::Capture).unwrap());
        assert!(inflight.busy().is_empty());
        assert!(inflight.begin("IT-701", Operation::Capture).is_ok());
    }

    #[test]
    fn test_abort_before_dispatch() {
        let inflight = InFlight::new();
        let guard = inflight.begin("IT-701", Operation::Capture).unwrap();
        assert_eq!(inflight.abort("IT-701"), AbortOutcome::Aborted);
        assert!(guard.token().is_cancelled());
        assert!(!guard.mark_dispatched());
    }

    #[test]
    fn test_abort_after_dispatch_is_too_late() {
        let inflight = InFlight::new();
        let guard = inflight.begin("IT-701", Operation::Capture).unwrap();
        assert!(guard.mark_dispatched());
        assert_eq!(inflight.abort("IT-701"), AbortOutcome::TooLate);
        assert!(!guard.token().is_cancelled());
    }

    #[test]
    fn test_abort_ignores_submissions_and_idle() {
        let inflight = InFlight::new();
        assert_eq!(inflight.abort("IT-701"), AbortOutcome::Idle);
        let _guard = inflight.begin("IT-701", Operation::Submit).unwrap();
        assert_eq!(inflight.abort("IT-701"), AbortOutcome::Idle);
    }
}
