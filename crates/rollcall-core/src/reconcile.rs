//! Session reconciliation over persisted attendance rows.
//!
//! A session is the set of rows of one course sharing one exact timestamp.
//! Everything here is a pure function of the rows handed in: reads are
//! repeatable and an empty row set is a valid steady state (all rates 0).

use crate::attendance::percentage;
use crate::types::{AttendanceRecord, Roster, Student};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One submission: every row of a course stamped with the same instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub course_id: String,
    pub timestamp: DateTime<Utc>,
    pub records: Vec<AttendanceRecord>,
}

impl Session {
    pub fn has_row_for(&self, student_id: &str) -> bool {
        self.records.iter().any(|r| r.student_id == student_id)
    }

    pub fn is_present(&self, student_id: &str) -> bool {
        self.records.iter().any(|r| r.student_id == student_id && r.status)
    }

    pub fn present_count(&self) -> usize {
        self.records.iter().filter(|r| r.status).count()
    }
}

/// Group rows by exact timestamp, oldest session first.
pub fn group_sessions(records: &[AttendanceRecord]) -> Vec<Session> {
    let mut by_timestamp: BTreeMap<(DateTime<Utc>, &str), Vec<AttendanceRecord>> = BTreeMap::new();
    for record in records {
        by_timestamp
            .entry((record.timestamp, record.course_id.as_str()))
            .or_default()
            .push(record.clone());
    }
    by_timestamp
        .into_iter()
        .map(|((timestamp, course_id), records)| Session {
            course_id: course_id.to_string(),
            timestamp,
            records,
        })
        .collect()
}

/// Number of distinct sessions, never the number of rows.
pub fn session_count(records: &[AttendanceRecord]) -> u32 {
    let distinct: BTreeSet<_> = records.iter().map(|r| (r.timestamp, r.course_id.as_str())).collect();
    u32::try_from(distinct.len()).unwrap_or(u32::MAX)
}

/// Attendance of one student in one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStats {
    pub student_id: String,
    pub course_id: String,
    pub attended: u32,
    pub total_sessions: u32,
    pub rate: f64,
}

/// Stats over every session of the course: a session without a row for
/// the student counts as missed.
pub fn student_stats(student_id: &str, course_id: &str, sessions: &[Session]) -> StudentStats {
    let total_sessions = u32::try_from(sessions.len()).unwrap_or(u32::MAX);
    let attended =
        u32::try_from(sessions.iter().filter(|s| s.is_present(student_id)).count()).unwrap_or(u32::MAX);
    StudentStats {
        student_id: student_id.to_string(),
        course_id: course_id.to_string(),
        attended,
        total_sessions,
        rate: percentage(attended, total_sessions),
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RangeError {
    #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("range start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// Inclusive range of UTC calendar days. Either end may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Start at the first instant of `start`, end at 23:59:59.999 of `end`.
    pub fn from_dates(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Self, RangeError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(RangeError::Inverted { start, end });
            }
        }
        Ok(Self {
            start: start.map(|d| d.and_time(NaiveTime::MIN).and_utc()),
            end: end.map(end_of_day),
        })
    }

    /// Parse `YYYY-MM-DD` bounds; an empty string leaves that end open.
    pub fn parse(start: &str, end: &str) -> Result<Self, RangeError> {
        Self::from_dates(parse_day(start)?, parse_day(end)?)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}

fn parse_day(value: &str) -> Result<Option<NaiveDate>, RangeError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| RangeError::InvalidDate(value.to_string()))
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    let last_ms = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    day.and_time(last_ms).and_utc()
}

/// One roster member's line in a course report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub student_id: String,
    pub name: String,
    pub email: String,
    pub attended: u32,
    pub total: u32,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseReport {
    pub course_id: String,
    pub range: DateRange,
    pub total_sessions: u32,
    pub rows: Vec<ReportRow>,
}

/// Per-student attendance for every enrolled student, sorted by name.
///
/// Only sessions inside `range` count. A student with no row in any of
/// those sessions is reported 0/0; everyone else is measured against every
/// session in range.
pub fn course_report(roster: &Roster, records: &[AttendanceRecord], range: DateRange) -> CourseReport {
    let in_range: Vec<AttendanceRecord> = records
        .iter()
        .filter(|r| r.course_id == roster.course_id && range.contains(r.timestamp))
        .cloned()
        .collect();
    let sessions = group_sessions(&in_range);
    let total_sessions = u32::try_from(sessions.len()).unwrap_or(u32::MAX);

    let mut rows: Vec<ReportRow> = roster
        .students
        .iter()
        .map(|student| {
            let seen = sessions.iter().any(|s| s.has_row_for(&student.id));
            let (attended, total) = if seen {
                let stats = student_stats(&student.id, &roster.course_id, &sessions);
                (stats.attended, stats.total_sessions)
            } else {
                (0, 0)
            };
            ReportRow {
                student_id: student.id.clone(),
                name: student.name.clone(),
                email: student.email.clone(),
                attended,
                total,
                rate: percentage(attended, total),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.student_id.cmp(&b.student_id)));

    CourseReport {
        course_id: roster.course_id.clone(),
        range,
        total_sessions,
        rows,
    }
}

/// Something in the stored rows that needs a human to look at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DataAnomaly {
    /// More than one session on one calendar day, e.g. a retried submit.
    #[serde(rename_all = "camelCase")]
    NearDuplicateSessions {
        date: NaiveDate,
        sessions: Vec<DateTime<Utc>>,
        min_gap_secs: i64,
    },
    /// A session missing rows for some enrolled students.
    #[serde(rename_all = "camelCase")]
    IncompleteSession {
        timestamp: DateTime<Utc>,
        expected: u32,
        recorded: u32,
        missing: Vec<String>,
    },
    /// A student with more than one row in one session.
    #[serde(rename_all = "camelCase")]
    DuplicateRows {
        timestamp: DateTime<Utc>,
        student_id: String,
        rows: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub course_id: String,
    pub sessions: u32,
    pub anomalies: Vec<DataAnomaly>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Report anomalies in a course's rows. Never modifies anything: sessions
/// that look like duplicates are listed, not merged.
pub fn audit(roster: &Roster, records: &[AttendanceRecord]) -> AuditReport {
    let sessions = group_sessions(records);
    let mut anomalies = Vec::new();

    let mut by_day: BTreeMap<NaiveDate, Vec<DateTime<Utc>>> = BTreeMap::new();
    for session in &sessions {
        by_day.entry(session.timestamp.date_naive()).or_default().push(session.timestamp);
    }
    for (date, stamps) in by_day {
        if stamps.len() < 2 {
            continue;
        }
        let min_gap_secs = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).num_seconds())
            .min()
            .unwrap_or(0);
        anomalies.push(DataAnomaly::NearDuplicateSessions {
            date,
            sessions: stamps,
            min_gap_secs,
        });
    }

    for session in &sessions {
        let mut per_student: BTreeMap<&str, u32> = BTreeMap::new();
        for record in &session.records {
            *per_student.entry(record.student_id.as_str()).or_default() += 1;
        }

        let missing: Vec<String> = roster
            .students
            .iter()
            .filter(|s| !per_student.contains_key(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();
        if !missing.is_empty() {
            anomalies.push(DataAnomaly::IncompleteSession {
                timestamp: session.timestamp,
                expected: u32::try_from(roster.len()).unwrap_or(u32::MAX),
                recorded: u32::try_from(per_student.len()).unwrap_or(u32::MAX),
                missing,
            });
        }

        for (student_id, rows) in per_student.into_iter().filter(|(_, n)| *n > 1) {
            anomalies.push(DataAnomaly::DuplicateRows {
                timestamp: session.timestamp,
                student_id: student_id.to_string(),
                rows,
            });
        }
    }

    if !anomalies.is_empty() {
        tracing::warn!(
            course_id = %roster.course_id,
            anomalies = anomalies.len(),
            "attendance audit found anomalies"
        );
    }

    AuditReport {
        course_id: roster.course_id.clone(),
        sessions: u32::try_from(sessions.len()).unwrap_or(u32::MAX),
        anomalies,
    }
}

/// A student's mark in one session, with display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub student_id: String,
    pub name: String,
    pub email: String,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySession {
    pub timestamp: DateTime<Utc>,
    pub present: u32,
    pub total: u32,
    pub entries: Vec<HistoryEntry>,
}

/// Sessions for display, newest first. Rows for students no longer on the
/// roster keep their id and an empty name.
pub fn history(roster: &Roster, records: &[AttendanceRecord]) -> Vec<HistorySession> {
    let mut out: Vec<HistorySession> = group_sessions(records)
        .into_iter()
        .map(|session| {
            let mut entries: Vec<HistoryEntry> = session
                .records
                .iter()
                .map(|r| {
                    let student = roster.get(&r.student_id);
                    HistoryEntry {
                        student_id: r.student_id.clone(),
                        name: student.map(|s| s.name.clone()).unwrap_or_default(),
                        email: student.map(|s| s.email.clone()).unwrap_or_default(),
                        present: r.status,
                    }
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.student_id.cmp(&b.student_id)));
            HistorySession {
                timestamp: session.timestamp,
                present: u32::try_from(session.present_count()).unwrap_or(u32::MAX),
                total: u32::try_from(session.records.len()).unwrap_or(u32::MAX),
                entries,
            }
        })
        .collect();
    out.reverse();
    out
}

/// Cross-course summary for one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentOverview {
    pub student_id: String,
    pub total_courses: u32,
    pub total_present: u32,
    pub total_sessions: u32,
    pub attendance_percentage: f64,
    pub courses: Vec<StudentStats>,
}

/// Combine per-course stats. The overall percentage weighs every session of
/// every enrolled course equally.
pub fn student_overview(student: &Student, courses: Vec<StudentStats>) -> StudentOverview {
    let total_present = courses.iter().map(|c| c.attended).sum();
    let total_sessions = courses.iter().map(|c| c.total_sessions).sum();
    StudentOverview {
        student_id: student.id.clone(),
        total_courses: u32::try_from(courses.len()).unwrap_or(u32::MAX),
        total_present,
        total_sessions,
        attendance_percentage: percentage(total_present, total_sessions),
        courses,
    }
}
