//! SQLite persistence for courses, rosters and attendance rows.
//!
//! Driven through `tokio_rusqlite`, which owns the connection on its own
//! thread. The schema is versioned with `PRAGMA user_version`; migrations
//! run in one transaction at open.

use crate::roster_file::RosterImport;
use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceRecord, Course, DateRange, Roster, Student, StudentStatus};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const CURRENT_SCHEMA_VERSION: i32 = 1;

const INSERT_ATTENDANCE: &str = "INSERT INTO attendance (id, course_id, student_id, timestamp_ms, status)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(course_id, student_id, timestamp_ms) DO NOTHING";

const SELECT_SESSION_STATUS: &str = "SELECT status FROM attendance
     WHERE course_id = ?1 AND student_id = ?2 AND timestamp_ms = ?3";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to create database directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("corrupt attendance row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
    #[error("course {course_id} already has a different session at {timestamp} for: {}", .students.join(", "))]
    SessionConflict {
        course_id: String,
        timestamp: DateTime<Utc>,
        students: Vec<String>,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Rows written by one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    /// Rows skipped because the same student already has a row at this timestamp.
    pub already_present: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub courses: usize,
    pub students: usize,
    pub enrollments: usize,
}

/// Narrows an attendance query beyond its course.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub student_id: Option<String>,
    pub range: DateRange,
}

impl AttendanceFilter {
    #[cfg(test)]
    pub fn student(student_id: impl Into<String>) -> Self {
        Self {
            student_id: Some(student_id.into()),
            ..Self::default()
        }
    }

    pub fn within(range: DateRange) -> Self {
        Self {
            range,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "journal mode set");
            Ok(())
        })
        .await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        let found = conn
            .call(|conn| {
                conn.pragma_update(None, "foreign_keys", "ON")?;
                Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, i32>(0))?)
            })
            .await?;

        if found > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        if found < CURRENT_SCHEMA_VERSION {
            conn.call(move |conn| Ok(run_migrations(conn, found)?)).await?;
            tracing::info!(from = found, to = CURRENT_SCHEMA_VERSION, "database schema migrated");
        }
        Ok(Self { conn })
    }

    /// Upsert every course, student and enrollment of `import` in one transaction.
    pub async fn import_roster(&self, import: RosterImport) -> Result<ImportSummary, StoreError> {
        let summary = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut summary = ImportSummary::default();
                for entry in &import.courses {
                    let course = entry.course();
                    tx.execute(
                        "INSERT INTO courses (id, code, name) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET code = excluded.code, name = excluded.name",
                        params![course.id, course.code, course.name],
                    )?;
                    summary.courses += 1;

                    for student in &entry.students {
                        tx.execute(
                            "INSERT INTO students (id, name, email, trained) VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(id) DO UPDATE SET
                                 name = excluded.name,
                                 email = excluded.email,
                                 trained = excluded.trained",
                            params![student.id, student.name, student.email, student.trained],
                        )?;
                        summary.students += 1;
                        summary.enrollments += tx.execute(
                            "INSERT OR IGNORE INTO enrollments (course_id, student_id) VALUES (?1, ?2)",
                            params![course.id, student.id],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(summary)
            })
            .await?;
        Ok(summary)
    }

    pub async fn course(&self, course_id: &str) -> Result<Option<Course>, StoreError> {
        let course_id = course_id.to_string();
        let course = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, code, name FROM courses WHERE id = ?1",
                        params![course_id],
                        row_to_course,
                    )
                    .optional()?)
            })
            .await?;
        Ok(course)
    }

    pub async fn courses(&self) -> Result<Vec<Course>, StoreError> {
        let courses = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, code, name FROM courses ORDER BY code, id")?;
                let rows = stmt.query_map([], row_to_course)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(courses)
    }

    /// Enrolled students of a course, ordered by name. Empty for an unknown course.
    pub async fn roster(&self, course_id: &str) -> Result<Roster, StoreError> {
        let id = course_id.to_string();
        let students = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.name, s.email, s.trained
                     FROM enrollments e JOIN students s ON s.id = e.student_id
                     WHERE e.course_id = ?1
                     ORDER BY s.name, s.id",
                )?;
                let rows = stmt.query_map(params![id], row_to_student)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(Roster::new(course_id, students))
    }

    pub async fn student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let student_id = student_id.to_string();
        let student = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, email, trained FROM students WHERE id = ?1",
                        params![student_id],
                        row_to_student,
                    )
                    .optional()?)
            })
            .await?;
        Ok(student)
    }

    /// Courses a student is enrolled in.
    pub async fn student_courses(&self, student_id: &str) -> Result<Vec<Course>, StoreError> {
        let student_id = student_id.to_string();
        let courses = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.code, c.name
                     FROM enrollments e JOIN courses c ON c.id = e.course_id
                     WHERE e.student_id = ?1
                     ORDER BY c.code, c.id",
                )?;
                let rows = stmt
                    .query_map(params![student_id], row_to_course)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(courses)
    }

    /// Record that the recognition service now holds embeddings for these students.
    pub async fn mark_trained(&self, student_ids: Vec<String>) -> Result<usize, StoreError> {
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                {
                    let mut stmt = tx.prepare("UPDATE students SET trained = 1 WHERE id = ?1")?;
                    for id in &student_ids {
                        updated += stmt.execute(params![id])?;
                    }
                }
                tx.commit()?;
                Ok(updated)
            })
            .await?;
        Ok(updated)
    }

    /// Write one session: a row per status, all stamped `timestamp`, in one
    /// transaction. Any failure rolls back every row of the batch. A row
    /// that already exists for the same student and timestamp is left as is
    /// when it agrees with the batch; if any disagrees, nothing is written
    /// and [`StoreError::SessionConflict`] names the students involved.
    pub async fn create_attendance_batch(
        &self,
        course_id: &str,
        timestamp: DateTime<Utc>,
        statuses: Vec<StudentStatus>,
    ) -> Result<BatchOutcome, StoreError> {
        let course = course_id.to_string();
        let timestamp_ms = timestamp.timestamp_millis();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut outcome = BatchOutcome::default();
                let mut conflicts = Vec::new();
                {
                    let mut insert = tx.prepare_cached(INSERT_ATTENDANCE)?;
                    let mut existing = tx.prepare_cached(SELECT_SESSION_STATUS)?;
                    for status in &statuses {
                        let written = insert.execute(params![
                            Uuid::new_v4().to_string(),
                            course,
                            status.student_id,
                            timestamp_ms,
                            status.present,
                        ])?;
                        if written > 0 {
                            outcome.inserted += written;
                            continue;
                        }
                        outcome.already_present += 1;
                        let stored: Option<bool> = existing
                            .query_row(params![course, status.student_id, timestamp_ms], |row| row.get(0))
                            .optional()?;
                        if stored.is_some_and(|present| present != status.present) {
                            conflicts.push(status.student_id.clone());
                        }
                    }
                }
                if !conflicts.is_empty() {
                    // dropping the transaction rolls back this batch's inserts
                    return Ok(Err(conflicts));
                }
                tx.commit()?;
                Ok(Ok(outcome))
            })
            .await?;
        outcome.map_err(|students| StoreError::SessionConflict {
            course_id: course_id.to_string(),
            timestamp,
            students,
        })
    }

    /// Raw rows of a course, oldest first.
    pub async fn query_attendance(
        &self,
        course_id: &str,
        filter: AttendanceFilter,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let course_id = course_id.to_string();
        let start_ms = filter.range.start.map(|t| t.timestamp_millis());
        let end_ms = filter.range.end.map(|t| t.timestamp_millis());
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, course_id, student_id, timestamp_ms, status
                     FROM attendance
                     WHERE course_id = ?1
                       AND (?2 IS NULL OR student_id = ?2)
                       AND (?3 IS NULL OR timestamp_ms >= ?3)
                       AND (?4 IS NULL OR timestamp_ms <= ?4)
                     ORDER BY timestamp_ms, student_id",
                )?;
                let rows = stmt
                    .query_map(params![course_id, filter.student_id, start_ms, end_ms], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, bool>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, course_id, student_id, ms, status)| {
                let timestamp = DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::CorruptRow {
                    id: id.clone(),
                    reason: format!("timestamp {ms} out of range"),
                })?;
                Ok(AttendanceRecord {
                    id,
                    student_id,
                    course_id,
                    timestamp,
                    status,
                })
            })
            .collect()
    }
}

fn run_migrations(conn: &mut rusqlite::Connection, mut version: i32) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        version += 1;
        apply_migration(&tx, version)?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> rusqlite::Result<()> {
    match version {
        1 => tx.execute_batch(include_str!("schemas/schema_v1.sql")),
        _ => Ok(()),
    }
}

fn row_to_course(row: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
    })
}

fn row_to_student(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        trained: row.get(3)?,
    })
}
