//! TOML roster import, the daemon's stand-in for an external roster provider.
//!
//! ```toml
//! [[courses]]
//! id = "IT-701"
//! name = "Distributed Systems"
//!
//! [[courses.students]]
//! id = "S1"
//! name = "Asha Rao"
//! email = "asha@uni.edu"
//! trained = true
//! ```

use rollcall_core::{Course, Student};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterFileError {
    #[error("failed to read roster file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse roster file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("course {0:?} is listed more than once")]
    DuplicateCourse(String),
    #[error("course {course:?} lists student {student:?} more than once")]
    DuplicateStudent { course: String, student: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RosterImport {
    #[serde(default)]
    pub courses: Vec<CourseEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourseEntry {
    pub id: String,
    /// Display code; defaults to the id.
    #[serde(default)]
    pub code: Option<String>,
    pub name: String,
    #[serde(default)]
    pub students: Vec<Student>,
}

impl CourseEntry {
    pub fn course(&self) -> Course {
        Course {
            id: self.id.clone(),
            code: self.code.clone().unwrap_or_else(|| self.id.clone()),
            name: self.name.clone(),
        }
    }
}

impl RosterImport {
    pub fn load(path: &Path) -> Result<Self, RosterFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| RosterFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RosterFileError> {
        let import: Self = toml::from_str(text)?;
        import.validate()?;
        Ok(import)
    }

    fn validate(&self) -> Result<(), RosterFileError> {
        let mut courses = HashSet::new();
        for course in &self.courses {
            if !courses.insert(course.id.as_str()) {
                return Err(RosterFileError::DuplicateCourse(course.id.clone()));
            }
            let mut students = HashSet::new();
            for student in &course.students {
                if !students.insert(student.id.as_str()) {
                    return Err(RosterFileError::DuplicateStudent {
                        course: course.id.clone(),
                        student: student.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
