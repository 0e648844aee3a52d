use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Lesson {
    pub id: Uuid,
    pub module_id: Uuid,
    pub title: String,
    #[sqlx(rename = "lesson_order")]
    pub order: i32, // 1-based, dense within module_id
    pub created_at: DateTime<Utc>,
}

/// Assessment configuration as owned by the surrounding CRUD layer.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Assessment {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub max_attempts: Option<i32>,
    pub passing_score: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Closed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Closed => "closed",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(AttemptStatus::InProgress),
            "closed" => Ok(AttemptStatus::Closed),
            other => Err(StoreError::Decode {
                field: "attempt status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssessmentAttempt {
    pub id: Uuid,
    pub learner_id: String,
    pub assessment_id: Uuid,
    pub enrollment_id: Uuid,
    pub course_id: Uuid,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub is_current: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    // grading criteria frozen when the attempt was opened
    pub passing_score_snapshot: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Lesson,
    Assessment,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Lesson => "lesson",
            ItemKind::Assessment => "assessment",
        }
    }
}

impl FromStr for ItemKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lesson" => Ok(ItemKind::Lesson),
            "assessment" => Ok(ItemKind::Assessment),
            other => Err(StoreError::Decode {
                field: "item type",
                value: other.to_string(),
            }),
        }
    }
}

/// Reference to a progress-tracked item, either a lesson or an assessment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub id: Uuid,
}

impl ItemRef {
    pub fn lesson(id: Uuid) -> Self {
        Self {
            kind: ItemKind::Lesson,
            id,
        }
    }

    pub fn assessment(id: Uuid) -> Self {
        Self {
            kind: ItemKind::Assessment,
            id,
        }
    }

    /// Single lookup key, e.g. `lesson:6f1c...`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
    Passed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Passed => "passed",
            ProgressStatus::Failed => "failed",
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Passed)
    }
}

impl FromStr for ProgressStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(ProgressStatus::NotStarted),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "completed" => Ok(ProgressStatus::Completed),
            "passed" => Ok(ProgressStatus::Passed),
            "failed" => Ok(ProgressStatus::Failed),
            other => Err(StoreError::Decode {
                field: "progress status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ItemProgress {
    pub id: Uuid,
    pub learner_id: String,
    pub course_id: Uuid,
    pub enrollment_id: Uuid,
    pub item: ItemRef,
    pub status: ProgressStatus,
    pub is_completed_flag: bool,
    pub score: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InsertLessonReq {
    pub title: Option<String>,
    pub position: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MoveLessonReq {
    pub module_id: Uuid,
    pub position: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartAttemptReq {
    pub learner_id: String,
    pub enrollment_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepairAttemptsReq {
    pub learner_id: String,
}
