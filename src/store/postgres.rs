use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{AttemptPatch, NewAttempt, NewLesson, ScopeKey, Store, StoreTx};
use crate::db::Db;
use crate::error::StoreError;
use crate::models::{Assessment, AssessmentAttempt, ItemProgress, ItemRef, Lesson};

const LESSON_COLS: &str = "id, module_id, title, lesson_order, created_at";
const ATTEMPT_COLS: &str = "id, learner_id, assessment_id, enrollment_id, course_id, attempt_number, \
     status, is_current, started_at, finished_at, passing_score_snapshot";

/// PostgreSQL-backed store. Each unit of work is one transaction; scope locks
/// are transaction-scoped advisory locks.
#[derive(Clone)]
pub struct PgStore {
    pool: Db,
}

impl PgStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    learner_id: String,
    assessment_id: Uuid,
    enrollment_id: Uuid,
    course_id: Uuid,
    attempt_number: i32,
    status: String,
    is_current: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    passing_score_snapshot: i32,
}

impl TryFrom<AttemptRow> for AssessmentAttempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> Result<Self, Self::Error> {
        Ok(AssessmentAttempt {
            id: r.id,
            learner_id: r.learner_id,
            assessment_id: r.assessment_id,
            enrollment_id: r.enrollment_id,
            course_id: r.course_id,
            attempt_number: r.attempt_number,
            status: r.status.parse()?,
            is_current: r.is_current,
            started_at: r.started_at,
            finished_at: r.finished_at,
            passing_score_snapshot: r.passing_score_snapshot,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    id: Uuid,
    learner_id: String,
    course_id: Uuid,
    enrollment_id: Uuid,
    item_type: String,
    item_id: Uuid,
    status: String,
    is_completed: bool,
    score: Option<f64>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProgressRow> for ItemProgress {
    type Error = StoreError;

    fn try_from(r: ProgressRow) -> Result<Self, Self::Error> {
        Ok(ItemProgress {
            id: r.id,
            learner_id: r.learner_id,
            course_id: r.course_id,
            enrollment_id: r.enrollment_id,
            item: ItemRef {
                kind: r.item_type.parse()?,
                id: r.item_id,
            },
            status: r.status.parse()?,
            is_completed_flag: r.is_completed,
            score: r.score,
            updated_at: r.updated_at,
        })
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_scope(&mut self, scope: &ScopeKey) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(scope.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_lesson(&mut self, id: Uuid) -> Result<Option<Lesson>, StoreError> {
        let sql = format!("SELECT {LESSON_COLS} FROM lessons WHERE id = $1");
        Ok(sqlx::query_as::<_, Lesson>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    async fn lessons_in_module(&mut self, module_id: Uuid) -> Result<Vec<Lesson>, StoreError> {
        let sql = format!(
            "SELECT {LESSON_COLS} FROM lessons WHERE module_id = $1 \
             ORDER BY lesson_order, created_at, id"
        );
        Ok(sqlx::query_as::<_, Lesson>(&sql)
            .bind(module_id)
            .fetch_all(&mut *self.tx)
            .await?)
    }

    async fn create_lesson(&mut self, lesson: NewLesson) -> Result<Lesson, StoreError> {
        let sql = format!(
            "INSERT INTO lessons (id, module_id, title, lesson_order) VALUES ($1,$2,$3,$4) \
             RETURNING {LESSON_COLS}"
        );
        Ok(sqlx::query_as::<_, Lesson>(&sql)
            .bind(Uuid::new_v4())
            .bind(lesson.module_id)
            .bind(lesson.title)
            .bind(lesson.order)
            .fetch_one(&mut *self.tx)
            .await?)
    }

    async fn set_lesson_order(&mut self, id: Uuid, order: i32) -> Result<Lesson, StoreError> {
        let sql = format!("UPDATE lessons SET lesson_order = $2 WHERE id = $1 RETURNING {LESSON_COLS}");
        sqlx::query_as::<_, Lesson>(&sql)
            .bind(id)
            .bind(order)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::RowMissing(id))
    }

    async fn delete_lesson(&mut self, id: Uuid) -> Result<(), StoreError> {
        let res = sqlx::query("DELETE FROM lessons WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::RowMissing(id));
        }
        Ok(())
    }

    async fn get_assessment(&mut self, id: Uuid) -> Result<Option<Assessment>, StoreError> {
        Ok(sqlx::query_as::<_, Assessment>(
            "SELECT id, course_id, title, max_attempts, passing_score FROM assessments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn attempts_for(
        &mut self,
        learner_id: &str,
        assessment_id: Uuid,
    ) -> Result<Vec<AssessmentAttempt>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLS} FROM assessment_attempts \
             WHERE learner_id = $1 AND assessment_id = $2 ORDER BY attempt_number"
        );
        sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(learner_id)
            .bind(assessment_id)
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(AssessmentAttempt::try_from)
            .collect()
    }

    async fn get_attempt(&mut self, id: Uuid) -> Result<Option<AssessmentAttempt>, StoreError> {
        let sql = format!("SELECT {ATTEMPT_COLS} FROM assessment_attempts WHERE id = $1");
        sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(AssessmentAttempt::try_from)
            .transpose()
    }

    async fn create_attempt(&mut self, attempt: NewAttempt) -> Result<AssessmentAttempt, StoreError> {
        let sql = format!(
            "INSERT INTO assessment_attempts \
             (id, learner_id, assessment_id, enrollment_id, course_id, attempt_number, \
              status, is_current, started_at, passing_score_snapshot) \
             VALUES ($1,$2,$3,$4,$5,$6,'in_progress',TRUE,now(),$7) \
             RETURNING {ATTEMPT_COLS}"
        );
        sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(attempt.learner_id)
            .bind(attempt.assessment_id)
            .bind(attempt.enrollment_id)
            .bind(attempt.course_id)
            .bind(attempt.attempt_number)
            .bind(attempt.passing_score_snapshot)
            .fetch_one(&mut *self.tx)
            .await?
            .try_into()
    }

    async fn update_attempt(
        &mut self,
        id: Uuid,
        patch: AttemptPatch,
    ) -> Result<AssessmentAttempt, StoreError> {
        let sql = format!(
            "UPDATE assessment_attempts SET \
               status = COALESCE($2, status), \
               is_current = COALESCE($3, is_current), \
               finished_at = COALESCE($4, finished_at) \
             WHERE id = $1 RETURNING {ATTEMPT_COLS}"
        );
        sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.is_current)
            .bind(patch.finished_at)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::RowMissing(id))?
            .try_into()
    }

    async fn item_progress(
        &mut self,
        learner_id: &str,
        course_id: Uuid,
    ) -> Result<Vec<ItemProgress>, StoreError> {
        sqlx::query_as::<_, ProgressRow>(
            "SELECT id, learner_id, course_id, enrollment_id, item_type, item_id, status, \
                    is_completed, score, updated_at \
             FROM item_progress WHERE learner_id = $1 AND course_id = $2 \
             ORDER BY updated_at, id",
        )
        .bind(learner_id)
        .bind(course_id)
        .fetch_all(&mut *self.tx)
        .await?
        .into_iter()
        .map(ItemProgress::try_from)
        .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
