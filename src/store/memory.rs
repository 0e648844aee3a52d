//! In-process store with all-or-nothing units of work.
//!
//! A unit of work holds the store mutex for its whole lifetime and edits a
//! private copy of the tables; `commit` publishes the copy. Used by the test
//! suites, which can also inject write failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{AttemptPatch, NewAttempt, NewLesson, ScopeKey, Store, StoreTx};
use crate::error::StoreError;
use crate::models::{Assessment, AssessmentAttempt, AttemptStatus, ItemProgress, Lesson};

#[derive(Debug, Clone, Default)]
struct Tables {
    lessons: Vec<Lesson>,
    assessments: HashMap<Uuid, Assessment>,
    attempts: Vec<AssessmentAttempt>,
    progress: Vec<ItemProgress>,
}

#[derive(Debug)]
struct Faults {
    writes: AtomicUsize,
    // writes numbered in [fail_from, fail_until) fail
    fail_from: AtomicUsize,
    fail_until: AtomicUsize,
}

impl Faults {
    fn arm(&self, from: usize, until: usize) {
        self.fail_until.store(until, Ordering::SeqCst);
        self.fail_from.store(from, Ordering::SeqCst);
    }

    fn record_write(&self) -> Result<(), StoreError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_from.load(Ordering::SeqCst) && n < self.fail_until.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected failure on write #{}", n + 1)));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            faults: Arc::new(Faults {
                writes: AtomicUsize::new(0),
                fail_from: AtomicUsize::new(usize::MAX),
                fail_until: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Let the next `n` writes succeed and fail every write after them.
    pub fn fail_writes_after(&self, n: usize) {
        let done = self.faults.writes.load(Ordering::SeqCst);
        self.faults.arm(done.saturating_add(n), usize::MAX);
    }

    /// Fail only the next `n` writes.
    pub fn fail_next_writes(&self, n: usize) {
        let done = self.faults.writes.load(Ordering::SeqCst);
        self.faults.arm(done, done.saturating_add(n));
    }

    pub fn clear_faults(&self) {
        self.faults.arm(usize::MAX, usize::MAX);
    }

    /// Writes attempted through units of work so far, committed or not.
    pub fn write_count(&self) -> usize {
        self.faults.writes.load(Ordering::SeqCst)
    }

    pub async fn put_assessment(&self, assessment: Assessment) {
        let mut tables = self.tables.lock().await;
        tables.assessments.insert(assessment.id, assessment);
    }

    pub async fn put_lesson(&self, lesson: Lesson) {
        self.tables.lock().await.lessons.push(lesson);
    }

    pub async fn put_attempt(&self, attempt: AssessmentAttempt) {
        self.tables.lock().await.attempts.push(attempt);
    }

    pub async fn put_progress(&self, row: ItemProgress) {
        self.tables.lock().await.progress.push(row);
    }

    /// Committed lessons of a module, sorted by order.
    pub async fn lessons(&self, module_id: Uuid) -> Vec<Lesson> {
        module_lessons(&*self.tables.lock().await, module_id)
    }

    /// Committed attempts of a pair, sorted by attempt number.
    pub async fn attempts(&self, learner_id: &str, assessment_id: Uuid) -> Vec<AssessmentAttempt> {
        pair_attempts(&*self.tables.lock().await, learner_id, assessment_id)
    }
}

fn module_lessons(tables: &Tables, module_id: Uuid) -> Vec<Lesson> {
    let mut out: Vec<Lesson> = tables
        .lessons
        .iter()
        .filter(|l| l.module_id == module_id)
        .cloned()
        .collect();
    out.sort_by(|a, b| (a.order, a.created_at, a.id).cmp(&(b.order, b.created_at, b.id)));
    out
}

fn pair_attempts(tables: &Tables, learner_id: &str, assessment_id: Uuid) -> Vec<AssessmentAttempt> {
    let mut out: Vec<AssessmentAttempt> = tables
        .attempts
        .iter()
        .filter(|a| a.learner_id == learner_id && a.assessment_id == assessment_id)
        .cloned()
        .collect();
    out.sort_by_key(|a| a.attempt_number);
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let work = (*guard).clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            faults: self.faults.clone(),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_scope(&mut self, _scope: &ScopeKey) -> Result<(), StoreError> {
        // the store mutex is already held for the whole unit of work
        Ok(())
    }

    async fn get_lesson(&mut self, id: Uuid) -> Result<Option<Lesson>, StoreError> {
        Ok(self.work.lessons.iter().find(|l| l.id == id).cloned())
    }

    async fn lessons_in_module(&mut self, module_id: Uuid) -> Result<Vec<Lesson>, StoreError> {
        Ok(module_lessons(&self.work, module_id))
    }

    async fn create_lesson(&mut self, lesson: NewLesson) -> Result<Lesson, StoreError> {
        self.faults.record_write()?;
        let rec = Lesson {
            id: Uuid::new_v4(),
            module_id: lesson.module_id,
            title: lesson.title,
            order: lesson.order,
            created_at: Utc::now(),
        };
        self.work.lessons.push(rec.clone());
        Ok(rec)
    }

    async fn set_lesson_order(&mut self, id: Uuid, order: i32) -> Result<Lesson, StoreError> {
        self.faults.record_write()?;
        let lesson = self
            .work
            .lessons
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StoreError::RowMissing(id))?;
        lesson.order = order;
        Ok(lesson.clone())
    }

    async fn delete_lesson(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.faults.record_write()?;
        let before = self.work.lessons.len();
        self.work.lessons.retain(|l| l.id != id);
        if self.work.lessons.len() == before {
            return Err(StoreError::RowMissing(id));
        }
        Ok(())
    }

    async fn get_assessment(&mut self, id: Uuid) -> Result<Option<Assessment>, StoreError> {
        Ok(self.work.assessments.get(&id).cloned())
    }

    async fn attempts_for(
        &mut self,
        learner_id: &str,
        assessment_id: Uuid,
    ) -> Result<Vec<AssessmentAttempt>, StoreError> {
        Ok(pair_attempts(&self.work, learner_id, assessment_id))
    }

    async fn get_attempt(&mut self, id: Uuid) -> Result<Option<AssessmentAttempt>, StoreError> {
        Ok(self.work.attempts.iter().find(|a| a.id == id).cloned())
    }

    async fn create_attempt(&mut self, attempt: NewAttempt) -> Result<AssessmentAttempt, StoreError> {
        self.faults.record_write()?;
        let rec = AssessmentAttempt {
            id: Uuid::new_v4(),
            learner_id: attempt.learner_id,
            assessment_id: attempt.assessment_id,
            enrollment_id: attempt.enrollment_id,
            course_id: attempt.course_id,
            attempt_number: attempt.attempt_number,
            status: AttemptStatus::InProgress,
            is_current: true,
            started_at: Utc::now(),
            finished_at: None,
            passing_score_snapshot: attempt.passing_score_snapshot,
        };
        self.work.attempts.push(rec.clone());
        Ok(rec)
    }

    async fn update_attempt(
        &mut self,
        id: Uuid,
        patch: AttemptPatch,
    ) -> Result<AssessmentAttempt, StoreError> {
        self.faults.record_write()?;
        let attempt = self
            .work
            .attempts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::RowMissing(id))?;
        if let Some(status) = patch.status {
            attempt.status = status;
        }
        if let Some(is_current) = patch.is_current {
            attempt.is_current = is_current;
        }
        if let Some(at) = patch.finished_at {
            attempt.finished_at = Some(at);
        }
        Ok(attempt.clone())
    }

    async fn item_progress(
        &mut self,
        learner_id: &str,
        course_id: Uuid,
    ) -> Result<Vec<ItemProgress>, StoreError> {
        let mut rows: Vec<ItemProgress> = self
            .work
            .progress
            .iter()
            .filter(|p| p.learner_id == learner_id && p.course_id == course_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.updated_at, p.id));
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx { mut guard, work, .. } = *self;
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_lesson(module_id: Uuid, order: i32) -> NewLesson {
        NewLesson {
            module_id,
            title: format!("Lesson {}", order),
            order,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let module_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.create_lesson(new_lesson(module_id, 1)).await.unwrap();
        drop(tx);
        assert!(store.lessons(module_id).await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.create_lesson(new_lesson(module_id, 1)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.lessons(module_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_count_from_now() {
        let store = MemoryStore::new();
        let module_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.create_lesson(new_lesson(module_id, 1)).await.unwrap();
        store.fail_writes_after(1);
        tx.create_lesson(new_lesson(module_id, 2)).await.unwrap();
        let err = tx.create_lesson(new_lesson(module_id, 3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.write_count(), 3);

        store.clear_faults();
        tx.create_lesson(new_lesson(module_id, 3)).await.unwrap();

        store.fail_next_writes(1);
        assert!(tx.create_lesson(new_lesson(module_id, 4)).await.is_err());
        tx.create_lesson(new_lesson(module_id, 4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_of_missing_row_reports_row_missing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = Uuid::new_v4();
        let err = tx.set_lesson_order(id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::RowMissing(missing) if missing == id));
    }
}
