//! Data-access interface used by the progression components.
//!
//! Every public operation opens one unit of work with [`Store::begin`], locks
//! the scope it is about to read, and either commits or drops the unit of
//! work. Dropping without [`StoreTx::commit`] discards all writes.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Assessment, AssessmentAttempt, AttemptStatus, ItemProgress, Lesson};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// The unit a mutation must hold exclusively while it reads and rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKey {
    Module(Uuid),
    AttemptPair { learner_id: String, assessment_id: Uuid },
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Module(id) => write!(f, "module:{}", id),
            ScopeKey::AttemptPair {
                learner_id,
                assessment_id,
            } => write!(f, "attempts:{}:{}", learner_id, assessment_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewLesson {
    pub module_id: Uuid,
    pub title: String,
    pub order: i32,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub learner_id: String,
    pub assessment_id: Uuid,
    pub enrollment_id: Uuid,
    pub course_id: Uuid,
    pub attempt_number: i32,
    pub passing_score_snapshot: i32,
}

/// Partial update of an attempt; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AttemptPatch {
    pub status: Option<AttemptStatus>,
    pub is_current: Option<bool>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AttemptPatch {
    pub fn demote() -> Self {
        Self {
            is_current: Some(false),
            ..Self::default()
        }
    }

    pub fn promote() -> Self {
        Self {
            is_current: Some(true),
            ..Self::default()
        }
    }

    pub fn close(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(AttemptStatus::Closed),
            finished_at: Some(at),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

#[async_trait]
pub trait StoreTx: Send {
    /// Block other units of work on the same scope until this one ends.
    async fn lock_scope(&mut self, scope: &ScopeKey) -> Result<(), StoreError>;

    async fn get_lesson(&mut self, id: Uuid) -> Result<Option<Lesson>, StoreError>;

    /// Lessons of a module sorted by `(order, created_at, id)`.
    async fn lessons_in_module(&mut self, module_id: Uuid) -> Result<Vec<Lesson>, StoreError>;

    async fn create_lesson(&mut self, lesson: NewLesson) -> Result<Lesson, StoreError>;

    async fn set_lesson_order(&mut self, id: Uuid, order: i32) -> Result<Lesson, StoreError>;

    async fn delete_lesson(&mut self, id: Uuid) -> Result<(), StoreError>;

    async fn get_assessment(&mut self, id: Uuid) -> Result<Option<Assessment>, StoreError>;

    /// Attempts of one (learner, assessment) pair sorted by attempt number.
    async fn attempts_for(
        &mut self,
        learner_id: &str,
        assessment_id: Uuid,
    ) -> Result<Vec<AssessmentAttempt>, StoreError>;

    async fn get_attempt(&mut self, id: Uuid) -> Result<Option<AssessmentAttempt>, StoreError>;

    async fn create_attempt(&mut self, attempt: NewAttempt) -> Result<AssessmentAttempt, StoreError>;

    async fn update_attempt(
        &mut self,
        id: Uuid,
        patch: AttemptPatch,
    ) -> Result<AssessmentAttempt, StoreError>;

    async fn item_progress(
        &mut self,
        learner_id: &str,
        course_id: Uuid,
    ) -> Result<Vec<ItemProgress>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_traits_are_object_safe() {
        fn _takes_store(_: Box<dyn Store>) {}
        fn _takes_tx(_: Box<dyn StoreTx>) {}
    }

    #[test]
    fn test_scope_keys_do_not_collide() {
        let id = Uuid::new_v4();
        let module = ScopeKey::Module(id).to_string();
        let pair = ScopeKey::AttemptPair {
            learner_id: "learner-1".into(),
            assessment_id: id,
        }
        .to_string();
        assert_eq!(module, format!("module:{}", id));
        assert_eq!(pair, format!("attempts:learner-1:{}", id));
    }
}
