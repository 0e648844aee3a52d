//! Order maintenance for lessons within a module.
//!
//! Positions in a module are always exactly `1..=N`. Each operation runs in a
//! single unit of work under the module's scope lock, re-reads the module, and
//! renumbers it first if it finds gaps or duplicates.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ProgressionError, StoreError};
use crate::models::Lesson;
use crate::store::{NewLesson, ScopeKey, Store, StoreTx};

#[derive(Clone)]
pub struct OrderMaintainer {
    store: Arc<dyn Store>,
}

fn inconsistent(module_id: Uuid) -> impl FnOnce(StoreError) -> ProgressionError {
    move |source| ProgressionError::OrderingInconsistent { module_id, source }
}

/// Read a module's lessons and rewrite any position that is not its rank.
async fn load_normalized(
    tx: &mut dyn StoreTx,
    module_id: Uuid,
) -> Result<Vec<Lesson>, ProgressionError> {
    let mut lessons = tx.lessons_in_module(module_id).await?;
    let mut healed = 0usize;
    for (idx, lesson) in lessons.iter_mut().enumerate() {
        let rank = idx as i32 + 1;
        if lesson.order != rank {
            *lesson = tx
                .set_lesson_order(lesson.id, rank)
                .await
                .map_err(inconsistent(module_id))?;
            healed += 1;
        }
    }
    if healed > 0 {
        warn!(%module_id, healed, "renumbered lessons with gaps or duplicate positions");
    }
    Ok(lessons)
}

impl OrderMaintainer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn list(&self, module_id: Uuid) -> Result<Vec<Lesson>, ProgressionError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.lessons_in_module(module_id).await?)
    }

    /// Add a lesson at `requested` (clamped to `1..=N+1`), or append it.
    #[instrument(skip(self, title), err(level = "debug"))]
    pub async fn insert(
        &self,
        module_id: Uuid,
        title: &str,
        requested: Option<i32>,
    ) -> Result<Lesson, ProgressionError> {
        let mut tx = self.store.begin().await?;
        tx.lock_scope(&ScopeKey::Module(module_id)).await?;
        let siblings = load_normalized(&mut *tx, module_id).await?;

        let count = siblings.len() as i32;
        let order = requested.map_or(count + 1, |p| p.clamp(1, count + 1));

        // highest first so no two siblings share a position mid-batch
        let mut shifted = 0usize;
        for sibling in siblings.iter().rev().filter(|l| l.order >= order) {
            tx.set_lesson_order(sibling.id, sibling.order + 1)
                .await
                .map_err(inconsistent(module_id))?;
            shifted += 1;
        }

        let created = tx
            .create_lesson(NewLesson {
                module_id,
                title: title.to_string(),
                order,
            })
            .await;
        let lesson = match created {
            Ok(lesson) => lesson,
            Err(e) if shifted > 0 => return Err(inconsistent(module_id)(e)),
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        info!(%module_id, lesson_id = %lesson.id, order, shifted, "inserted lesson");
        Ok(lesson)
    }

    /// Move a lesson to `position` (clamped to `1..=N`) within `module_id`.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn move_lesson(
        &self,
        lesson_id: Uuid,
        module_id: Uuid,
        position: i32,
    ) -> Result<Lesson, ProgressionError> {
        let mut tx = self.store.begin().await?;
        let lesson = tx
            .get_lesson(lesson_id)
            .await?
            .ok_or_else(|| ProgressionError::not_found("lesson", lesson_id))?;
        if lesson.module_id != module_id {
            return Err(ProgressionError::InvalidScope {
                lesson_id,
                actual: lesson.module_id,
                requested: module_id,
            });
        }

        tx.lock_scope(&ScopeKey::Module(module_id)).await?;
        let siblings = load_normalized(&mut *tx, module_id).await?;
        let current = siblings
            .iter()
            .find(|l| l.id == lesson_id)
            .cloned()
            .ok_or_else(|| ProgressionError::not_found("lesson", lesson_id))?;

        let old = current.order;
        let new = position.clamp(1, siblings.len() as i32);
        if new == old {
            // still commit: the read may have healed the module
            tx.commit().await?;
            debug!(%lesson_id, position = old, "lesson already in place");
            return Ok(current);
        }

        if new > old {
            for sibling in siblings.iter().filter(|l| l.order > old && l.order <= new) {
                tx.set_lesson_order(sibling.id, sibling.order - 1)
                    .await
                    .map_err(inconsistent(module_id))?;
            }
        } else {
            for sibling in siblings.iter().rev().filter(|l| l.order >= new && l.order < old) {
                tx.set_lesson_order(sibling.id, sibling.order + 1)
                    .await
                    .map_err(inconsistent(module_id))?;
            }
        }
        let moved = tx
            .set_lesson_order(lesson_id, new)
            .await
            .map_err(inconsistent(module_id))?;
        tx.commit().await?;

        info!(%module_id, %lesson_id, from = old, to = new, "moved lesson");
        Ok(moved)
    }

    /// Delete a lesson and close the gap it leaves.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn remove(&self, lesson_id: Uuid) -> Result<(), ProgressionError> {
        let mut tx = self.store.begin().await?;
        let lesson = tx
            .get_lesson(lesson_id)
            .await?
            .ok_or_else(|| ProgressionError::not_found("lesson", lesson_id))?;
        let module_id = lesson.module_id;

        tx.lock_scope(&ScopeKey::Module(module_id)).await?;
        let siblings = load_normalized(&mut *tx, module_id).await?;
        let removed = siblings
            .iter()
            .find(|l| l.id == lesson_id)
            .map(|l| l.order)
            .ok_or_else(|| ProgressionError::not_found("lesson", lesson_id))?;

        tx.delete_lesson(lesson_id).await?;
        for sibling in siblings.iter().filter(|l| l.order > removed) {
            tx.set_lesson_order(sibling.id, sibling.order - 1)
                .await
                .map_err(inconsistent(module_id))?;
        }
        tx.commit().await?;

        info!(%module_id, %lesson_id, order = removed, "removed lesson");
        Ok(())
    }

    /// Renumber a module to `1..=N`, keeping the current relative order.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn repair(&self, module_id: Uuid) -> Result<Vec<Lesson>, ProgressionError> {
        let mut tx = self.store.begin().await?;
        tx.lock_scope(&ScopeKey::Module(module_id)).await?;
        let lessons = load_normalized(&mut *tx, module_id).await?;
        tx.commit().await?;
        Ok(lessons)
    }
}
