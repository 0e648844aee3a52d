//! Attempt lifecycle for repeatable graded assessments.
//!
//! Per (learner, assessment) pair: attempt numbers run `1, 2, 3, ...` without
//! gaps, at most one attempt is `in_progress`, and exactly the highest-numbered
//! attempt is current.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ProgressionError;
use crate::models::{AssessmentAttempt, AttemptStatus};
use crate::store::{AttemptPatch, NewAttempt, ScopeKey, Store, StoreTx};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartedAttempt {
    pub attempt_id: Uuid,
    pub attempt_number: i32,
    pub resumed: bool,
}

#[derive(Clone)]
pub struct AttemptManager {
    store: Arc<dyn Store>,
}

fn pair_scope(learner_id: &str, assessment_id: Uuid) -> ScopeKey {
    ScopeKey::AttemptPair {
        learner_id: learner_id.to_string(),
        assessment_id,
    }
}

/// Make the highest-numbered attempt the only current one. `attempts` must be
/// sorted by attempt number.
async fn normalize_current(
    tx: &mut dyn StoreTx,
    mut attempts: Vec<AssessmentAttempt>,
) -> Result<Vec<AssessmentAttempt>, ProgressionError> {
    let Some(latest) = attempts.last().map(|a| a.attempt_number) else {
        return Ok(attempts);
    };

    let mut fixed = 0usize;
    // demotions first: storage allows one current row per pair at any instant
    for attempt in attempts.iter_mut() {
        if attempt.is_current && attempt.attempt_number != latest {
            *attempt = tx.update_attempt(attempt.id, AttemptPatch::demote()).await?;
            fixed += 1;
        }
    }
    if let Some(last) = attempts.last_mut() {
        if !last.is_current {
            *last = tx.update_attempt(last.id, AttemptPatch::promote()).await?;
            fixed += 1;
        }
    }

    if fixed > 0 {
        let first = &attempts[0];
        warn!(
            learner_id = %first.learner_id,
            assessment_id = %first.assessment_id,
            fixed,
            "corrected current-attempt flags"
        );
    }
    Ok(attempts)
}

impl AttemptManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resume the learner's open attempt, or open the next one if the
    /// assessment's cap allows it.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn start(
        &self,
        learner_id: &str,
        assessment_id: Uuid,
        enrollment_id: Uuid,
    ) -> Result<StartedAttempt, ProgressionError> {
        let mut tx = self.store.begin().await?;
        tx.lock_scope(&pair_scope(learner_id, assessment_id)).await?;

        let assessment = tx
            .get_assessment(assessment_id)
            .await?
            .ok_or_else(|| ProgressionError::not_found("assessment", assessment_id))?;
        let attempts = tx.attempts_for(learner_id, assessment_id).await?;
        let attempts = normalize_current(&mut *tx, attempts).await?;

        if let Some(open) = attempts
            .last()
            .filter(|a| a.status == AttemptStatus::InProgress)
        {
            let started = StartedAttempt {
                attempt_id: open.id,
                attempt_number: open.attempt_number,
                resumed: true,
            };
            tx.commit().await?;
            debug!(%learner_id, %assessment_id, attempt = started.attempt_number, "resuming open attempt");
            return Ok(started);
        }

        let next = attempts.last().map_or(1, |a| a.attempt_number + 1);
        if let Some(cap) = assessment.max_attempts {
            if next > cap {
                tx.commit().await?;
                info!(%learner_id, %assessment_id, cap, "attempt cap reached");
                return Err(ProgressionError::MaxAttemptsExceeded { assessment_id, cap });
            }
        }

        if let Some(previous) = attempts.last() {
            tx.update_attempt(previous.id, AttemptPatch::demote()).await?;
        }
        let created = tx
            .create_attempt(NewAttempt {
                learner_id: learner_id.to_string(),
                assessment_id,
                enrollment_id,
                course_id: assessment.course_id,
                attempt_number: next,
                passing_score_snapshot: assessment.passing_score,
            })
            .await?;
        tx.commit().await?;

        info!(%learner_id, %assessment_id, attempt_id = %created.id, attempt = next, "started attempt");
        Ok(StartedAttempt {
            attempt_id: created.id,
            attempt_number: created.attempt_number,
            resumed: false,
        })
    }

    /// Mark an attempt as submitted. Closing a closed attempt is a no-op.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn close(&self, attempt_id: Uuid) -> Result<AssessmentAttempt, ProgressionError> {
        let mut tx = self.store.begin().await?;
        let attempt = tx
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| ProgressionError::not_found("attempt", attempt_id))?;
        tx.lock_scope(&pair_scope(&attempt.learner_id, attempt.assessment_id))
            .await?;

        // re-read under the lock
        let attempt = tx
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| ProgressionError::not_found("attempt", attempt_id))?;
        if attempt.status == AttemptStatus::Closed {
            debug!(%attempt_id, "attempt already closed");
            return Ok(attempt);
        }

        let closed = tx
            .update_attempt(attempt_id, AttemptPatch::close(Utc::now()))
            .await?;
        tx.commit().await?;
        info!(%attempt_id, attempt = closed.attempt_number, "closed attempt");
        Ok(closed)
    }

    /// Correct current-attempt flags for a pair left inconsistent by an
    /// interrupted write.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn repair_current(
        &self,
        learner_id: &str,
        assessment_id: Uuid,
    ) -> Result<Vec<AssessmentAttempt>, ProgressionError> {
        let mut tx = self.store.begin().await?;
        tx.lock_scope(&pair_scope(learner_id, assessment_id)).await?;
        let attempts = tx.attempts_for(learner_id, assessment_id).await?;
        let attempts = normalize_current(&mut *tx, attempts).await?;
        tx.commit().await?;
        Ok(attempts)
    }
}
