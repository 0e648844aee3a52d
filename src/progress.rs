use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProgressionError;
use crate::models::{ItemKind, ItemProgress, ProgressStatus};
use crate::store::Store;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ItemProgressView {
    pub kind: ItemKind,
    pub status: ProgressStatus,
    pub is_completed_flag: bool,
    pub score: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CourseProgress {
    /// Keyed by `<kind>:<id>`.
    pub progress_by_item: BTreeMap<String, ItemProgressView>,
    pub completed_item_ids: Vec<String>,
}

/// Read-only completion view over lesson and assessment progress rows.
#[derive(Clone)]
pub struct ProgressAggregator {
    store: Arc<dyn Store>,
}

fn counts_as_completed(row: &ItemProgress) -> bool {
    // Bridge: the flag and the status come from separate writers and can
    // disagree, so either one is accepted. Drop the flag once it is derived
    // from status at write time.
    row.is_completed_flag || row.status.is_completion()
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn course_progress(
        &self,
        learner_id: &str,
        course_id: Uuid,
    ) -> Result<CourseProgress, ProgressionError> {
        // read-only; the unit of work is dropped without committing
        let mut tx = self.store.begin().await?;
        let rows = tx.item_progress(learner_id, course_id).await?;
        drop(tx);
        Ok(summarize(&rows))
    }
}

/// Fold rows into a course view. Rows arrive oldest first, so a later row for
/// the same item replaces an earlier one.
pub fn summarize(rows: &[ItemProgress]) -> CourseProgress {
    let mut progress_by_item = BTreeMap::new();
    let mut completed = BTreeMap::new();

    for row in rows {
        if row.is_completed_flag != row.status.is_completion() {
            debug!(
                item = %row.item,
                status = row.status.as_str(),
                flag = row.is_completed_flag,
                "completion flag disagrees with status"
            );
        }
        let key = row.item.key();
        completed.insert(key.clone(), counts_as_completed(row));
        progress_by_item.insert(
            key,
            ItemProgressView {
                kind: row.item.kind,
                status: row.status,
                is_completed_flag: row.is_completed_flag,
                score: row.score,
            },
        );
    }

    CourseProgress {
        progress_by_item,
        completed_item_ids: completed
            .into_iter()
            .filter_map(|(key, done)| done.then_some(key))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemRef;
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    const LEARNER: &str = "learner-9";

    fn row(
        course_id: Uuid,
        item: ItemRef,
        status: ProgressStatus,
        flag: bool,
        age_secs: i64,
    ) -> ItemProgress {
        ItemProgress {
            id: Uuid::new_v4(),
            learner_id: LEARNER.into(),
            course_id,
            enrollment_id: Uuid::nil(),
            item,
            status,
            is_completed_flag: flag,
            score: None,
            updated_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_completion_accepts_either_signal() {
        let store = MemoryStore::new();
        let course_id = Uuid::new_v4();
        let passed_no_flag = ItemRef::assessment(Uuid::new_v4());
        let flag_in_progress = ItemRef::lesson(Uuid::new_v4());
        let neither = ItemRef::lesson(Uuid::new_v4());
        let failed = ItemRef::assessment(Uuid::new_v4());

        store.put_progress(row(course_id, passed_no_flag, ProgressStatus::Passed, false, 4)).await;
        store.put_progress(row(course_id, flag_in_progress, ProgressStatus::InProgress, true, 3)).await;
        store.put_progress(row(course_id, neither, ProgressStatus::InProgress, false, 2)).await;
        store.put_progress(row(course_id, failed, ProgressStatus::Failed, false, 1)).await;

        let agg = ProgressAggregator::new(Arc::new(store));
        let view = agg.course_progress(LEARNER, course_id).await.unwrap();

        assert_eq!(view.progress_by_item.len(), 4);
        let mut expected = vec![passed_no_flag.key(), flag_in_progress.key()];
        expected.sort();
        assert_eq!(view.completed_item_ids, expected);
        assert_eq!(
            view.progress_by_item[&failed.key()].status,
            ProgressStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_view_is_scoped_and_repeatable() {
        let store = MemoryStore::new();
        let course_id = Uuid::new_v4();
        let lesson = ItemRef::lesson(Uuid::new_v4());
        store.put_progress(row(course_id, lesson, ProgressStatus::Completed, true, 1)).await;
        store.put_progress(row(Uuid::new_v4(), lesson, ProgressStatus::Completed, true, 1)).await;

        let agg = ProgressAggregator::new(Arc::new(store.clone()));
        let first = agg.course_progress(LEARNER, course_id).await.unwrap();
        let second = agg.course_progress(LEARNER, course_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.completed_item_ids, vec![lesson.key()]);
        assert_eq!(store.write_count(), 0);

        let other = agg.course_progress("someone-else", course_id).await.unwrap();
        assert_eq!(other, CourseProgress::default());
    }

    #[test]
    fn test_newest_row_wins_for_duplicate_item() {
        let course_id = Uuid::new_v4();
        let item = ItemRef::assessment(Uuid::new_v4());
        let rows = vec![
            row(course_id, item, ProgressStatus::Passed, true, 10),
            row(course_id, item, ProgressStatus::Failed, false, 1),
        ];
        let view = summarize(&rows);
        assert_eq!(view.progress_by_item[&item.key()].status, ProgressStatus::Failed);
        assert!(view.completed_item_ids.is_empty());
    }

    #[test]
    fn test_view_serializes_with_item_keys() {
        let course_id = Uuid::new_v4();
        let item = ItemRef::lesson(Uuid::new_v4());
        let mut r = row(course_id, item, ProgressStatus::Completed, true, 0);
        r.score = Some(92.5);
        let json = serde_json::to_value(summarize(&[r])).unwrap();
        let entry = &json["progress_by_item"][item.key()];
        assert_eq!(entry["kind"], "lesson");
        assert_eq!(entry["status"], "completed");
        assert_eq!(entry["score"], 92.5);
        assert_eq!(json["completed_item_ids"][0], item.key());
    }
}
