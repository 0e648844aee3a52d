use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use uuid::Uuid;

use crate::attempts::{AttemptManager, StartedAttempt};
use crate::error::ProgressionError;
use crate::models::*;
use crate::ordering::OrderMaintainer;
use crate::progress::{CourseProgress, ProgressAggregator};
use crate::retry::RetryPolicy;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub ordering: OrderMaintainer,
    pub attempts: AttemptManager,
    pub progress: ProgressAggregator,
    pub policy: RetryPolicy,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self {
            ordering: OrderMaintainer::new(store.clone()),
            attempts: AttemptManager::new(store.clone()),
            progress: ProgressAggregator::new(store),
            policy,
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub fn router(state: AppState) -> Router {
    Router::new()
        // lesson ordering
        .route(
            "/api/modules/:module_id/lessons",
            get(list_lessons).post(insert_lesson),
        )
        .route("/api/modules/:module_id/lessons/repair", post(repair_lessons))
        .route("/api/lessons/:lesson_id/move", post(move_lesson))
        .route("/api/lessons/:lesson_id", axum::routing::delete(remove_lesson))
        // attempts
        .route("/api/assessments/:assessment_id/attempts", post(start_attempt))
        .route(
            "/api/assessments/:assessment_id/attempts/repair",
            post(repair_attempts),
        )
        .route("/api/attempts/:attempt_id/close", post(close_attempt))
        // progress
        .route(
            "/api/courses/:course_id/progress/:learner_id",
            get(course_progress),
        )
        .with_state(state)
}

async fn list_lessons(
    State(st): State<AppState>,
    Path(module_id): Path<Uuid>,
) -> ApiResult<Vec<Lesson>> {
    let ordering = &st.ordering;
    st.policy
        .run("list", move || ordering.list(module_id))
        .await
        .map(Json)
        .map_err(api_err)
}

async fn insert_lesson(
    State(st): State<AppState>,
    Path(module_id): Path<Uuid>,
    body: Option<Json<InsertLessonReq>>,
) -> Result<(StatusCode, Json<Lesson>), (StatusCode, String)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let ordering = &st.ordering;
    let title = req.title.as_deref().unwrap_or("Untitled Lesson");
    let position = req.position;
    let lesson = st
        .policy
        .run("insert", move || ordering.insert(module_id, title, position))
        .await
        .map_err(api_err)?;
    Ok((StatusCode::CREATED, Json(lesson)))
}

async fn move_lesson(
    State(st): State<AppState>,
    Path(lesson_id): Path<Uuid>,
    Json(req): Json<MoveLessonReq>,
) -> ApiResult<Lesson> {
    let ordering = &st.ordering;
    let MoveLessonReq { module_id, position } = req;
    st.policy
        .run("move", move || ordering.move_lesson(lesson_id, module_id, position))
        .await
        .map(Json)
        .map_err(api_err)
}

async fn remove_lesson(
    State(st): State<AppState>,
    Path(lesson_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let ordering = &st.ordering;
    st.policy
        .run("remove", move || ordering.remove(lesson_id))
        .await
        .map_err(api_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn repair_lessons(
    State(st): State<AppState>,
    Path(module_id): Path<Uuid>,
) -> ApiResult<Vec<Lesson>> {
    let ordering = &st.ordering;
    st.policy
        .run("repair", move || ordering.repair(module_id))
        .await
        .map(Json)
        .map_err(api_err)
}

async fn start_attempt(
    State(st): State<AppState>,
    Path(assessment_id): Path<Uuid>,
    Json(req): Json<StartAttemptReq>,
) -> ApiResult<StartedAttempt> {
    let attempts = &st.attempts;
    let learner_id = req.learner_id.as_str();
    let enrollment_id = req.enrollment_id;
    st.policy
        .run("start", move || {
            attempts.start(learner_id, assessment_id, enrollment_id)
        })
        .await
        .map(Json)
        .map_err(api_err)
}

async fn repair_attempts(
    State(st): State<AppState>,
    Path(assessment_id): Path<Uuid>,
    Json(req): Json<RepairAttemptsReq>,
) -> ApiResult<Vec<AssessmentAttempt>> {
    let attempts = &st.attempts;
    let learner_id = req.learner_id.as_str();
    st.policy
        .run("repair_current", move || {
            attempts.repair_current(learner_id, assessment_id)
        })
        .await
        .map(Json)
        .map_err(api_err)
}

async fn close_attempt(
    State(st): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> ApiResult<AssessmentAttempt> {
    let attempts = &st.attempts;
    st.policy
        .run("close", move || attempts.close(attempt_id))
        .await
        .map(Json)
        .map_err(api_err)
}

async fn course_progress(
    State(st): State<AppState>,
    Path((course_id, learner_id)): Path<(Uuid, String)>,
) -> ApiResult<CourseProgress> {
    let progress = &st.progress;
    let learner_id = learner_id.as_str();
    st.policy
        .run("course_progress", move || {
            progress.course_progress(learner_id, course_id)
        })
        .await
        .map(Json)
        .map_err(api_err)
}

// --- helpers ---
fn api_err(e: ProgressionError) -> (StatusCode, String) {
    let status = match &e {
        ProgressionError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProgressionError::InvalidScope { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ProgressionError::MaxAttemptsExceeded { .. } => StatusCode::CONFLICT,
        ProgressionError::OrderingInconsistent { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProgressionError::Store(s) if s.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        ProgressionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "request failed");
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return (status, format!("{}; try again", e));
    }
    (status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (ProgressionError::not_found("lesson", id), StatusCode::NOT_FOUND),
            (
                ProgressionError::InvalidScope {
                    lesson_id: id,
                    actual: id,
                    requested: id,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ProgressionError::MaxAttemptsExceeded {
                    assessment_id: id,
                    cap: 1,
                },
                StatusCode::CONFLICT,
            ),
            (
                ProgressionError::OrderingInconsistent {
                    module_id: id,
                    source: StoreError::RowMissing(id),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StoreError::Unavailable("down".into()).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StoreError::Decode {
                    field: "status",
                    value: "x".into(),
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(api_err(err).0, expected);
        }
    }

    #[test]
    fn test_retryable_errors_ask_caller_to_try_again() {
        let (_, msg) = api_err(StoreError::Unavailable("down".into()).into());
        assert!(msg.ends_with("try again"));
    }
}
