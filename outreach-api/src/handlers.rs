use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use outreach_approval::{Approval, BulkApprovalResult, ErrorBody, SweepReport};
use outreach_core::{Message, QueueError, ValidationError};
use outreach_dispatch::DispatchReport;
use serde::{Deserialize, Serialize};
use tracing;
use uuid::Uuid;

use crate::auth::AuthenticatedTrainer;
use crate::server::ApiState;

/// Failure of an API call, rendered as `{error, message, limit?}`.
pub enum ApiError {
    Queue(QueueError),
    Internal(anyhow::Error),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Queue(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

pub fn status_for(err: &QueueError) -> StatusCode {
    match err {
        QueueError::Validation(_) => StatusCode::BAD_REQUEST,
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::Transition(_) | QueueError::Conflict(_) => StatusCode::CONFLICT,
        QueueError::OptOut => StatusCode::UNPROCESSABLE_ENTITY,
        QueueError::FrequencyCap { .. } | QueueError::RateLimited { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        QueueError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Queue(err) => {
                if let QueueError::Storage(inner) = &err {
                    tracing::error!("Storage error: {}", inner);
                }
                (status_for(&err), Json(ErrorBody::from(&err))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!("Job failed: {}", err);
                let body = ErrorBody {
                    error: "internal_error".to_string(),
                    message: "internal error".to_string(),
                    limit: None,
                };
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "outreach-api"
    }))
}

/// Optional scope for a manual job run.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    #[serde(default)]
    pub trainer_id: Option<Uuid>,
}

/// An empty body runs for every trainer. Anything else must parse, so a
/// mistyped scope never widens into an unscoped run.
fn job_scope(body: &[u8]) -> Result<Option<Uuid>, QueueError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let request: JobRequest = serde_json::from_slice(body)
        .map_err(|e| ValidationError::InvalidJobRequest(e.to_string()))?;
    Ok(request.trainer_id)
}

pub async fn run_dispatch(
    Extension(state): Extension<ApiState>,
    body: Bytes,
) -> Result<Json<DispatchReport>, ApiError> {
    let trainer_id = job_scope(&body)?;
    let report = state.dispatcher.run_once(state.now(), trainer_id).await?;
    Ok(Json(report))
}

pub async fn run_auto_approval(
    Extension(state): Extension<ApiState>,
    body: Bytes,
) -> Result<Json<SweepReport>, ApiError> {
    let trainer_id = job_scope(&body)?;
    let report = state.scheduler.run_once(state.now(), trainer_id).await?;
    Ok(Json(report))
}

pub async fn approve_message(
    Extension(state): Extension<ApiState>,
    Extension(trainer): Extension<AuthenticatedTrainer>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Approval>, ApiError> {
    let approval = state
        .queue
        .approve(trainer.trainer_id, message_id, state.now())
        .await?;
    Ok(Json(approval))
}

#[derive(Debug, Deserialize)]
pub struct BulkApproveRequest {
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BulkApproveResponse {
    pub results: Vec<BulkApprovalResult>,
}

pub async fn bulk_approve(
    Extension(state): Extension<ApiState>,
    Extension(trainer): Extension<AuthenticatedTrainer>,
    Json(request): Json<BulkApproveRequest>,
) -> Result<Json<BulkApproveResponse>, ApiError> {
    let results = state
        .queue
        .bulk_approve(trainer.trainer_id, &request.message_ids, state.now())
        .await?;
    Ok(Json(BulkApproveResponse { results }))
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub content: String,
}

pub async fn edit_message(
    Extension(state): Extension<ApiState>,
    Extension(trainer): Extension<AuthenticatedTrainer>,
    Path(message_id): Path<Uuid>,
    Json(request): Json<EditRequest>,
) -> Result<Json<Message>, ApiError> {
    let message = state
        .queue
        .edit(trainer.trainer_id, message_id, &request.content)
        .await?;
    Ok(Json(message))
}

pub async fn cancel_auto_approval(
    Extension(state): Extension<ApiState>,
    Extension(trainer): Extension<AuthenticatedTrainer>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Message>, ApiError> {
    let message = state
        .queue
        .cancel_auto_approval(trainer.trainer_id, message_id)
        .await?;
    Ok(Json(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::{CapLimit, MessageStatus, TransitionError};

    #[test]
    fn empty_job_body_is_unscoped() {
        assert_eq!(job_scope(b"").unwrap(), None);
        assert_eq!(job_scope(b"  \n").unwrap(), None);
        assert_eq!(job_scope(b"{}").unwrap(), None);

        let trainer = Uuid::new_v4();
        let body = format!(r#"{{"trainer_id":"{}"}}"#, trainer);
        assert_eq!(job_scope(body.as_bytes()).unwrap(), Some(trainer));
    }

    #[test]
    fn malformed_job_scope_is_a_validation_error() {
        for body in [
            &br#"{"trainer_id":"not-a-uuid"}"#[..],
            &b"trainer_id=abc"[..],
            &br#"{"trainerId":"4f1c2b8e-8d9a-4a57-9c1e-2f1d5b7a9e30"}"#[..],
        ] {
            let err = job_scope(body).unwrap_err();
            assert_eq!(err.code(), "validation_error");
            assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn queue_errors_map_to_statuses() {
        let cases = [
            (QueueError::NotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                QueueError::Validation(ValidationError::EmptyContent),
                StatusCode::BAD_REQUEST,
            ),
            (
                QueueError::Transition(TransitionError {
                    from: MessageStatus::Queued,
                    to: MessageStatus::Queued,
                }),
                StatusCode::CONFLICT,
            ),
            (QueueError::Conflict(Uuid::nil()), StatusCode::CONFLICT),
            (QueueError::OptOut, StatusCode::UNPROCESSABLE_ENTITY),
            (
                QueueError::FrequencyCap {
                    limit: CapLimit::Weekly,
                    sent: 5,
                    cap: 5,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                QueueError::RateLimited {
                    approved: 100,
                    cap: 100,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                QueueError::Storage(anyhow::anyhow!("pool timed out")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{}", err.code());
        }
    }

    #[test]
    fn storage_details_are_not_exposed() {
        let err = QueueError::Storage(anyhow::anyhow!("password authentication failed"));
        let body = ErrorBody::from(&err);
        assert_eq!(body.error, "internal_error");
        assert!(!body.message.contains("password"));
    }
}
