// HTTP route handlers for the judge service

use axum::{
    extract::{FromRequest, Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    Form,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

/// Accepts both the current and the legacy field names, as JSON or as an
/// urlencoded form
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default, rename = "problemId", alias = "id")]
    pub problem_id: Option<String>,
    #[serde(default, rename = "sourceText", alias = "submission")]
    pub source_text: Option<String>,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn is_form(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
        .unwrap_or(false)
}

/// Decode the submit body; undecodable bodies get the usual JSON error shape
async fn read_submission(request: Request) -> Result<SubmitRequest, Response> {
    if is_form(&request) {
        Form::<SubmitRequest>::from_request(request, &())
            .await
            .map(|Form(payload)| payload)
            .map_err(|rejection| error_response(rejection.status(), &rejection.body_text()))
    } else {
        Json::<SubmitRequest>::from_request(request, &())
            .await
            .map(|Json(payload)| payload)
            .map_err(|rejection| error_response(rejection.status(), &rejection.body_text()))
    }
}

/// POST /submit - Accept a submission and start judging it
///
/// Answers as soon as the submission has an id; judging continues in the
/// background and the caller is sent to the status resource.
pub async fn submit(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let payload = match read_submission(request).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let problem_id = payload.problem_id.unwrap_or_default();
    let source_text = payload.source_text.unwrap_or_default();

    let accepted = match state.judge.accept(&problem_id, &source_text).await {
        Ok(accepted) => accepted,
        Err(e) => {
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return error_response(status, &e.client_message());
        }
    };

    let submission_id = accepted.id();
    let judge = state.judge.clone();
    tokio::spawn(async move {
        judge.run(accepted).await;
    });

    info!(submission_id = %submission_id, problem_id = %problem_id.trim(), "Pipeline started");
    Redirect::to(&format!("/submissions/{}", submission_id)).into_response()
}

/// GET /submissions/{id} - Current snapshot of a submission
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Response {
    let id = match Uuid::parse_str(&submission_id) {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid submission ID format"),
    };

    match state.judge.store.load(&id).await {
        Ok(Some(submission)) => (StatusCode::OK, Json(submission)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "No submission exists for the provided ID."),
        Err(e) => {
            error!(submission_id = %id, error = %e, "Failed to load submission");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query submission status")
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_text() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
