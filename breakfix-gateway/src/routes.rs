//! Axum route handlers for the breakfix gateway API.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use breakfix_core::{ExerciseId, Store, StudentId};
use breakfix_executor::{
    ExerciseSummary, Hypervisor, ScriptRunner, SessionError, SessionOrchestrator,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::GatewayError;

// ── Shared state ─────────────────────────────────────────────────────────────

type Sessions<H, R, S> = Arc<SessionOrchestrator<H, R, S>>;

// ── Request / response types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub exercise_id: ExerciseId,
}

#[derive(Debug, Deserialize)]
pub struct HintQuery {
    #[serde(default)]
    pub step: usize,
}

/// Success envelope shared by every `/v1` endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router around a session orchestrator.
pub fn create_router<H, R, S>(sessions: Sessions<H, R, S>) -> Router
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    Router::new()
        .route("/v1/exercises", get(list_exercises::<H, R, S>))
        .route("/v1/students/{id}/start", post(start::<H, R, S>))
        .route("/v1/students/{id}/verify", post(verify::<H, R, S>))
        .route("/v1/students/{id}/next", post(next::<H, R, S>))
        .route("/v1/students/{id}/hint", get(hint::<H, R, S>))
        .route("/v1/students/{id}/connection", get(connection::<H, R, S>))
        .route("/v1/students/{id}/status", get(status::<H, R, S>))
        .route("/health", get(health))
        .with_state(sessions)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn student_id(raw: String) -> Result<StudentId, GatewayError> {
    if raw.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("empty student id".to_owned()));
    }
    Ok(StudentId::new(raw))
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `GET /v1/exercises`: enabled exercises in progression order, without
/// their scripts.
///
/// # Errors
/// Returns [`GatewayError::Session`] if the store fails.
pub async fn list_exercises<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let exercises = sessions
        .store()
        .exercises(true)
        .await
        .map_err(SessionError::from)?;
    let summaries: Vec<ExerciseSummary> = exercises.iter().map(ExerciseSummary::from).collect();
    Ok(ok(summaries))
}

/// `POST /v1/students/{id}/start`: provision if needed and inject the first
/// fault.
///
/// # Errors
/// Returns [`GatewayError::Session`] if provisioning fails or no exercise is
/// enabled.
pub async fn start<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let student = student_id(id)?;
    let report = sessions.start(&student).await?;
    Ok(ok(report))
}

/// `POST /v1/students/{id}/verify`: run the check for the current exercise.
///
/// # Errors
/// Returns [`GatewayError::Session`] if the session is not started or the
/// exercise is not current.
pub async fn verify<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
    Path(id): Path<String>,
    Json(body): Json<VerifyBody>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let student = student_id(id)?;
    let report = sessions.verify(&student, body.exercise_id).await?;
    Ok(ok(report))
}

/// `POST /v1/students/{id}/next`: roll back and advance.
///
/// # Errors
/// Returns [`GatewayError::Session`] if the current exercise has not passed
/// or the rollback fails.
pub async fn next<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let student = student_id(id)?;
    let report = sessions.next(&student).await?;
    Ok(ok(report))
}

/// `GET /v1/students/{id}/hint?step=N`: hint `N` (default 0) for the current
/// exercise, or `done` past the last one.
///
/// # Errors
/// Returns [`GatewayError::Session`] if the session is not started.
pub async fn hint<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
    Path(id): Path<String>,
    Query(query): Query<HintQuery>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let student = student_id(id)?;
    let report = sessions.hint(&student, query.step).await?;
    Ok(ok(report))
}

/// `GET /v1/students/{id}/connection`: VM address and SSH details.
///
/// # Errors
/// Returns [`GatewayError::Session`] if the student has no VM.
pub async fn connection<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let student = student_id(id)?;
    let info = sessions.connection_info(&student).await?;
    Ok(ok(info))
}

/// `GET /v1/students/{id}/status`: session state and VM power state.
///
/// # Errors
/// Returns [`GatewayError::Session`] if the store fails.
pub async fn status<H, R, S>(
    State(sessions): State<Sessions<H, R, S>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    let student = student_id(id)?;
    let status = sessions.status(&student).await?;
    Ok(ok(status))
}
