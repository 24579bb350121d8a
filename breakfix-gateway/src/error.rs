//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use breakfix_core::StoreError;
use breakfix_executor::{HypervisorError, SessionError};
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the session layer.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The request body or path is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The exercise catalog could not be loaded.
    #[error("exercise catalog: {0}")]
    Catalog(String),
}

impl GatewayError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Session(e) => session_status(e),
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn session_status(e: &SessionError) -> StatusCode {
    match e {
        SessionError::Transition(_)
        | SessionError::NotPassed(_)
        | SessionError::NoExercises
        | SessionError::Store(StoreError::DuplicateAssignment(_)) => StatusCode::CONFLICT,
        SessionError::NoVm(_)
        | SessionError::ExerciseNotFound(_)
        | SessionError::Store(StoreError::ExerciseNotFound(_)) => StatusCode::NOT_FOUND,
        SessionError::Hypervisor(HypervisorError::Authentication(_)) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(json!({"success": false, "error": self.to_string()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use breakfix_core::{CoreError, ExerciseId, StudentId};
    use breakfix_executor::QueueError;

    use super::*;

    #[test]
    fn rejections_map_to_conflict() {
        let not_passed = GatewayError::from(SessionError::NotPassed(ExerciseId::new(3)));
        assert_eq!(not_passed.status(), StatusCode::CONFLICT);

        let not_started = GatewayError::from(SessionError::Transition(CoreError::NotStarted));
        assert_eq!(not_started.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn missing_vm_maps_to_not_found() {
        let err = GatewayError::from(SessionError::NoVm(StudentId::new("ana")));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn hypervisor_auth_failure_maps_to_bad_gateway() {
        let err = GatewayError::from(SessionError::Hypervisor(HypervisorError::Authentication(
            "invalid token".to_owned(),
        )));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn queue_abort_maps_to_500() {
        let err = GatewayError::from(SessionError::Queue(QueueError::UnitAborted));
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "queue failures must map to 500"
        );
    }

    #[test]
    fn display_passes_session_message_through() {
        let err = GatewayError::from(SessionError::NotPassed(ExerciseId::new(3)));
        assert!(err.to_string().contains("current exercise not passed"));
    }
}
