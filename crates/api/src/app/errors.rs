use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crate::dispatch::DispatchError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        DispatchError::Authentication => json_error(StatusCode::UNAUTHORIZED, "authentication_error", message),
        DispatchError::MethodNotFound(_) => json_error(StatusCode::NOT_FOUND, "method_not_found", message),
        DispatchError::AccessDenied => json_error(StatusCode::FORBIDDEN, "access_denied", message),
        DispatchError::JobNotFound(_) => json_error(StatusCode::NOT_FOUND, "job_not_found", message),
        DispatchError::JobExecution(failure) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({
                "error": "job_execution_error",
                "message": failure.message(),
                "diagnostic": failure.diagnostic(),
            })),
        )
            .into_response(),
        DispatchError::InvalidParams(_) => json_error(StatusCode::BAD_REQUEST, "invalid_params", message),
        DispatchError::Service(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "service_error", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
