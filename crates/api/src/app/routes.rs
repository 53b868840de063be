use std::sync::Arc;

use axum::{extract::Path, http::StatusCode, response::IntoResponse, Extension, Json};

use crate::dispatch::DispatchRouter;

use super::dto::{RpcRequest, RpcResponse};
use super::errors;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// `POST /rpc/{service}`
///
/// Handlers and collaborators are synchronous, so the call runs on the
/// blocking pool.
pub async fn rpc(
    Extension(dispatch): Extension<Arc<DispatchRouter>>,
    Path(service): Path<String>,
    Json(body): Json<RpcRequest>,
) -> axum::response::Response {
    let RpcRequest { method, params, auth } = body;
    let outcome = tokio::task::spawn_blocking(move || dispatch.call(&service, &method, params, auth)).await;

    match outcome {
        Ok(Ok(result)) => Json(RpcResponse { result }).into_response(),
        Ok(Err(err)) => errors::dispatch_error_to_response(err),
        Err(join_err) => {
            tracing::error!(error = %join_err, "rpc task aborted");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}
