//! Error rendering in the caller's dialect

use axum::{
    http::header::RETRY_AFTER,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;
use uuid::Uuid;

use crate::dialect;
use crate::error::GatewayError;
use crate::types::Dialect;

/// A gateway error bound to the dialect it must be rendered in.
#[derive(Debug)]
pub struct ApiError {
    pub dialect: Dialect,
    pub err: GatewayError,
}

impl ApiError {
    pub fn new(dialect: Dialect, err: GatewayError) -> Self {
        Self { dialect, err }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.err.status();

        // Internal failures get logged with detail and surfaced with an
        // opaque id only.
        let err = if status.is_server_error() && self.err.kind() == "internal_error" {
            let incident = Uuid::new_v4().to_string();
            error!(incident = %incident, error = %self.err, "internal error");
            GatewayError::Internal(format!("internal error (incident {})", incident))
        } else {
            self.err
        };

        let body = dialect::error_body(self.dialect, &err);
        let mut response = (status, Json(body)).into_response();
        if let Some(wait) = err.retry_after() {
            if let Ok(value) = wait.as_secs().to_string().parse() {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
