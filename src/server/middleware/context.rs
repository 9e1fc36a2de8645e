//! Per-request context middleware
//!
//! Assigns the request id, adopts or assigns the trace id, and stamps
//! response headers (correlation ids plus the security baseline).

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// Correlation ids attached to every request before auth runs.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub trace_id: String,
}

const TRACE_HEADER: HeaderName = HeaderName::from_static("x-trace-id");
const REQUEST_HEADER: HeaderName = HeaderName::from_static("x-request-id");

pub async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    // Adopt the inbound trace id only when well-formed; garbage gets a
    // fresh id rather than polluting the trace store keyspace.
    let trace_id = req
        .headers()
        .get(&TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let meta = RequestMeta {
        request_id: request_id.clone(),
        trace_id: trace_id.clone(),
    };
    req.extensions_mut().insert(meta);

    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert(TRACE_HEADER, value);
    }
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );

    response
}
