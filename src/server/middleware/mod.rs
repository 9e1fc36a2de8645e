//! Request middleware: context assignment, dual auth, error rendering.

pub mod api_key;
pub mod context;
pub mod error;
pub mod jwt_auth;

pub use api_key::api_key_auth;
pub use context::{request_context, RequestMeta};
pub use error::{ApiError, ApiResult};
pub use jwt_auth::jwt_auth;
