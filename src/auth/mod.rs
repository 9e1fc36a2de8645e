//! Authentication
//!
//! Two independent schemes share one output: a [`Principal`] attached to
//! the request context. API keys guard the model-serving surface; JWTs
//! guard the admin and management surface.

pub mod api_key;
pub mod jwt;
pub mod password;

use serde::{Deserialize, Serialize};

pub use api_key::{extract_api_key, hash_key, ApiKeyAuthenticator};
pub use jwt::{Claims, JwtAuthenticator};

/// Scope granted to model-serving API keys.
pub const SCOPE_API: &str = "api";
/// Scope granted to JWT-authenticated admin users.
pub const SCOPE_ADMIN: &str = "admin";

/// The authenticated actor plus its workspace, attached to every request
/// after authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub workspace_id: String,
    pub actor_id: String,
    pub scopes: Vec<String>,
    /// Model allow-list inherited from the API key; `None` allows all.
    pub allowed_models: Option<Vec<String>>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Whether this principal may call the given incoming model.
    pub fn may_use_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) => allowed.iter().any(|m| m == model),
            None => true,
        }
    }
}
