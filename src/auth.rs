//! Principal identification: API-key bearer auth (§6.1), or the literal
//! `anonymous` principal when `auth_enabled` is false.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use poem::Request;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::kv::KeyValueStore;
use crate::model::Role;

pub const ANONYMOUS_PRINCIPAL: &str = "anonymous";
const API_KEY_PREFIX: &str = "cui_sk_";

/// Mints a fresh API key in the `cui_sk_` + 43 URL-safe-base64 chars format
/// (§6.1) for operator provisioning tooling. The service never stores the
/// plaintext key; only `sha256(key)` goes into `P:apikey:{hash}`.
pub fn generate_api_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub owner_token: String,
    pub role: Role,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            owner_token: ANONYMOUS_PRINCIPAL.to_string(),
            role: Role::Free,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    Unauthorized,
    #[error("api key is revoked")]
    Forbidden,
}

/// Looks up `P:apikey:{sha256(key)}` and resolves a [`Principal`].
pub struct ApiKeyAuthenticator {
    kv: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl ApiKeyAuthenticator {
    pub fn new(kv: Arc<dyn KeyValueStore>, key_prefix: String) -> Self {
        Self { kv, key_prefix }
    }

    pub async fn authenticate(&self, presented_key: &str) -> Result<Principal, AuthError> {
        let mut hasher = Sha256::new();
        hasher.update(presented_key.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let key = format!("{}:apikey:{}", self.key_prefix, digest);
        let fields = self
            .kv
            .hash_get_all(&key)
            .await
            .map_err(|_| AuthError::Unauthorized)?
            .ok_or(AuthError::Unauthorized)?;

        let is_active = fields
            .get("is_active")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        if !is_active {
            return Err(AuthError::Forbidden);
        }

        let user_id = fields.get("user_id").cloned().ok_or(AuthError::Unauthorized)?;
        let role = match fields.get("role").map(String::as_str) {
            Some("pro") => Role::Pro,
            Some("internal") => Role::Internal,
            _ => Role::Free,
        };

        Ok(Principal {
            owner_token: user_id,
            role,
        })
    }
}

/// Extracts the raw bearer token from a request without going through
/// poem-openapi's derive machinery, for use in plain `poem::Endpoint`
/// middleware (the websocket upgrade handler, §4.8, cannot use
/// `SecurityScheme` directly).
pub fn bearer_token_from_request(req: &Request) -> Option<String> {
    let header = req.headers().get(poem::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}
