/* src/auth.rs */

use crate::error::GatewayError;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Headers the gateway owns. Stripped from every inbound request before
/// dispatch so clients cannot forge a validated identity, then re-added
/// from the verified token.
pub const CONTEXT_HEADERS: &[&str] = &[
    "x-user-id",
    "x-user-email",
    "x-user-roles",
    "x-gateway-signature",
    "x-gateway-timestamp",
];

/// Identity derived from a validated token. Immutable for the request's
/// lifetime; never persisted.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub email: String,
    pub roles: Vec<String>,
    pub expires_at: u64,
}

/// Token claim layout used by the auth service: subject is the email, the
/// numeric user id nests under `user`, permissions are a string list.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
    user: Option<UserClaim>,
    permission: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct UserClaim {
    id: Option<serde_json::Value>,
}

/// Validates bearer tokens and signs the downstream user context.
pub struct AuthVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    signature_secret: String,
}

impl AuthVerifier {
    /// The JWT secret is base64-encoded, exactly as the auth service that
    /// issues the tokens encodes it.
    pub fn new(jwt_base64_secret: &str, signature_secret: String) -> Result<AuthVerifier> {
        let key_bytes = BASE64
            .decode(jwt_base64_secret.trim())
            .context("JWT_BASE64_SECRET is not valid base64")?;
        Ok(AuthVerifier {
            decoding_key: DecodingKey::from_secret(&key_bytes),
            validation: Validation::new(Algorithm::HS256),
            signature_secret,
        })
    }

    /// Checks signature and expiry, then extracts the request identity.
    pub fn validate(&self, token: &str) -> Result<AuthContext, GatewayError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::Unauthorized(format!("Invalid or expired token: {}", e)))?;

        let claims = data.claims;
        let user_id = claims.user.and_then(|u| u.id).map(|id| match id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });

        Ok(AuthContext {
            user_id,
            email: claims.sub,
            roles: claims.permission.unwrap_or_default(),
            expires_at: claims.exp,
        })
    }

    /// Replaces the gateway-owned headers with the validated identity plus
    /// an HMAC signature proving the request passed through the gateway.
    pub fn apply_context_headers(&self, headers: &mut HeaderMap, ctx: &AuthContext) {
        for name in CONTEXT_HEADERS {
            headers.remove(*name);
        }

        let timestamp = chrono::Utc::now().timestamp_millis();
        let user_id = ctx.user_id.as_deref().unwrap_or("");
        let signature = generate_signature(
            &signature_data(user_id, &ctx.email, timestamp),
            &self.signature_secret,
        );

        if let Ok(v) = HeaderValue::from_str(user_id) {
            headers.insert("x-user-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(&ctx.email) {
            headers.insert("x-user-email", v);
        }
        if let Ok(v) = HeaderValue::from_str(&ctx.roles.join(",")) {
            headers.insert("x-user-roles", v);
        }
        if let Ok(v) = HeaderValue::from_str(&signature) {
            headers.insert("x-gateway-signature", v);
        }
        if let Ok(v) = HeaderValue::from_str(&timestamp.to_string()) {
            headers.insert("x-gateway-timestamp", v);
        }
    }
}

/// The string downstream services re-sign to verify request origin.
pub fn signature_data(user_id: &str, email: &str, timestamp_ms: i64) -> String {
    format!("{}:{}:{}", user_id, email, timestamp_ms)
}

pub fn generate_signature(data: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(data.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time verification (the MAC comparison runs in constant time).
pub fn verify_signature(data: &str, signature: &str, secret: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(data.as_bytes());
    mac.verify_slice(&raw).is_ok()
}
