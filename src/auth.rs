/// Bearer token authentication for protected routes
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

/// Claims extracted from a verified token. Lives for one request.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub subject: String,
    pub roles: Vec<String>,
    /// Expiry as seconds since the Unix epoch
    pub expires_at: i64,
}

/// Why a token was rejected. Internal diagnostics only: callers see a
/// single opaque AUTH_FAILED outcome regardless of the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader,
    InvalidScheme,
    MalformedToken,
    UnsupportedAlgorithm,
    InvalidSignature,
    MalformedClaims,
    Expired,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            AuthError::MissingHeader => "authorization header missing",
            AuthError::InvalidScheme => "authorization header is not a bearer token",
            AuthError::MalformedToken => "token is not a well-formed JWT",
            AuthError::UnsupportedAlgorithm => "token algorithm is not HS256",
            AuthError::InvalidSignature => "token signature verification failed",
            AuthError::MalformedClaims => "token claims are malformed",
            AuthError::Expired => "token has expired",
        };
        f.write_str(reason)
    }
}

#[derive(Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    exp: i64,
}

/// Validates bearer tokens against a shared HMAC secret
pub struct TokenAuthenticator {
    enabled: bool,
    key: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            key: config.secret.as_bytes().to_vec(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Authenticate an `Authorization` header value.
    ///
    /// Returns `Ok(None)` when authentication is disabled (anonymous
    /// access), `Ok(Some(claims))` on a verified token, and the precise
    /// rejection reason otherwise.
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<Option<TokenClaims>, AuthError> {
        if !self.enabled {
            return Ok(None);
        }

        let header = auth_header.ok_or(AuthError::MissingHeader)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidScheme)?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        self.verify_at(token, now).map(Some)
    }

    fn verify_at(&self, token: &str, now_secs: i64) -> Result<TokenClaims, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::MalformedToken);
        }

        let header_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(parts[0])
            .map_err(|_| AuthError::MalformedToken)?;
        let header: serde_json::Value =
            serde_json::from_slice(&header_bytes).map_err(|_| AuthError::MalformedToken)?;
        match header.get("alg").and_then(|v| v.as_str()) {
            Some("HS256") => {}
            _ => return Err(AuthError::UnsupportedAlgorithm),
        }

        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| AuthError::MalformedToken)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::InvalidSignature)?;
        mac.update(parts[0].as_bytes());
        mac.update(b".");
        mac.update(parts[1].as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let payload_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| AuthError::MalformedToken)?;
        let claims: RawClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::MalformedClaims)?;

        if claims.exp <= now_secs {
            return Err(AuthError::Expired);
        }

        Ok(TokenClaims {
            subject: claims.sub,
            roles: claims.roles,
            expires_at: claims.exp,
        })
    }
}
