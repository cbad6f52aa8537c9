use base64::Engine; // for URL_SAFE_NO_PAD.decode
use parking_lot::RwLock;
use reqwest::header::HeaderValue;
use serde::Deserialize;

/// Claims we care about from the dashboard session JWT. Everything is
/// optional; tokens from older sessions carry fewer fields.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: Option<String>,
    pub exp: Option<i64>,
}

/// Owns the bearer token for the current session and builds the
/// `Authorization` header from it. The token may be absent (signed-out
/// session) or replaced at any time (sign-in, refresh).
#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            token: RwLock::new(initial.filter(|t| !t.is_empty())),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        *self.token.write() = if token.is_empty() { None } else { Some(token) };
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    /// `Authorization` header value, or None when signed out. Tokens that
    /// cannot be represented as a header (control bytes) count as absent.
    pub fn bearer(&self) -> Option<HeaderValue> {
        let guard = self.token.read();
        let token = guard.as_deref()?;
        HeaderValue::from_str(&format!("Bearer {}", token)).ok()
    }

    /// Decode the payload segment of the stored JWT. Returns None for
    /// missing tokens and for anything that is not base64url-encoded JSON;
    /// the caller treats that the same as a token without claims.
    pub fn claims(&self) -> Option<TokenClaims> {
        let guard = self.token.read();
        let token = guard.as_deref()?;
        decode_claims(token)
    }

    /// Whether the token's `exp` claim is in the past at `epoch` seconds.
    /// Tokens without a readable `exp` are treated as not expired.
    pub fn is_expired_at(&self, epoch: i64) -> bool {
        matches!(self.claims().and_then(|c| c.exp), Some(exp) if exp <= epoch)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

// JWT payload codec: base64url(JSON claims), middle dot-separated segment.
fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}
