use std::sync::Arc;

use axum::http::HeaderMap;

use crate::error::{FleetError, Result};
use crate::store::Store;
use crate::token::SessionKeys;

const ORG_TOKEN_HEADER: &str = "x-auth-token";
const SESSION_COOKIE: &str = "session";

/// Credentials extracted from a request. Organization tokens arrive in
/// `X-Auth-Token` (the agent's wire header) or as a `Bearer` value; session
/// tokens as a `Bearer` value or in the `session` cookie. A single `Bearer`
/// credential may be either, so it is carried on both channels and the
/// resolver decides.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub org_token: Option<String>,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header_token = headers
            .get(ORG_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .filter(|value| !value.is_empty());
        let bearer = extract_bearer_token(headers);
        let cookie = extract_session_cookie(headers);

        Self {
            org_token: header_token.or_else(|| bearer.clone()),
            session_token: bearer.or(cookie),
        }
    }

    /// Restricts the credentials to the organization-token channel.
    pub fn org_only(self) -> Self {
        Self {
            org_token: self.org_token,
            session_token: None,
        }
    }

    /// Restricts the credentials to the session-token channel.
    pub fn session_only(self) -> Self {
        Self {
            org_token: None,
            session_token: self.session_token,
        }
    }
}

/// Resolves a request's presented credential to exactly one organization.
pub struct AuthResolver {
    store: Arc<Store>,
    sessions: SessionKeys,
}

impl AuthResolver {
    pub fn new(store: Arc<Store>, sessions: SessionKeys) -> Self {
        Self { store, sessions }
    }

    /// Exact-match organization token first, then signed session token. Any
    /// other case is a uniform `Unauthorized` with no detail about which
    /// check failed, and never a fallback to a default organization.
    pub fn resolve(&self, credentials: &Credentials) -> Result<i64> {
        if let Some(token) = credentials.org_token.as_deref() {
            if let Some(org) = self.store.org_by_token(token)? {
                return Ok(org.id);
            }
        }
        if let Some(token) = credentials.session_token.as_deref() {
            if let Ok(principal) = self.sessions.verify(token) {
                return Ok(principal.org_id);
            }
        }
        Err(FleetError::Unauthorized)
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?;
    let value = value.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("cookie")?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (name, token) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE && !token.is_empty() {
            Some(token.to_string())
        } else {
            None
        }
    })
}
