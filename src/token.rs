use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};

/// Claims embedded in a session token. The organization is fixed at issuance
/// and does not change without re-authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User name the session was issued to.
    pub sub: String,
    /// Organization the session is bound to.
    pub org: i64,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// A verified session: the resolved operator identity and organization.
#[derive(Debug, Clone)]
pub struct SessionPrincipal {
    pub user: String,
    pub org_id: i64,
}

/// Signs and verifies session tokens with the configured symmetric secret.
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issues a signed session token for `user` bound to `org_id`, expiring
    /// after `ttl_secs`.
    pub fn issue(&self, user: &str, org_id: i64, ttl_secs: u64) -> Result<String> {
        let now = Utc::now();
        let ttl = Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64);
        let claims = SessionClaims {
            sub: user.to_string(),
            org: org_id,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| FleetError::Serialization(format!("failed to encode session token: {err}")))
    }

    /// Verifies signature and expiry. Every failure mode collapses to
    /// `Unauthorized` so callers cannot distinguish a bad signature from an
    /// expired or garbled token.
    pub fn verify(&self, token: &str) -> Result<SessionPrincipal> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let decoded = decode::<SessionClaims>(token, &self.decoding, &validation)
            .map_err(|_| FleetError::Unauthorized)?;
        Ok(SessionPrincipal {
            user: decoded.claims.sub,
            org_id: decoded.claims.org,
        })
    }
}
