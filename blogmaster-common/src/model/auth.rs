use crate::model::user::{User, UserId};
use base64::{DecodeError, Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_ADMIN_DOMAIN: &str = "admin.mydomain.com";

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum AccessTokenDecodeError {
    #[error("Not enough parts separated by '.'")]
    NotEnoughParts,
    #[error("Decoding base64 failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("The claims could not be parsed: {0}")]
    Claims(String),
    #[error("The expiry claim is out of range")]
    ExpiryOutOfRange,
}

/// Bearer token issued by the auth service (a JWT).
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(String);

#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
pub struct AccessTokenClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
}

impl AccessToken {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(token)
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Decodes the payload segment without verifying the signature.
    pub fn claims(&self) -> Result<AccessTokenClaims, AccessTokenDecodeError> {
        let mut parts = self.0.splitn(3, '.');
        let _header = parts.next().ok_or(AccessTokenDecodeError::NotEnoughParts)?;
        let payload = parts.next().ok_or(AccessTokenDecodeError::NotEnoughParts)?;
        parts.next().ok_or(AccessTokenDecodeError::NotEnoughParts)?;

        let decoded = BASE64_URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        serde_json::from_slice(&decoded)
            .map_err(|err| AccessTokenDecodeError::Claims(err.to_string()))
    }

    pub fn expires_at(&self) -> Result<OffsetDateTime, AccessTokenDecodeError> {
        let claims = self.claims()?;
        OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| AccessTokenDecodeError::ExpiryOutOfRange)
    }
}

impl RefreshToken {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(token)
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AccessToken").field(&"[redacted]").finish()
    }
}

impl Debug for RefreshToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RefreshToken").field(&"[redacted]").finish()
    }
}

/// Email and password as typed by the user.
#[derive(Clone, Eq, PartialEq, Hash, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize, Deserialize)]
pub struct Session {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: User,
}

impl Session {
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn expires_within(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }
}

/// Email domain whose accounts are shown administrative controls.
///
/// This only drives what the client displays. Row-level security on the
/// backend decides what a user may actually delete.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct AdminDomain(String);

impl AdminDomain {
    #[must_use]
    pub fn new(domain: &str) -> Self {
        Self(domain.trim().trim_start_matches('@').to_lowercase())
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn matches(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        email
            .strip_suffix(self.0.as_str())
            .is_some_and(|local| local.ends_with('@') && local.len() > 1)
    }
}

impl Default for AdminDomain {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN_DOMAIN)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub enum Authorization {
    #[default]
    Unauthenticated,
    Standard,
    Elevated,
}

impl Authorization {
    #[must_use]
    pub fn for_email(email: Option<&str>, admin_domain: &AdminDomain) -> Self {
        if email.is_some_and(|email| admin_domain.matches(email)) {
            Self::Elevated
        } else {
            Self::Standard
        }
    }

    #[must_use]
    pub fn of(identity: Option<&Identity>) -> Self {
        identity.map_or(Self::Unauthenticated, |identity| identity.authorization)
    }

    #[must_use]
    pub fn is_elevated(self) -> bool {
        self == Self::Elevated
    }
}

/// Who is signed in, as far as the views are concerned.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Identity {
    pub user_id: UserId,
    pub email: Option<String>,
    pub authorization: Authorization,
}

impl Identity {
    #[must_use]
    pub fn from_session(session: &Session, admin_domain: &AdminDomain) -> Self {
        Self {
            user_id: session.user.id,
            email: session.user.email.clone(),
            authorization: Authorization::for_email(session.user.email.as_deref(), admin_domain),
        }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.authorization.is_elevated()
    }
}
