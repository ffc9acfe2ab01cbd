use blogmaster_common::model::{
    ModelValidationError,
    auth::{AccessToken, RefreshToken, Session},
    user::User,
};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

/// Token response of the auth service.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
pub(crate) struct SessionRecord {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

/// Sign-up answers with a session, or with the bare user when the address
/// still has to be confirmed.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum SignUpRecord {
    Session(SessionRecord),
    User(User),
}

/// Error body of either the REST or the auth service. They disagree on the
/// field that carries the message.
#[derive(Clone, Eq, PartialEq, Debug, Default, Deserialize)]
pub(crate) struct ErrorRecord {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl ErrorRecord {
    pub fn into_message(self) -> Option<String> {
        let message = self
            .message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)?;

        Some(match self.hint {
            Some(hint) if !hint.is_empty() => format!("{message} ({hint})"),
            _ => message,
        })
    }
}

impl SessionRecord {
    pub fn into_session(self, now: OffsetDateTime) -> Result<Session, ModelValidationError> {
        let access_token = AccessToken::new(self.access_token);

        let expires_at = if let Some(expires_at) = self.expires_at {
            OffsetDateTime::from_unix_timestamp(expires_at)
                .map_err(|_| ModelValidationError::MissingSessionExpiry)?
        } else if let Some(expires_in) = self.expires_in {
            now + Duration::seconds(expires_in)
        } else {
            access_token.expires_at()?
        };

        Ok(Session {
            access_token,
            refresh_token: RefreshToken::new(self.refresh_token),
            expires_at,
            user: self.user,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::record::{ErrorRecord, SessionRecord, SignUpRecord};
    use blogmaster_common::model::ModelValidationError;
    use serde_json::json;
    use time::{Duration, macros::datetime};
    use uuid::Uuid;

    fn user_json(id: Uuid) -> serde_json::Value {
        json!({
            "id": id.to_string(),
            "aud": "authenticated",
            "role": "authenticated",
            "email": "x@other.com",
            "app_metadata": {},
        })
    }

    #[test]
    fn session_expiry_prefers_absolute_time() {
        let id = Uuid::new_v4();
        let record: SessionRecord = serde_json::from_value(json!({
            "access_token": "a.b.c",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": 1_893_456_000,
            "refresh_token": "r",
            "user": user_json(id),
        }))
        .unwrap();

        let session = record.into_session(datetime!(2025-01-01 00:00 UTC)).unwrap();
        assert_eq!(session.expires_at, datetime!(2030-01-01 00:00 UTC));
        assert_eq!(session.user.id.uuid(), id);
        assert_eq!(session.user.email.as_deref(), Some("x@other.com"));
    }

    #[test]
    fn session_expiry_from_lifetime() {
        let now = datetime!(2025-01-01 00:00 UTC);
        let record: SessionRecord = serde_json::from_value(json!({
            "access_token": "a.b.c",
            "expires_in": 3600,
            "refresh_token": "r",
            "user": user_json(Uuid::new_v4()),
        }))
        .unwrap();

        let session = record.into_session(now).unwrap();
        assert_eq!(session.expires_at, now + Duration::hours(1));
    }

    #[test]
    fn session_without_any_expiry_is_invalid() {
        let record: SessionRecord = serde_json::from_value(json!({
            "access_token": "opaque",
            "refresh_token": "r",
            "user": user_json(Uuid::new_v4()),
        }))
        .unwrap();

        assert!(matches!(
            record.into_session(datetime!(2025-01-01 00:00 UTC)),
            Err(ModelValidationError::AccessToken(_))
        ));
    }

    #[test]
    fn sign_up_without_session() {
        let record: SignUpRecord = serde_json::from_value(user_json(Uuid::new_v4())).unwrap();
        assert!(matches!(record, SignUpRecord::User(_)));
    }

    #[test]
    fn error_messages_from_either_service() {
        let rest: ErrorRecord = serde_json::from_value(json!({
            "code": "42501",
            "details": null,
            "hint": null,
            "message": "new row violates row-level security policy for table \"posts\"",
        }))
        .unwrap();
        assert_eq!(
            rest.into_message().as_deref(),
            Some("new row violates row-level security policy for table \"posts\"")
        );

        let auth: ErrorRecord = serde_json::from_value(json!({
            "error": "invalid_grant",
            "error_description": "Invalid login credentials",
        }))
        .unwrap();
        assert_eq!(
            auth.into_message().as_deref(),
            Some("Invalid login credentials")
        );

        assert_eq!(ErrorRecord::default().into_message(), None);
    }
}
