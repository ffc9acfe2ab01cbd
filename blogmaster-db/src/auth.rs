use crate::{
    AuthBackend,
    client::{DbClient, Result, check},
    record::{SessionRecord, SignUpRecord},
};
use blogmaster_common::model::{
    auth::{AccessToken, Credentials, RefreshToken, Session},
    user::User,
};
use reqwest::Method;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum SignUpOutcome {
    SignedIn(Session),
    /// The account exists but the address has to be confirmed first.
    ConfirmationRequired,
}

impl DbClient {
    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<Session> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);

        let response = self
            .request(Method::POST, url, None)
            .json(&body)
            .send()
            .await?;
        let record: SessionRecord = check(response).await?.json().await?;

        Ok(record.into_session(OffsetDateTime::now_utc())?)
    }
}

impl AuthBackend for DbClient {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        let session = self
            .token_grant(
                "password",
                json!({ "email": credentials.email, "password": credentials.password }),
            )
            .await?;

        info!(user = %session.user.id, "Signed in");
        Ok(session)
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<SignUpOutcome> {
        let url = self.endpoint("auth/v1/signup")?;
        let response = self
            .request(Method::POST, url, None)
            .json(credentials)
            .send()
            .await?;
        let record: SignUpRecord = check(response).await?.json().await?;

        match record {
            SignUpRecord::Session(record) => {
                let session = record.into_session(OffsetDateTime::now_utc())?;
                info!(user = %session.user.id, "Signed up");
                Ok(SignUpOutcome::SignedIn(session))
            }
            SignUpRecord::User(user) => {
                info!(user = %user.id, "Signed up, waiting for email confirmation");
                Ok(SignUpOutcome::ConfirmationRequired)
            }
        }
    }

    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<Session> {
        let session = self
            .token_grant(
                "refresh_token",
                json!({ "refresh_token": refresh_token.expose() }),
            )
            .await?;

        debug!(expires_at = %session.expires_at, "Refreshed session");
        Ok(session)
    }

    async fn fetch_user(&self, access_token: &AccessToken) -> Result<User> {
        let url = self.endpoint("auth/v1/user")?;
        let response = self
            .request_as(Method::GET, url, access_token.expose())
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    async fn sign_out(&self, access_token: &AccessToken) -> Result<()> {
        let url = self.endpoint("auth/v1/logout")?;
        let response = self
            .request_as(Method::POST, url, access_token.expose())
            .send()
            .await?;
        check(response).await?;

        info!("Signed out");
        Ok(())
    }
}
