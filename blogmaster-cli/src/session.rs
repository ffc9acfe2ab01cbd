//! The signed-in session, shared by everything that talks to the backend.

use blogmaster_common::model::auth::{Credentials, Session};
use blogmaster_db::{AuthBackend, RemoteError, SignUpOutcome};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sessions expiring within this margin are refreshed ahead of time.
pub const REFRESH_MARGIN: Duration = Duration::seconds(60);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Error accessing the session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("The session file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
struct Inner<A> {
    auth: A,
    session: watch::Sender<Option<Session>>,
    path: Option<PathBuf>,
}

/// Holds the current session and tells observers whenever it changes.
///
/// No method fails because of the session itself: a session that cannot be
/// restored or refreshed is dropped and the store falls back to signed out.
#[derive(Debug)]
pub struct SessionStore<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for SessionStore<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: AuthBackend> SessionStore<A> {
    /// Restores the session persisted at `path`, if any.
    pub async fn activate(auth: A, path: Option<PathBuf>) -> Self {
        let (session, _) = watch::channel(None);
        let store = Self {
            inner: Arc::new(Inner {
                auth,
                session,
                path,
            }),
        };

        let Some(path) = &store.inner.path else {
            return store;
        };
        match load(path).await {
            Ok(Some(session)) => store.restore(session).await,
            Ok(None) => debug!(path = %path.display(), "No stored session"),
            Err(err) => {
                warn!(%err, path = %path.display(), "Ignoring the stored session");
                store.set(None).await;
            }
        }

        store
    }

    async fn restore(&self, session: Session) {
        if !session.expires_within(OffsetDateTime::now_utc(), REFRESH_MARGIN) {
            match self.inner.auth.fetch_user(&session.access_token).await {
                Ok(user) => {
                    info!(user = %user.id, "Restored session");
                    self.set(Some(Session { user, ..session })).await;
                    return;
                }
                Err(err) => warn!(%err, "Stored session was rejected, refreshing it"),
            }
        }

        match self.inner.auth.refresh(&session.refresh_token).await {
            Ok(session) => {
                info!(user = %session.user.id, "Restored session");
                self.set(Some(session)).await;
            }
            Err(err) => {
                warn!(%err, "Stored session could not be refreshed, signing out");
                self.set(None).await;
            }
        }
    }

    /// Receiver of every session change. Dropping it unregisters.
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.session.subscribe()
    }

    /// The current session, unless it has already expired.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        let now = OffsetDateTime::now_utc();
        self.inner
            .session
            .borrow()
            .as_ref()
            .filter(|session| !session.is_expired_at(now))
            .cloned()
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, RemoteError> {
        let session = self.inner.auth.sign_in(credentials).await?;
        self.set(Some(session.clone())).await;
        Ok(session)
    }

    pub async fn sign_up(&self, credentials: &Credentials) -> Result<SignUpOutcome, RemoteError> {
        let outcome = self.inner.auth.sign_up(credentials).await?;
        if let SignUpOutcome::SignedIn(session) = &outcome {
            self.set(Some(session.clone())).await;
        }
        Ok(outcome)
    }

    /// Signs out remotely if possible. The local session is cleared either way.
    pub async fn sign_out(&self) {
        let session = self.inner.session.borrow().clone();
        if let Some(session) = session
            && let Err(err) = self.inner.auth.sign_out(&session.access_token).await
        {
            warn!(%err, "Remote sign-out failed");
        }

        self.set(None).await;
    }

    pub async fn refresh_if_needed(&self) {
        let Some(session) = self.inner.session.borrow().clone() else {
            return;
        };
        if !session.expires_within(OffsetDateTime::now_utc(), REFRESH_MARGIN) {
            return;
        }

        match self.inner.auth.refresh(&session.refresh_token).await {
            Ok(session) => {
                debug!(expires_at = %session.expires_at, "Session refreshed");
                self.set(Some(session)).await;
            }
            Err(err) if session.is_expired_at(OffsetDateTime::now_utc()) => {
                warn!(%err, "Session expired and could not be refreshed");
                self.set(None).await;
            }
            Err(err) => warn!(%err, "Session refresh failed, retrying later"),
        }
    }

    async fn set(&self, session: Option<Session>) {
        if let Some(path) = &self.inner.path
            && let Err(err) = persist(path, session.as_ref()).await
        {
            warn!(%err, path = %path.display(), "Could not store the session");
        }

        self.inner.session.send_replace(session);
    }
}

async fn load(path: &Path) -> Result<Option<Session>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn persist(path: &Path, session: Option<&Session>) -> Result<(), PersistenceError> {
    match session {
        Some(session) => tokio::fs::write(path, serde_json::to_vec(session)?).await?,
        None => match tokio::fs::remove_file(path).await {
            Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::session::SessionStore;
    use blogmaster_common::model::{
        Id,
        auth::{AccessToken, Credentials, RefreshToken, Session},
        user::User,
    };
    use blogmaster_db::{AuthBackend, RemoteError, Result, SignUpOutcome};
    use std::{
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    };
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn session(access_token: &str, expires_in: Duration) -> Session {
        Session {
            access_token: AccessToken::new(access_token.to_owned()),
            refresh_token: RefreshToken::new(format!("refresh-{access_token}")),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            user: User {
                id: Id::new(Uuid::new_v4()),
                email: Some("x@other.com".to_owned()),
            },
        }
    }

    fn rejected() -> RemoteError {
        RemoteError::Service {
            status: 401,
            message: "invalid JWT".to_owned(),
        }
    }

    #[derive(Default)]
    struct MockAuth {
        /// Tokens `fetch_user` accepts.
        valid: Vec<String>,
        /// What `refresh` and `sign_in` hand out; `None` fails.
        issued: Option<Session>,
        sign_out_fails: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockAuth {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn issue(&self) -> Result<Session> {
            self.issued.clone().ok_or_else(rejected)
        }
    }

    impl AuthBackend for MockAuth {
        async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
            self.record(format!("sign_in {}", credentials.email));
            self.issue()
        }

        async fn sign_up(&self, _: &Credentials) -> Result<SignUpOutcome> {
            self.record("sign_up");
            Ok(self
                .issued
                .clone()
                .map_or(SignUpOutcome::ConfirmationRequired, SignUpOutcome::SignedIn))
        }

        async fn refresh(&self, refresh_token: &RefreshToken) -> Result<Session> {
            self.record(format!("refresh {}", refresh_token.expose()));
            self.issue()
        }

        async fn fetch_user(&self, access_token: &AccessToken) -> Result<User> {
            self.record(format!("fetch_user {}", access_token.expose()));
            if self.valid.iter().any(|valid| valid == access_token.expose()) {
                Ok(User {
                    id: Id::new(Uuid::new_v4()),
                    email: Some("fresh@other.com".to_owned()),
                })
            } else {
                Err(rejected())
            }
        }

        async fn sign_out(&self, access_token: &AccessToken) -> Result<()> {
            self.record(format!("sign_out {}", access_token.expose()));
            if self.sign_out_fails {
                Err(rejected())
            } else {
                Ok(())
            }
        }
    }

    fn session_file() -> PathBuf {
        std::env::temp_dir().join(format!("blogmaster-session-{}.json", Uuid::new_v4()))
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "x@other.com".to_owned(),
            password: "hunter2".to_owned(),
        }
    }

    async fn store_session(path: &Path, session: &Session) {
        tokio::fs::write(path, serde_json::to_vec(session).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn starts_signed_out_without_persistence() {
        let store = SessionStore::activate(MockAuth::default(), None).await;
        assert_eq!(store.current(), None);
        assert_eq!(*store.observe().borrow(), None);
    }

    #[tokio::test]
    async fn restores_a_valid_session() {
        let path = session_file();
        let stored = session("stored", Duration::hours(1));
        store_session(&path, &stored).await;

        let auth = MockAuth {
            valid: vec!["stored".to_owned()],
            ..MockAuth::default()
        };
        let store = SessionStore::activate(auth, Some(path.clone())).await;

        let current = store.current().unwrap();
        assert_eq!(current.access_token, stored.access_token);
        assert_eq!(current.user.email.as_deref(), Some("fresh@other.com"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn refreshes_a_rejected_session() {
        let path = session_file();
        store_session(&path, &session("revoked", Duration::hours(1))).await;

        let calls = Arc::default();
        let auth = MockAuth {
            issued: Some(session("fresh", Duration::hours(1))),
            calls: Arc::clone(&calls),
            ..MockAuth::default()
        };
        let store = SessionStore::activate(auth, Some(path.clone())).await;

        assert_eq!(
            store.current().unwrap().access_token.expose(),
            "fresh"
        );
        assert_eq!(
            *calls.lock().unwrap(),
            ["fetch_user revoked", "refresh refresh-revoked"]
        );

        let persisted: Session =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(persisted.access_token.expose(), "fresh");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn expired_session_skips_validation() {
        let path = session_file();
        store_session(&path, &session("old", -Duration::hours(1))).await;

        let calls = Arc::default();
        let auth = MockAuth {
            calls: Arc::clone(&calls),
            ..MockAuth::default()
        };
        let store = SessionStore::activate(auth, Some(path.clone())).await;

        assert_eq!(store.current(), None);
        assert_eq!(*calls.lock().unwrap(), ["refresh refresh-old"]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_ignored() {
        let path = session_file();
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = SessionStore::activate(MockAuth::default(), Some(path.clone())).await;
        assert_eq!(store.current(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sign_in_and_out() {
        let path = session_file();
        let auth = MockAuth {
            issued: Some(session("signed-in", Duration::hours(1))),
            sign_out_fails: true,
            ..MockAuth::default()
        };
        let store = SessionStore::activate(auth, Some(path.clone())).await;
        let mut observer = store.observe();

        let session = store.sign_in(&credentials()).await.unwrap();
        assert!(observer.has_changed().unwrap());
        assert_eq!(observer.borrow_and_update().as_ref(), Some(&session));
        assert!(path.exists());

        store.sign_out().await;
        assert_eq!(store.current(), None);
        assert_eq!(*observer.borrow_and_update(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_sign_in_keeps_the_store_signed_out() {
        let store = SessionStore::activate(MockAuth::default(), None).await;

        assert!(store.sign_in(&credentials()).await.is_err());
        assert_eq!(store.current(), None);
        assert_eq!(
            store.sign_up(&credentials()).await.unwrap(),
            SignUpOutcome::ConfirmationRequired
        );
        assert_eq!(store.current(), None);
    }

    #[tokio::test]
    async fn refresh_ahead_of_expiry() {
        let calls = Arc::default();
        let auth = MockAuth {
            issued: Some(session("later", Duration::hours(1))),
            calls: Arc::clone(&calls),
            ..MockAuth::default()
        };
        let store = SessionStore::activate(auth, None).await;
        store.sign_in(&credentials()).await.unwrap();

        // Far from expiry: nothing to do.
        store.refresh_if_needed().await;
        assert_eq!(calls.lock().unwrap().len(), 1);

        store
            .inner
            .session
            .send_replace(Some(session("soon", Duration::seconds(30))));
        store.refresh_if_needed().await;
        assert_eq!(store.current().unwrap().access_token.expose(), "later");
    }

    #[tokio::test]
    async fn expired_session_is_dropped_when_refresh_fails() {
        let store = SessionStore::activate(MockAuth::default(), None).await;

        store
            .inner
            .session
            .send_replace(Some(session("soon", Duration::seconds(30))));
        store.refresh_if_needed().await;
        assert!(store.current().is_some());

        store
            .inner
            .session
            .send_replace(Some(session("gone", -Duration::seconds(1))));
        assert_eq!(store.current(), None);
        store.refresh_if_needed().await;
        assert_eq!(*store.observe().borrow(), None);
    }
}
