//! Client side of the hosted backend: REST gateway, auth endpoints and the
//! realtime change feed.

pub mod auth;
pub mod client;
pub mod realtime;
mod record;

use blogmaster_common::model::{
    auth::{AccessToken, Credentials, RefreshToken, Session},
    comment::{Comment, CommentId, NewComment},
    post::{NewPost, Post, PostId},
    stats::Stats,
    user::User,
};
use std::future::Future;

pub use auth::SignUpOutcome;
pub use client::{ApiKey, BackendConfig, DbClient, RemoteError, Result};
pub use realtime::{RealtimeClient, Subscription, SubscriptionState};

/// Typed reads and writes against the `posts` and `comments` collections.
///
/// Reads fall back to the public key when no session is given. Writes need a
/// session; whether they are accepted is up to the backend's row-level
/// security.
pub trait Gateway {
    fn list_posts(&self, session: Option<&Session>)
    -> impl Future<Output = Result<Vec<Post>>> + Send;

    fn create_post(&self, session: &Session, post: &NewPost)
    -> impl Future<Output = Result<()>> + Send;

    fn delete_post(&self, session: &Session, id: PostId)
    -> impl Future<Output = Result<()>> + Send;

    fn list_comments(
        &self,
        session: Option<&Session>,
        post_id: PostId,
    ) -> impl Future<Output = Result<Vec<Comment>>> + Send;

    fn create_comment(
        &self,
        session: &Session,
        comment: &NewComment,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_comment(&self, session: &Session, id: CommentId)
    -> impl Future<Output = Result<()>> + Send;

    fn fetch_stats(&self, session: Option<&Session>) -> impl Future<Output = Result<Stats>> + Send;
}

/// Password authentication against the backend's auth service.
pub trait AuthBackend {
    fn sign_in(&self, credentials: &Credentials) -> impl Future<Output = Result<Session>> + Send;

    fn sign_up(&self, credentials: &Credentials)
    -> impl Future<Output = Result<SignUpOutcome>> + Send;

    fn refresh(&self, refresh_token: &RefreshToken)
    -> impl Future<Output = Result<Session>> + Send;

    fn fetch_user(&self, access_token: &AccessToken) -> impl Future<Output = Result<User>> + Send;

    fn sign_out(&self, access_token: &AccessToken) -> impl Future<Output = Result<()>> + Send;
}

/// Row-level insert/delete notifications.
///
/// Subscribing never blocks: the returned [`Subscription`] starts out
/// [`SubscriptionState::Subscribing`] and turns active once the backend
/// confirms the join. Dropping it unsubscribes.
pub trait ChangeFeed {
    fn subscribe_posts(&self) -> Subscription<Post>;

    fn subscribe_comments(&self, post_id: PostId) -> Subscription<Comment>;

    /// Forwards the signed-in user's token so row-level security on the feed
    /// follows the session. `None` falls back to the public key.
    fn set_access_token(&self, access_token: Option<AccessToken>);
}
