use crate::{Gateway, record::ErrorRecord};
use blogmaster_common::model::{
    ModelValidationError,
    auth::Session,
    comment::{COMMENT_COLUMNS, Comment, CommentId, NewComment},
    post::{NewPost, POST_COLUMNS, Post, PostId},
    stats::Stats,
};
use reqwest::{
    Method, RequestBuilder, Response,
    header::{ACCEPT, HeaderMap, HeaderValue, InvalidHeaderValue},
};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

const PREFER: &str = "Prefer";
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("The request could not be completed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message} (HTTP {status})")]
    Service { status: u16, message: String },
    #[error("An object returned by the backend was invalid: {0}")]
    Data(#[from] ModelValidationError),
    #[error("A response could not be decoded: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Nothing was deleted: the row is gone or you may not delete it")]
    NothingDeleted,
    #[error("Invalid backend URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("The backend URL must use http or https, not {0}")]
    UnsupportedScheme(String),
    #[error("The API key is not a valid header value: {0}")]
    InvalidApiKey(#[from] InvalidHeaderValue),
    #[error("The realtime connection failed: {0}")]
    Websocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

/// Public (anonymous) API key of the backend project.
#[derive(Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    #[must_use]
    pub fn new(key: String) -> Self {
        Self(key)
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for ApiKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ApiKey").field(&"[redacted]").finish()
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: Url,
    pub api_key: ApiKey,
}

impl BackendConfig {
    /// Base URL with a trailing slash, so relative endpoints join below it.
    pub fn base_url(&self) -> Result<Url> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => return Err(RemoteError::UnsupportedScheme(other.to_owned())),
        }

        let mut base = self.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        Ok(base)
    }
}

/// HTTP client for the REST, RPC and auth endpoints of the backend.
#[derive(Clone, Debug)]
pub struct DbClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: ApiKey,
}

impl DbClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut api_key = HeaderValue::from_str(config.api_key.expose())?;
        api_key.set_sensitive(true);
        headers.insert("apikey", api_key);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url()?,
            api_key: config.api_key.clone(),
        })
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    pub(crate) fn request(
        &self,
        method: Method,
        url: Url,
        session: Option<&Session>,
    ) -> RequestBuilder {
        let bearer = session.map_or(self.api_key.expose(), |session| {
            session.access_token.expose()
        });
        self.request_as(method, url, bearer)
    }

    pub(crate) fn request_as(&self, method: Method, url: Url, bearer: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(bearer)
    }

    pub(crate) fn posts_url(&self) -> Result<Url> {
        let mut url = self.endpoint("rest/v1/posts")?;
        url.query_pairs_mut()
            .append_pair("select", POST_COLUMNS)
            .append_pair("order", "created_at.desc");
        Ok(url)
    }

    pub(crate) fn comments_url(&self, post_id: PostId) -> Result<Url> {
        let mut url = self.endpoint("rest/v1/comments")?;
        url.query_pairs_mut()
            .append_pair("select", COMMENT_COLUMNS)
            .append_pair("post_id", &format!("eq.{post_id}"))
            .append_pair("order", "created_at.asc");
        Ok(url)
    }

    pub(crate) fn row_url(&self, table: &str, id: impl std::fmt::Display) -> Result<Url> {
        let mut url = self.endpoint(&format!("rest/v1/{table}"))?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(url)
    }

    async fn insert<T: Serialize + Sync>(
        &self,
        table: &str,
        session: &Session,
        row: &T,
    ) -> Result<()> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let response = self
            .request(Method::POST, url, Some(session))
            .header(PREFER, "return=minimal")
            .json(row)
            .send()
            .await?;
        check(response).await?;

        debug!(table, "Inserted row");
        Ok(())
    }

    async fn delete(&self, table: &str, session: &Session, url: Url) -> Result<()> {
        let response = self
            .request(Method::DELETE, url, Some(session))
            .header(PREFER, "return=representation")
            .send()
            .await?;
        let deleted: Vec<serde_json::Value> = check(response).await?.json().await?;

        // Row-level security filters rows out instead of refusing the request.
        if deleted.is_empty() {
            warn!(table, "Delete matched no row");
            return Err(RemoteError::NothingDeleted);
        }

        debug!(table, count = deleted.len(), "Deleted rows");
        Ok(())
    }
}

/// Passes successful responses through and turns everything else into
/// [`RemoteError::Service`].
pub(crate) async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(service_error(status.as_u16(), &body))
}

pub(crate) fn service_error(status: u16, body: &str) -> RemoteError {
    let message = serde_json::from_str::<ErrorRecord>(body)
        .ok()
        .and_then(ErrorRecord::into_message)
        .unwrap_or_else(|| {
            let body = body.trim();
            if body.is_empty() {
                format!("request failed with status {status}")
            } else {
                body.to_owned()
            }
        });

    RemoteError::Service { status, message }
}

impl Gateway for DbClient {
    async fn list_posts(&self, session: Option<&Session>) -> Result<Vec<Post>> {
        let response = self
            .request(Method::GET, self.posts_url()?, session)
            .send()
            .await?;
        let posts: Vec<Post> = check(response).await?.json().await?;

        debug!(count = posts.len(), "Fetched posts");
        Ok(posts)
    }

    async fn create_post(&self, session: &Session, post: &NewPost) -> Result<()> {
        self.insert("posts", session, post).await
    }

    async fn delete_post(&self, session: &Session, id: PostId) -> Result<()> {
        self.delete("posts", session, self.row_url("posts", id)?).await
    }

    async fn list_comments(
        &self,
        session: Option<&Session>,
        post_id: PostId,
    ) -> Result<Vec<Comment>> {
        let response = self
            .request(Method::GET, self.comments_url(post_id)?, session)
            .send()
            .await?;
        let comments: Vec<Comment> = check(response).await?.json().await?;

        debug!(%post_id, count = comments.len(), "Fetched comments");
        Ok(comments)
    }

    async fn create_comment(&self, session: &Session, comment: &NewComment) -> Result<()> {
        self.insert("comments", session, comment).await
    }

    async fn delete_comment(&self, session: &Session, id: CommentId) -> Result<()> {
        self.delete("comments", session, self.row_url("comments", id)?)
            .await
    }

    async fn fetch_stats(&self, session: Option<&Session>) -> Result<Stats> {
        let url = self.endpoint("rest/v1/rpc/get_blog_stats")?;
        let response = self
            .request(Method::POST, url, session)
            .header(ACCEPT, SINGLE_OBJECT)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let stats: Stats = check(response).await?.json().await?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        AuthBackend, Gateway, SignUpOutcome,
        client::{ApiKey, BackendConfig, DbClient, RemoteError, service_error},
    };
    use blogmaster_common::model::{
        Id,
        auth::{AccessToken, Credentials, RefreshToken, Session},
        post::{NewPost, PostContent},
        user::User,
    };
    use time::{Duration, OffsetDateTime};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };
    use url::Url;
    use uuid::Uuid;

    /// Serves a single HTTP exchange with a canned response and hands back the
    /// request as received, header names lowercased.
    async fn respond_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0; 4096];
            loop {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);

                let text = String::from_utf8_lossy(&request).to_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .map_or(0, |length| length.trim().parse().unwrap());
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });

        (url, server)
    }

    fn session() -> Session {
        Session {
            access_token: AccessToken::new("a.b.c".to_owned()),
            refresh_token: RefreshToken::new("r".to_owned()),
            expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
            user: User {
                id: Id::new(Uuid::new_v4()),
                email: Some("x@other.com".to_owned()),
            },
        }
    }

    fn client(url: &str) -> DbClient {
        DbClient::new(&BackendConfig {
            url: Url::parse(url).unwrap(),
            api_key: ApiKey::new("public-key".to_owned()),
        })
        .unwrap()
    }

    #[test]
    fn endpoints_join_below_the_project_url() {
        let root = client("https://project.example.co");

        assert_eq!(
            root.endpoint("rest/v1/rpc/get_blog_stats").unwrap().as_str(),
            "https://project.example.co/rest/v1/rpc/get_blog_stats"
        );

        let nested = client("http://localhost:54321/backend");
        assert_eq!(
            nested.endpoint("auth/v1/user").unwrap().as_str(),
            "http://localhost:54321/backend/auth/v1/user"
        );
    }

    #[test]
    fn list_queries() {
        let client = client("https://project.example.co/");
        let post_id = Id::new(Uuid::new_v4());

        let posts = client.posts_url().unwrap();
        let pairs: Vec<(String, String)> = posts.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            [
                ("select".to_owned(), "id,user_id,title,content,created_at".to_owned()),
                ("order".to_owned(), "created_at.desc".to_owned()),
            ]
        );

        let comments = client.comments_url(post_id).unwrap();
        let pairs: Vec<(String, String)> = comments.query_pairs().into_owned().collect();
        assert_eq!(pairs[1], ("post_id".to_owned(), format!("eq.{post_id}")));
        assert_eq!(pairs[2], ("order".to_owned(), "created_at.asc".to_owned()));
    }

    #[test]
    fn row_filter() {
        let client = client("https://project.example.co/");
        let id = Uuid::new_v4();

        let url = client.row_url("comments", id).unwrap();
        assert_eq!(url.path(), "/rest/v1/comments");
        assert_eq!(url.query(), Some(format!("id=eq.{id}").as_str()));
    }

    #[test]
    fn rejects_non_http_urls() {
        let result = DbClient::new(&BackendConfig {
            url: Url::parse("ftp://project.example.co").unwrap(),
            api_key: ApiKey::new("public-key".to_owned()),
        });

        assert!(matches!(result, Err(RemoteError::UnsupportedScheme(scheme)) if scheme == "ftp"));
    }

    #[test]
    fn service_errors_carry_the_backend_message() {
        let error = service_error(401, r#"{"message":"JWT expired","code":"PGRST301"}"#);
        assert_eq!(error.to_string(), "JWT expired (HTTP 401)");

        let error = service_error(502, "Bad gateway");
        assert_eq!(error.to_string(), "Bad gateway (HTTP 502)");

        let error = service_error(500, "");
        assert_eq!(
            error.to_string(),
            "request failed with status 500 (HTTP 500)"
        );
    }

    #[tokio::test]
    async fn delete_that_matches_no_row_is_reported() {
        let (url, server) = respond_once("200 OK", "[]").await;
        let id = Id::new(Uuid::new_v4());

        let result = client(&url).delete_post(&session(), id).await;
        assert!(matches!(result, Err(RemoteError::NothingDeleted)));

        let request = server.await.unwrap();
        assert!(request.starts_with(&format!("delete /rest/v1/posts?id=eq.{id} ")));
        assert!(request.contains("prefer: return=representation"));
        assert!(request.contains("authorization: bearer a.b.c"));
        assert!(request.contains("apikey: public-key"));
    }

    #[tokio::test]
    async fn delete_of_a_visible_row_succeeds() {
        let id = Uuid::new_v4();
        let (url, server) = respond_once("200 OK", &format!(r#"[{{"id":"{id}"}}]"#)).await;

        client(&url)
            .delete_comment(&session(), Id::new(id))
            .await
            .unwrap();
        assert!(server.await.unwrap().starts_with("delete /rest/v1/comments?"));
    }

    #[tokio::test]
    async fn refused_insert_is_a_service_error() {
        let (url, server) = respond_once(
            "403 Forbidden",
            r#"{"code":"42501","message":"new row violates row-level security policy","hint":null}"#,
        )
        .await;
        let session = session();
        let post = NewPost {
            user_id: session.user.id,
            content: PostContent::new("T", "B").unwrap(),
        };

        let result = client(&url).create_post(&session, &post).await;
        match result {
            Err(RemoteError::Service { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "new row violates row-level security policy");
            }
            other => panic!("unexpected result {other:?}"),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("post /rest/v1/posts "));
        assert!(request.contains("prefer: return=minimal"));
        assert!(request.contains(r#""title":"t""#));
    }

    #[tokio::test]
    async fn sign_up_awaiting_confirmation() {
        let id = Uuid::new_v4();
        let (url, server) = respond_once(
            "200 OK",
            &format!(r#"{{"id":"{id}","email":"x@other.com","aud":"authenticated"}}"#),
        )
        .await;

        let outcome = client(&url)
            .sign_up(&Credentials {
                email: "x@other.com".to_owned(),
                password: "hunter2".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, SignUpOutcome::ConfirmationRequired);

        let request = server.await.unwrap();
        assert!(request.starts_with("post /auth/v1/signup "));
        assert!(request.contains("authorization: bearer public-key"));
    }

    #[test]
    fn api_key_is_redacted() {
        let key = ApiKey::new("super-secret".to_owned());
        assert!(!format!("{key:?}").contains("super-secret"));
    }
}
