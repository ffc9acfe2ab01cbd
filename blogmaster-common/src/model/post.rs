use crate::{
    cache::Record,
    model::{Id, user::UserMarker},
    util::trimmed_non_empty,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct PostMarker;

pub type PostId = Id<PostMarker>;

/// Projection of a `posts` row.
pub const POST_COLUMNS: &str = "id,user_id,title,content,created_at";

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct Post {
    pub id: PostId,
    pub user_id: Id<UserMarker>,
    pub title: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Record for Post {
    type Marker = PostMarker;

    fn id(&self) -> PostId {
        self.id
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Error)]
pub enum InvalidPostContentError {
    #[error("The post title is empty")]
    EmptyTitle,
    #[error("The post content is empty")]
    EmptyContent,
}

/// Title and body of a post, both trimmed and non-empty.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct PostContent {
    title: String,
    content: String,
}

impl PostContent {
    pub fn new(title: &str, content: &str) -> Result<Self, InvalidPostContentError> {
        let title = trimmed_non_empty(title).ok_or(InvalidPostContentError::EmptyTitle)?;
        let content = trimmed_non_empty(content).ok_or(InvalidPostContentError::EmptyContent)?;

        Ok(Self { title, content })
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct NewPost {
    pub user_id: Id<UserMarker>,
    #[serde(flatten)]
    pub content: PostContent,
}
