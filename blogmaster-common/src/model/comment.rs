use crate::{
    cache::Record,
    model::{Id, post::PostId, user::UserMarker},
    util::trimmed_non_empty,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct CommentMarker;

pub type CommentId = Id<CommentMarker>;

/// Projection of a `comments` row.
pub const COMMENT_COLUMNS: &str = "id,post_id,user_id,content,created_at";

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub user_id: Id<UserMarker>,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Record for Comment {
    type Marker = CommentMarker;

    fn id(&self) -> CommentId {
        self.id
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("The comment is empty")]
pub struct InvalidCommentContentError;

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
#[serde(transparent)]
pub struct CommentContent(String);

impl CommentContent {
    pub fn new(content: &str) -> Result<Self, InvalidCommentContentError> {
        trimmed_non_empty(content)
            .map(Self)
            .ok_or(InvalidCommentContentError)
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct NewComment {
    pub post_id: PostId,
    pub user_id: Id<UserMarker>,
    pub content: CommentContent,
}

#[cfg(test)]
mod tests {
    use crate::model::{
        Id,
        comment::{CommentContent, InvalidCommentContentError, NewComment},
    };
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn blank_comments_are_rejected() {
        assert_eq!(CommentContent::new(" \n "), Err(InvalidCommentContentError));
        assert_eq!(CommentContent::new(" sympa ").unwrap().get(), "sympa");
    }

    #[test]
    fn new_comment_serializes_as_row() {
        let post = Uuid::new_v4();
        let user = Uuid::new_v4();
        let new_comment = NewComment {
            post_id: Id::new(post),
            user_id: Id::new(user),
            content: CommentContent::new("Super").unwrap(),
        };

        assert_eq!(
            serde_json::to_value(&new_comment).unwrap(),
            json!({
                "post_id": post.to_string(),
                "user_id": user.to_string(),
                "content": "Super",
            })
        );
    }
}
