use crate::{
    model::{
        Id,
        post::PostMarker,
        user::{User, UserMarker},
    },
    util::char_len,
};
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use thiserror::Error;
use time::OffsetDateTime;

pub const COMMENT_CONTENT_MAX_LEN: usize = 1000;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct CommentMarker;

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct Comment {
    pub id: Id<CommentMarker>,
    pub post_id: Id<PostMarker>,
    pub author: User,
    pub content: CommentContent,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct CreateComment {
    pub post_id: Id<PostMarker>,
    pub author: Id<UserMarker>,
    pub content: CommentContent,
}

/// Non-blank comment text.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Serialize)]
#[serde(transparent)]
pub struct CommentContent(String);

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error(
    "Comments must contain between 1 and {} characters",
    COMMENT_CONTENT_MAX_LEN
)]
pub struct InvalidCommentContentError;

impl CommentContent {
    pub fn new(content: String) -> Result<Self, InvalidCommentContentError> {
        if !content.trim().is_empty() && char_len(&content) <= COMMENT_CONTENT_MAX_LEN {
            Ok(Self(content))
        } else {
            Err(InvalidCommentContentError)
        }
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for CommentContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        CommentContent::new(inner).map_err(Error::custom)
    }
}
