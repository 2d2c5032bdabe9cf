use crate::{
    model::{
        Id,
        comment::Comment,
        user::{User, UserMarker},
    },
    util::char_len,
};
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use thiserror::Error;
use time::OffsetDateTime;

pub const POST_CONTENT_MAX_LEN: usize = 2000;
pub const DEFAULT_IMAGE_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct PostMarker;

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct Post {
    pub id: Id<PostMarker>,
    pub author: User,
    pub content: PostContent,
    pub has_image: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A post as it appears in the feed and on profiles.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct FeedPost {
    #[serde(flatten)]
    pub post: Post,
    pub like_count: u64,
    pub comments: Vec<Comment>,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct CreatePost {
    pub author: Id<UserMarker>,
    pub content: PostContent,
    pub image: Option<PostImage>,
}

#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PostImage {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for PostImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostImage")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Text body of a post. May be empty when the post carries an image.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Serialize)]
#[serde(transparent)]
pub struct PostContent(String);

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("Post content is longer than {} characters", POST_CONTENT_MAX_LEN)]
pub struct InvalidPostContentError(usize);

impl PostContent {
    pub fn new(content: String) -> Result<Self, InvalidPostContentError> {
        let len = char_len(&content);
        if len <= POST_CONTENT_MAX_LEN {
            Ok(Self(content))
        } else {
            Err(InvalidPostContentError(len))
        }
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl<'de> Deserialize<'de> for PostContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        PostContent::new(inner).map_err(|err| {
            Error::invalid_length(err.0, &"at most 2000 characters of post content")
        })
    }
}

impl PostImage {
    #[must_use]
    pub fn new(content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.unwrap_or_else(|| DEFAULT_IMAGE_CONTENT_TYPE.to_owned()),
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::model::post::{
        DEFAULT_IMAGE_CONTENT_TYPE, POST_CONTENT_MAX_LEN, PostContent, PostImage,
    };

    #[test]
    fn content_length_limit() {
        assert!(PostContent::new("x".repeat(POST_CONTENT_MAX_LEN)).is_ok());
        assert!(PostContent::new("x".repeat(POST_CONTENT_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn blank_content() {
        assert!(PostContent::new("  \n".to_owned()).unwrap().is_blank());
        assert!(!PostContent::new("hello world".to_owned()).unwrap().is_blank());
    }

    #[test]
    fn image_content_type_defaults() {
        let image = PostImage::new(None, vec![1, 2, 3]);
        assert_eq!(image.content_type, DEFAULT_IMAGE_CONTENT_TYPE);
        assert!(format!("{image:?}").contains("len: 3"));
    }
}
