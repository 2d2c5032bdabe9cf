use crate::model::{Id, post::PostMarker, user::UserMarker};
use serde::{Deserialize, Serialize};

/// Outcome of toggling a like.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize, Deserialize)]
pub struct LikeState {
    pub post_id: Id<PostMarker>,
    pub user_id: Id<UserMarker>,
    pub liked: bool,
    pub like_count: u64,
}
