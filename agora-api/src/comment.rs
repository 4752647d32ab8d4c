use uuid::Uuid;

use crate::{Author, Error, PostId, Time};

/// Number of comments returned when the client does not ask for all of them
pub const COMMENT_PREVIEW_LEN: usize = 3;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn parse(s: &str) -> Result<CommentId, Error> {
        crate::parse_id(s).map(CommentId)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub author: Author,
    pub content: String,
    pub votes: i64,
    pub created_at: Time,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    #[serde(default)]
    pub content: String,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_field("content", &self.content)
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct CommentsQuery {
    pub all: Option<String>,
}

impl CommentsQuery {
    /// Only the literal `true` lifts the preview limit
    pub fn limit(&self) -> Option<usize> {
        match self.all.as_deref() {
            Some("true") => None,
            _ => Some(COMMENT_PREVIEW_LEN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_limit() {
        let q = |all: Option<&str>| CommentsQuery {
            all: all.map(String::from),
        };
        assert_eq!(q(None).limit(), Some(COMMENT_PREVIEW_LEN));
        assert_eq!(q(Some("true")).limit(), None);
        assert_eq!(q(Some("false")).limit(), Some(COMMENT_PREVIEW_LEN));
        assert_eq!(q(Some("1")).limit(), Some(COMMENT_PREVIEW_LEN));
    }
}
