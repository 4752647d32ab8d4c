use chrono::Utc;

pub use uuid::Uuid;
pub type Time = chrono::DateTime<Utc>;

mod auth;
pub use auth::{AuthResponse, Credentials, BCRYPT_COST};

mod comment;
pub use comment::{Comment, CommentId, CommentsQuery, NewComment, COMMENT_PREVIEW_LEN};

mod db;
pub use db::Db;

mod error;
pub use error::Error;

mod post;
pub use post::{NewPost, Post, PostId};

pub mod ranking;
pub use ranking::{CategoryRanking, UserRanking};

mod user;
pub use user::{Author, UserId};

pub mod vote;
pub use vote::{VoteDirection, VoteRequest, VoteResponse, VoteTarget, Votes};

/// Presence check shared by all request bodies: the field must be non-blank
/// and must not carry null bytes, which postgres refuses in text columns.
pub fn validate_field(name: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::MissingField(String::from(name)));
    }
    if value.contains('\0') {
        return Err(Error::NullByteInString(String::from(value)));
    }
    Ok(())
}

fn parse_id(s: &str) -> Result<Uuid, Error> {
    Uuid::try_parse(s).map_err(|_| Error::InvalidId(String::from(s)))
}
