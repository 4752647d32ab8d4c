use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::{CommentId, PostId, VoteDirection};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Post not found {0:?}")]
    PostNotFound(PostId),

    #[error("Comment not found {0:?}")]
    CommentNotFound(CommentId),

    #[error("Already voted {0:?}")]
    DuplicateVote(VoteDirection),

    #[error("Name already used {0}")]
    NameAlreadyUsed(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Invalid id {0:?}")]
    InvalidId(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Missing field {0}")]
    MissingField(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::PostNotFound(_) => StatusCode::NOT_FOUND,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateVote(_) => StatusCode::BAD_REQUEST,
            Error::NameAlreadyUsed(_) => StatusCode::BAD_REQUEST,
            Error::InvalidCredentials => StatusCode::BAD_REQUEST,
            Error::InvalidId(_) => StatusCode::BAD_REQUEST,
            Error::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Error::MissingField(_) => StatusCode::BAD_REQUEST,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "error": msg,
                "type": "unknown",
            }),
            Error::Unauthorized => json!({
                "error": "missing or invalid token",
                "type": "unauthorized",
            }),
            Error::PostNotFound(id) => json!({
                "error": "post not found",
                "type": "post-not-found",
                "id": id.0,
            }),
            Error::CommentNotFound(id) => json!({
                "error": "comment not found",
                "type": "comment-not-found",
                "id": id.0,
            }),
            Error::DuplicateVote(d) => json!({
                "error": "you already voted this way",
                "type": "duplicate-vote",
                "direction": d,
            }),
            Error::NameAlreadyUsed(n) => json!({
                "error": "user already exists",
                "type": "conflict-name",
                "name": n,
            }),
            Error::InvalidCredentials => json!({
                "error": "invalid username or password",
                "type": "invalid-credentials",
            }),
            Error::InvalidId(id) => json!({
                "error": "invalid id",
                "type": "invalid-id",
                "id": id,
            }),
            Error::InvalidBody(msg) => json!({
                "error": msg,
                "type": "invalid-body",
            }),
            Error::MissingField(f) => json!({
                "error": format!("missing field {f}"),
                "type": "missing-field",
                "field": f,
            }),
            Error::NullByteInString(s) => json!({
                "error": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
        })
        .expect("serializing error")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let field = |name: &str| -> anyhow::Result<String> {
            data.get(name)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error is missing its {name} field"))
        };
        let id = || -> anyhow::Result<Uuid> {
            Uuid::from_str(&field("id")?).context("parsing id field of error")
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(field("error").unwrap_or_default()),
                "unauthorized" => Error::Unauthorized,
                "post-not-found" => Error::PostNotFound(PostId(id()?)),
                "comment-not-found" => Error::CommentNotFound(CommentId(id()?)),
                "duplicate-vote" => Error::DuplicateVote(
                    data.get("direction")
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()
                        .context("parsing direction of duplicate vote")?
                        .ok_or_else(|| anyhow!("error is a duplicate vote without direction"))?,
                ),
                "conflict-name" => Error::NameAlreadyUsed(field("name")?),
                "invalid-credentials" => Error::InvalidCredentials,
                "invalid-id" => Error::InvalidId(field("id")?),
                "invalid-body" => Error::InvalidBody(field("error")?),
                "missing-field" => Error::MissingField(field("field")?),
                "null-byte" => Error::NullByteInString(field("string")?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_error_message() {
        let body: serde_json::Value =
            serde_json::from_slice(&Error::DuplicateVote(VoteDirection::Up).contents()).unwrap();
        assert_eq!(body["error"], "you already voted this way");
        assert_eq!(body["direction"], "up");
    }

    #[test]
    fn parse_recovers_typed_errors() {
        let post = PostId(Uuid::new_v4());
        for err in [
            Error::Unauthorized,
            Error::PostNotFound(post),
            Error::DuplicateVote(VoteDirection::Down),
            Error::MissingField(String::from("content")),
        ] {
            assert_eq!(Error::parse(&err.contents()).unwrap(), err);
        }
        assert!(Error::parse(br#"{"type": "nope"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
    }

    #[test]
    fn status_codes() {
        use http::StatusCode;
        assert_eq!(Error::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::CommentNotFound(CommentId(Uuid::new_v4())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::DuplicateVote(VoteDirection::Up).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Unknown(String::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
