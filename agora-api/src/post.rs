use uuid::Uuid;

use crate::{Author, Error, Time};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct PostId(pub Uuid);

impl PostId {
    pub fn parse(s: &str) -> Result<PostId, Error> {
        crate::parse_id(s).map(PostId)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub author: Author,
    pub title: String,
    pub content: String,

    /// Free-form category label, any value is accepted
    #[serde(rename = "type")]
    pub category: String,

    /// Attachment, either inline base64 data or a URL
    pub file: Option<String>,

    pub votes: i64,
    pub created_at: Time,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewPost {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub category: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl NewPost {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_field("title", &self.title)?;
        crate::validate_field("content", &self.content)?;
        crate::validate_field("type", &self.category)?;
        if let Some(file) = &self.file {
            if file.contains('\0') {
                return Err(Error::NullByteInString(file.clone()));
            }
        }
        Ok(())
    }

    /// An empty attachment is the same as no attachment
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref().filter(|f| !f.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_are_reported_in_order() {
        let p: NewPost = serde_json::from_str(r#"{"content": "c", "type": "news"}"#).unwrap();
        assert_eq!(p.validate(), Err(Error::MissingField(String::from("title"))));

        let p: NewPost = serde_json::from_str(r#"{"title": "t", "content": "c"}"#).unwrap();
        assert_eq!(p.validate(), Err(Error::MissingField(String::from("type"))));

        let p: NewPost =
            serde_json::from_str(r#"{"title": "t", "content": "c", "type": "news"}"#).unwrap();
        assert_eq!(p.validate(), Ok(()));
        assert_eq!(p.file(), None);
    }

    #[test]
    fn empty_file_is_no_file() {
        let p: NewPost = serde_json::from_str(
            r#"{"title": "t", "content": "c", "type": "news", "file": ""}"#,
        )
        .unwrap();
        assert_eq!(p.file(), None);
    }
}
