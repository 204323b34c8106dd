use serde::Deserialize;

/// Tag kind code the service uses for copyright tags.
pub(crate) const TAG_KIND_COPYRIGHT: i64 = 3;

/// Tag kind code the service uses for character tags.
pub(crate) const TAG_KIND_CHARACTER: i64 = 4;

/// Content sensitivity bucket of a post, used purely for folder layout.
/// Anything unrecognized is treated as general.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub(crate) enum Rating {
    General,
    Sensitive,
    Questionable,
    Explicit,
}

impl Default for Rating {
    fn default() -> Self {
        Rating::General
    }
}

impl From<String> for Rating {
    fn from(rating: String) -> Self {
        match rating.as_str() {
            "sensitive" => Rating::Sensitive,
            "questionable" => Rating::Questionable,
            "explicit" => Rating::Explicit,
            _ => Rating::General,
        }
    }
}

impl Rating {
    /// Folder name the rating maps to.
    pub(crate) fn as_folder(&self) -> &'static str {
        match self {
            Rating::General => "General",
            Rating::Sensitive => "Sensitive",
            Rating::Questionable => "Questionable",
            Rating::Explicit => "Explicit",
        }
    }
}

/// A single post record from the post-detail endpoint. Immutable once fetched.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PostEntry {
    /// Post identifier.
    pub(crate) id: i64,
    /// URL of the full-size file.
    #[serde(default)]
    pub(crate) file_url: String,
    /// Raw whitespace-delimited tag string.
    #[serde(default)]
    pub(crate) tags: String,
    /// Sensitivity rating, defaulting to general when absent.
    #[serde(default)]
    pub(crate) rating: Rating,
}

impl PostEntry {
    /// The final path segment of the file URL, used as the local file name.
    pub(crate) fn file_name(&self) -> Option<&str> {
        self.file_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }
}

/// The post-detail endpoint wraps its payload in a `post` key that may hold a
/// single record, a list, or nothing at all for deleted posts.
#[derive(Debug, Deserialize)]
pub(crate) struct PostResponse {
    #[serde(default)]
    post: Option<PostPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostPayload {
    Many(Vec<PostEntry>),
    One(Box<PostEntry>),
}

impl PostResponse {
    /// Unwraps the payload into its first record, if any.
    pub(crate) fn into_entry(self) -> Option<PostEntry> {
        match self.post? {
            PostPayload::Many(entries) => entries.into_iter().next(),
            PostPayload::One(entry) => Some(*entry),
        }
    }
}

/// A single tag record from the tag-detail endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TagEntry {
    /// Resolved display name of the tag.
    pub(crate) name: String,
    /// Integer tag kind code (4 = character, 3 = copyright).
    #[serde(rename = "type")]
    pub(crate) kind: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagResponse {
    #[serde(default)]
    tag: Option<Vec<TagEntry>>,
}

impl TagResponse {
    pub(crate) fn into_entry(self) -> Option<TagEntry> {
        self.tag?.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_payload_accepts_single_and_list_forms() {
        let single: PostResponse = serde_json::from_str(
            r#"{"post": {"id": 1, "file_url": "https://img.example/a.png", "tags": "solo", "rating": "explicit"}}"#,
        )
        .unwrap();
        let entry = single.into_entry().unwrap();
        assert_eq!(entry.id, 1);
        assert_eq!(entry.rating, Rating::Explicit);

        let list: PostResponse = serde_json::from_str(
            r#"{"post": [{"id": 2, "file_url": "https://img.example/b.png", "tags": ""}]}"#,
        )
        .unwrap();
        assert_eq!(list.into_entry().unwrap().id, 2);
    }

    #[test]
    fn absent_post_payload_is_none() {
        let response: PostResponse = serde_json::from_str(r#"{"@attributes": {}}"#).unwrap();
        assert!(response.into_entry().is_none());
    }

    #[test]
    fn unknown_rating_falls_back_to_general() {
        let response: PostResponse = serde_json::from_str(
            r#"{"post": {"id": 3, "file_url": "u", "tags": "", "rating": "something_new"}}"#,
        )
        .unwrap();
        assert_eq!(response.into_entry().unwrap().rating, Rating::General);
    }

    #[test]
    fn file_name_is_last_url_segment() {
        let entry = PostEntry {
            id: 9,
            file_url: String::from("https://img.example/images/ab/cd/abcd1234.jpg"),
            tags: String::new(),
            rating: Rating::General,
        };
        assert_eq!(entry.file_name(), Some("abcd1234.jpg"));

        let no_url = PostEntry {
            id: 10,
            file_url: String::new(),
            tags: String::new(),
            rating: Rating::General,
        };
        assert!(no_url.file_name().is_none());
    }

    #[test]
    fn tag_kind_is_read_from_type_field() {
        let response: TagResponse =
            serde_json::from_str(r#"{"tag": [{"name": "some_character", "type": 4}]}"#).unwrap();
        let entry = response.into_entry().unwrap();
        assert_eq!(entry.kind, TAG_KIND_CHARACTER);
        assert_eq!(entry.name, "some_character");
    }
}
