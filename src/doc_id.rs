use serde::{Deserialize, Serialize};

/// An opaque document identifier, unique within a tenant namespace.
///
/// Document ids are chosen by whoever stores the document (file name, upload
/// name, ...) and stay stable across index rebuilds. The index never
/// interprets them.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for DocumentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_raw_id() {
        let id = DocumentId::new("notes/hello.md");
        assert_eq!(id.to_string(), "notes/hello.md");
        assert_eq!(id.as_str(), "notes/hello.md");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = DocumentId::from("a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"a\"");
        let back: DocumentId = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ordering_follows_string_order() {
        let mut ids = vec![
            DocumentId::from("c"),
            DocumentId::from("a"),
            DocumentId::from("b"),
        ];
        ids.sort();
        let raw: Vec<_> = ids.iter().map(DocumentId::as_str).collect();
        assert_eq!(raw, vec!["a", "b", "c"]);
    }
}
