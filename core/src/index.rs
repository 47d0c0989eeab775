use serde::{Deserialize, Serialize};

pub type DocId = u64;

/// A document as produced by the document source: already tokenized and
/// normalized, consumed exactly once by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocId,
    /// Display name, e.g. the comment id as it appears in the archive.
    pub name: String,
    pub tokens: Vec<String>,
    /// Original text. Only persisted when the index is built with full text.
    pub raw_text: Option<String>,
}

impl Document {
    pub fn new(id: DocId, tokens: Vec<String>) -> Self {
        Self { id, name: id.to_string(), tokens, raw_text: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.raw_text = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    pub name: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub term_frequency: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermStats {
    pub document_frequency: u32,
    pub collection_frequency: u64,
}

/// Persisted value for one surviving term. Postings are sorted by doc_id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    pub stats: TermStats,
    pub postings: Vec<Posting>,
}

/// Decodes a reddit-style base-36 comment id ("c0ffee") into a numeric id.
pub fn parse_base36(name: &str) -> Option<DocId> {
    let trimmed = name.strip_prefix("t1_").unwrap_or(name);
    if trimmed.is_empty() {
        return None;
    }
    u64::from_str_radix(&trimmed.to_ascii_lowercase(), 36).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_ids() {
        assert_eq!(parse_base36("z"), Some(35));
        assert_eq!(parse_base36("10"), Some(36));
        assert_eq!(parse_base36("t1_10"), Some(36));
        assert_eq!(parse_base36("C0"), parse_base36("c0"));
        assert_eq!(parse_base36(""), None);
        assert_eq!(parse_base36("no-dash"), None);
    }
}
