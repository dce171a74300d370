//! Revision identifiers and revisions
//!
//! A revision id is `<generation>-<digest>`. Ids order by generation first and
//! then by digest bytes, which is also the order used to pick a winner among
//! conflicting leaves.

use crate::attachments::AttachmentInfo;
use crate::error::{Error, Result};
use crate::value::Map;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Identifier of one revision of a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u32,
    digest: String,
}

impl RevisionId {
    /// Create a revision id from its parts
    pub fn new(generation: u32, digest: impl Into<String>) -> Result<Self> {
        let digest = digest.into();
        if generation == 0 {
            return Err(Error::validation("revision generation must be at least 1"));
        }
        if digest.is_empty() || digest.chars().any(|c| c.is_whitespace()) {
            return Err(Error::validation(format!("invalid revision digest '{}'", digest)));
        }
        Ok(Self { generation, digest })
    }

    /// Parse the textual `<generation>-<digest>` form
    pub fn parse(text: &str) -> Result<Self> {
        let (generation, digest) = text
            .split_once('-')
            .ok_or_else(|| Error::validation(format!("malformed revision id '{}'", text)))?;
        let generation = generation
            .parse::<u32>()
            .map_err(|_| Error::validation(format!("malformed revision id '{}'", text)))?;
        Self::new(generation, digest)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.as_bytes().cmp(other.digest.as_bytes()))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// One version of a document
///
/// Revisions returned by the database are immutable snapshots. `body` is
/// `None` for history stubs and for change-feed entries fetched without
/// bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub(crate) doc_id: String,
    pub(crate) rev_id: RevisionId,
    pub(crate) parent: Option<RevisionId>,
    pub(crate) deleted: bool,
    pub(crate) sequence: Option<u64>,
    pub(crate) body: Option<Arc<Map>>,
    pub(crate) attachments: Arc<BTreeMap<String, AttachmentInfo>>,
}

impl Revision {
    /// Build a revision to hand to [`crate::Database::force_insert`].
    pub fn new(doc_id: impl Into<String>, rev_id: RevisionId, deleted: bool, body: Map) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            parent: None,
            deleted,
            sequence: None,
            body: Some(Arc::new(body)),
            attachments: Arc::new(BTreeMap::new()),
        }
    }

    /// Attach attachment metadata; the blobs must already be installed.
    pub fn with_attachments(mut self, attachments: impl IntoIterator<Item = AttachmentInfo>) -> Self {
        self.attachments = Arc::new(
            attachments
                .into_iter()
                .map(|info| (info.name.clone(), info))
                .collect(),
        );
        self
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn rev_id(&self) -> &RevisionId {
        &self.rev_id
    }

    pub fn parent_rev_id(&self) -> Option<&RevisionId> {
        self.parent.as_ref()
    }

    pub fn generation(&self) -> u32 {
        self.rev_id.generation()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// The property body, if loaded
    pub fn body(&self) -> Option<&Map> {
        self.body.as_deref()
    }

    /// Attachment metadata, ordered by name
    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentInfo> {
        self.attachments.values()
    }

    pub fn attachment_names(&self) -> Vec<&str> {
        self.attachments.keys().map(String::as_str).collect()
    }

    pub fn attachment_info(&self, name: &str) -> Option<&AttachmentInfo> {
        self.attachments.get(name)
    }

    /// Copy of this revision without its body
    pub fn without_body(&self) -> Self {
        Self {
            body: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_id_roundtrip() {
        let id = RevisionId::parse("12-abcdef").unwrap();
        assert_eq!(id.generation(), 12);
        assert_eq!(id.digest(), "abcdef");
        assert_eq!(id.to_string(), "12-abcdef");
    }

    #[test]
    fn test_revision_id_rejects_malformed() {
        assert!(RevisionId::parse("abc").is_err());
        assert!(RevisionId::parse("0-abc").is_err());
        assert!(RevisionId::parse("x-abc").is_err());
        assert!(RevisionId::parse("3-").is_err());
        assert!(RevisionId::parse("3-a b").is_err());
    }

    #[test]
    fn test_revision_id_ordering() {
        let a = RevisionId::parse("1-ffff").unwrap();
        let b = RevisionId::parse("2-0000").unwrap();
        let c = RevisionId::parse("1-1111").unwrap();
        assert!(a < b);
        assert!(c < a);
        let mut ids = vec![b.clone(), a.clone(), c.clone()];
        ids.sort();
        assert_eq!(ids, vec![c, a, b]);
    }

    #[test]
    fn test_revision_id_serde_as_string() {
        let id = RevisionId::parse("3-beef").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"3-beef\"");
        let back: RevisionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
