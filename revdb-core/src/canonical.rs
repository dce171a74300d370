//! Canonical encoding and revision digests
//!
//! Objects are `BTreeMap`s, so plain `serde_json` serialization already emits
//! sorted keys without whitespace. That output is the canonical form.

use crate::attachments::AttachmentInfo;
use crate::error::{Error, Result};
use crate::revision::RevisionId;
use crate::value::{Map, Value};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Number of SHA-256 bytes kept in a revision digest
const DIGEST_BYTES: usize = 16;

/// Encode a value into its canonical byte form.
pub fn as_canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    value.validate()?;
    serde_json::to_vec(value).map_err(|e| Error::validation(format!("Failed to encode value: {}", e)))
}

#[derive(Serialize)]
struct DigestInput<'a> {
    attachments: BTreeMap<&'a str, String>,
    deleted: bool,
    parent: Option<String>,
    properties: &'a Map,
}

/// Compute the digest half of a new revision id.
///
/// The digest covers the parent id, the deletion flag, the properties and
/// the attachment content digests, so identical edits made on two replicas
/// produce the same revision id.
pub fn revision_digest(
    parent: Option<&RevisionId>,
    deleted: bool,
    properties: &Map,
    attachments: &BTreeMap<String, AttachmentInfo>,
) -> Result<String> {
    properties.values().try_for_each(Value::validate)?;
    let input = DigestInput {
        attachments: attachments
            .iter()
            .map(|(name, info)| (name.as_str(), info.digest.to_hex()))
            .collect(),
        deleted,
        parent: parent.map(RevisionId::to_string),
        properties,
    };
    let bytes = serde_json::to_vec(&input)
        .map_err(|e| Error::validation(format!("Failed to encode revision: {}", e)))?;
    let hash = Sha256::digest(&bytes);
    Ok(hex::encode(&hash[..DIGEST_BYTES]))
}
