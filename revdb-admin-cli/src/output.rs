//! JSON rendering of revisions and change feeds

use revdb_core::{Revision, Value};
use serde_json::{json, Map as JsonMap};

/// A revision as a JSON object with its metadata under `_`-prefixed keys.
pub fn revision_json(revision: &Revision) -> serde_json::Value {
    let mut out = JsonMap::new();
    out.insert("_id".into(), json!(revision.doc_id()));
    out.insert("_rev".into(), json!(revision.rev_id().to_string()));
    if revision.is_deleted() {
        out.insert("_deleted".into(), json!(true));
    }
    if let Some(sequence) = revision.sequence() {
        out.insert("_seq".into(), json!(sequence));
    }
    if let Some(body) = revision.body() {
        for (key, value) in body {
            out.insert(key.clone(), Value::to_json(value));
        }
    }
    let attachments: JsonMap<String, serde_json::Value> = revision
        .attachments()
        .map(|info| {
            (
                info.name.clone(),
                json!({
                    "content_type": info.content_type,
                    "digest": info.digest.to_string(),
                    "length": info.length,
                    "revpos": info.revpos,
                }),
            )
        })
        .collect();
    if !attachments.is_empty() {
        out.insert("_attachments".into(), serde_json::Value::Object(attachments));
    }
    serde_json::Value::Object(out)
}

/// One line of the change feed
pub fn change_line(revision: &Revision) -> String {
    let mut line = format!(
        "{:>8}  {}  {}",
        revision.sequence().unwrap_or_default(),
        revision.doc_id(),
        revision.rev_id()
    );
    if revision.is_deleted() {
        line.push_str("  (deleted)");
    }
    line
}
