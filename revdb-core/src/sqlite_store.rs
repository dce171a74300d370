//! SQLite-backed revision store
//!
//! Revisions live in one table keyed by `(doc_id, rev_id)`. Bodies are the
//! canonical JSON encoding, zstd-compressed once they reach the configured
//! threshold. Tombstone markers for pruned ids and database metadata
//! (last sequence, max tree depth, identity) have their own tables. The
//! connection runs in WAL mode.

use crate::attachments::AttachmentInfo;
use crate::rev_tree::RevNode;
use crate::revision::RevisionId;
use crate::storage::{Result, RevisionStore, StorageError, StoredRevision, StoredState, WriteBatch};
use crate::value::Map;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const ENCODING_JSON: i64 = 0;
const ENCODING_ZSTD: i64 = 1;
const ZSTD_LEVEL: i32 = 3;

const KEY_LAST_SEQUENCE: &str = "last_sequence";
const KEY_MAX_DEPTH: &str = "max_rev_tree_depth";
const KEY_UUID: &str = "uuid";
const KEY_CREATED_AT: &str = "created_at";

fn open_revision_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| StorageError::Database(format!("Failed to open SQLite database at {:?}: {}", path, e)))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS revs (
            doc_id TEXT NOT NULL,
            rev_id TEXT NOT NULL,
            parent TEXT,
            deleted INTEGER NOT NULL,
            sequence INTEGER,
            encoding INTEGER NOT NULL,
            body BLOB,
            attachments TEXT,
            PRIMARY KEY (doc_id, rev_id)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS revs_by_sequence ON revs(sequence);
        CREATE TABLE IF NOT EXISTS pruned (
            doc_id TEXT NOT NULL,
            rev_id TEXT NOT NULL,
            PRIMARY KEY (doc_id, rev_id)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID;",
    )?;
    Ok(conn)
}

fn parse_rev_id(text: &str) -> Result<RevisionId> {
    RevisionId::parse(text).map_err(|e| StorageError::Corrupt(format!("bad revision id '{}': {}", text, e)))
}

/// Raw `revs` row before decoding
struct RevRow {
    doc_id: String,
    rev_id: String,
    parent: Option<String>,
    deleted: bool,
    sequence: Option<i64>,
    encoding: i64,
    body: Option<Vec<u8>>,
    attachments: Option<String>,
}

pub struct SqliteRevisionStore {
    conn: Connection,
    compress_threshold: usize,
}

impl SqliteRevisionStore {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>, compress_threshold: usize) -> Result<Self> {
        let conn = open_revision_db(path.as_ref())?;
        Ok(Self {
            conn,
            compress_threshold,
        })
    }

    fn encode_body(&self, body: &Map) -> Result<(i64, Vec<u8>)> {
        let json = serde_json::to_vec(body)?;
        if json.len() >= self.compress_threshold {
            let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
                .map_err(|e| StorageError::Compression(e.to_string()))?;
            Ok((ENCODING_ZSTD, compressed))
        } else {
            Ok((ENCODING_JSON, json))
        }
    }

    fn decode_body(encoding: i64, data: &[u8]) -> Result<Map> {
        match encoding {
            ENCODING_JSON => Ok(serde_json::from_slice(data)?),
            ENCODING_ZSTD => {
                let json = zstd::decode_all(data).map_err(|e| StorageError::Compression(e.to_string()))?;
                Ok(serde_json::from_slice(&json)?)
            }
            other => Err(StorageError::Corrupt(format!("unknown body encoding {}", other))),
        }
    }

    fn decode_row(row: RevRow) -> Result<StoredRevision> {
        let body = match row.body {
            Some(data) => Some(Arc::new(Self::decode_body(row.encoding, &data)?)),
            None => None,
        };
        let attachments: BTreeMap<String, AttachmentInfo> = match row.attachments {
            Some(text) => serde_json::from_str::<Vec<AttachmentInfo>>(&text)?
                .into_iter()
                .map(|info| (info.name.clone(), info))
                .collect(),
            None => BTreeMap::new(),
        };
        Ok(StoredRevision {
            doc_id: row.doc_id,
            node: RevNode {
                rev_id: parse_rev_id(&row.rev_id)?,
                parent: row.parent.as_deref().map(parse_rev_id).transpose()?,
                deleted: row.deleted,
                sequence: row.sequence.map(|s| s as u64),
                body,
                attachments: Arc::new(attachments),
            },
        })
    }

    fn info_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM info WHERE key=?1", params![key], |row| row.get(0))
            .optional()?)
    }
}

impl RevisionStore for SqliteRevisionStore {
    fn load(&mut self) -> Result<StoredState> {
        let rows: Vec<RevRow> = {
            let mut stmt = self.conn.prepare(
                "SELECT doc_id, rev_id, parent, deleted, sequence, encoding, body, attachments \
                 FROM revs ORDER BY doc_id, rev_id",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok(RevRow {
                    doc_id: row.get(0)?,
                    rev_id: row.get(1)?,
                    parent: row.get(2)?,
                    deleted: row.get::<_, i64>(3)? != 0,
                    sequence: row.get(4)?,
                    encoding: row.get(5)?,
                    body: row.get(6)?,
                    attachments: row.get(7)?,
                })
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };
        let revisions = rows
            .into_iter()
            .map(Self::decode_row)
            .collect::<Result<Vec<_>>>()?;

        let pruned_rows: Vec<(String, String)> = {
            let mut stmt = self.conn.prepare("SELECT doc_id, rev_id FROM pruned ORDER BY doc_id, rev_id")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<rusqlite::Result<_>>()?
        };
        let pruned = pruned_rows
            .into_iter()
            .map(|(doc_id, rev_id)| Ok((doc_id, parse_rev_id(&rev_id)?)))
            .collect::<Result<Vec<_>>>()?;

        let last_sequence = match self.info_value(KEY_LAST_SEQUENCE)? {
            Some(text) => text
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("bad last_sequence '{}'", text)))?,
            None => 0,
        };
        let max_rev_tree_depth = match self.info_value(KEY_MAX_DEPTH)? {
            Some(text) => Some(
                text.parse()
                    .map_err(|_| StorageError::Corrupt(format!("bad max_rev_tree_depth '{}'", text)))?,
            ),
            None => None,
        };

        Ok(StoredState {
            revisions,
            pruned,
            last_sequence,
            max_rev_tree_depth,
            uuid: self.info_value(KEY_UUID)?,
            created_at: self.info_value(KEY_CREATED_AT)?,
        })
    }

    fn commit(&mut self, batch: &WriteBatch) -> Result<()> {
        let mut encoded = Vec::with_capacity(batch.revisions.len());
        for row in &batch.revisions {
            let body = match &row.node.body {
                Some(body) => Some(self.encode_body(body)?),
                None => None,
            };
            let attachments = if row.node.attachments.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&row.node.attachments.values().collect::<Vec<_>>())?)
            };
            encoded.push((row, body, attachments));
        }

        let tx = self.conn.transaction()?;
        {
            let mut insert_rev = tx.prepare_cached(
                "INSERT OR REPLACE INTO revs (doc_id, rev_id, parent, deleted, sequence, encoding, body, attachments) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (row, body, attachments) in &encoded {
                let (encoding, body) = match body {
                    Some((encoding, data)) => (*encoding, Some(data.as_slice())),
                    None => (ENCODING_JSON, None),
                };
                insert_rev.execute(params![
                    row.doc_id,
                    row.node.rev_id.to_string(),
                    row.node.parent.as_ref().map(|p| p.to_string()),
                    row.node.deleted as i64,
                    row.node.sequence.map(|s| s as i64),
                    encoding,
                    body,
                    attachments,
                ])?;
            }

            let mut delete_rev = tx.prepare_cached("DELETE FROM revs WHERE doc_id=?1 AND rev_id=?2")?;
            let mut insert_pruned =
                tx.prepare_cached("INSERT OR IGNORE INTO pruned (doc_id, rev_id) VALUES (?1, ?2)")?;
            for (doc_id, rev_id) in &batch.pruned {
                let rev_id = rev_id.to_string();
                delete_rev.execute(params![doc_id, rev_id])?;
                insert_pruned.execute(params![doc_id, rev_id])?;
            }

            let mut set_info = tx.prepare_cached(
                "INSERT INTO info (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            )?;
            if let Some(seq) = batch.last_sequence {
                set_info.execute(params![KEY_LAST_SEQUENCE, seq.to_string()])?;
            }
            if let Some(depth) = batch.max_rev_tree_depth {
                set_info.execute(params![KEY_MAX_DEPTH, depth.to_string()])?;
            }
            if let Some(identity) = &batch.identity {
                set_info.execute(params![KEY_UUID, identity.uuid])?;
                set_info.execute(params![KEY_CREATED_AT, identity.created_at])?;
            }
        }
        tx.commit()?;
        tracing::debug!(
            "Committed {} revisions, {} pruned ids",
            batch.revisions.len(),
            batch.pruned.len()
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::BlobKey;
    use crate::storage::Identity;
    use crate::value::Value;
    use tempfile::TempDir;

    fn rid(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    fn full_node(id: &str, parent: Option<&str>, seq: u64, body: Map) -> RevNode {
        RevNode {
            rev_id: rid(id),
            parent: parent.map(rid),
            deleted: false,
            sequence: Some(seq),
            body: Some(Arc::new(body)),
            attachments: Arc::new(BTreeMap::new()),
        }
    }

    #[test]
    fn test_roundtrip_revisions_and_info() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("revisions.sqlite");
        {
            let mut store = SqliteRevisionStore::open(&path, 64 * 1024).unwrap();
            let mut body = Map::new();
            body.insert("title".into(), Value::from("hello"));
            let mut with_attachment = full_node("2-bb", Some("1-aa"), 2, body.clone());
            let info = AttachmentInfo {
                name: "a.bin".into(),
                content_type: "application/octet-stream".into(),
                digest: BlobKey::from_data(b"abc"),
                length: 3,
                revpos: 2,
            };
            with_attachment.attachments = Arc::new(BTreeMap::from([(info.name.clone(), info)]));

            let batch = WriteBatch {
                revisions: vec![
                    StoredRevision {
                        doc_id: "doc".into(),
                        node: RevNode::stub(rid("1-aa"), None),
                    },
                    StoredRevision {
                        doc_id: "doc".into(),
                        node: with_attachment,
                    },
                ],
                pruned: vec![("doc".into(), rid("1-00"))],
                last_sequence: Some(2),
                max_rev_tree_depth: Some(5),
                identity: Some(Identity {
                    uuid: "u-1".into(),
                    created_at: "2024-01-01T00:00:00Z".into(),
                }),
            };
            store.commit(&batch).unwrap();
            store.close().unwrap();
        }

        let mut store = SqliteRevisionStore::open(&path, 64 * 1024).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.revisions.len(), 2);
        let stub = &state.revisions[0].node;
        assert!(stub.is_stub());
        assert_eq!(stub.sequence, None);
        let head = &state.revisions[1].node;
        assert_eq!(head.parent, Some(rid("1-aa")));
        assert_eq!(head.body.as_ref().unwrap()["title"].as_str(), Some("hello"));
        assert_eq!(head.attachments["a.bin"].length, 3);
        assert_eq!(state.pruned, vec![("doc".to_string(), rid("1-00"))]);
        assert_eq!(state.last_sequence, 2);
        assert_eq!(state.max_rev_tree_depth, Some(5));
        assert_eq!(state.uuid.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_large_body_is_compressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("revisions.sqlite");
        let mut store = SqliteRevisionStore::open(&path, 1024).unwrap();
        let mut body = Map::new();
        body.insert("blob".into(), Value::from("x".repeat(100_000)));
        store
            .commit(&WriteBatch {
                revisions: vec![StoredRevision {
                    doc_id: "big".into(),
                    node: full_node("1-aa", None, 1, body.clone()),
                }],
                last_sequence: Some(1),
                ..WriteBatch::default()
            })
            .unwrap();

        let (encoding, size): (i64, i64) = store
            .conn
            .query_row("SELECT encoding, length(body) FROM revs WHERE doc_id='big'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(encoding, ENCODING_ZSTD);
        assert!(size < 100_000);

        let state = store.load().unwrap();
        assert_eq!(state.revisions[0].node.body.as_deref(), Some(&body));
    }

    #[test]
    fn test_pruning_removes_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteRevisionStore::open(dir.path().join("r.sqlite"), 1024).unwrap();
        store
            .commit(&WriteBatch {
                revisions: vec![StoredRevision {
                    doc_id: "d".into(),
                    node: full_node("1-aa", None, 1, Map::new()),
                }],
                ..WriteBatch::default()
            })
            .unwrap();
        store
            .commit(&WriteBatch {
                pruned: vec![("d".into(), rid("1-aa"))],
                ..WriteBatch::default()
            })
            .unwrap();
        let state = store.load().unwrap();
        assert!(state.revisions.is_empty());
        assert_eq!(state.pruned.len(), 1);
    }
}
