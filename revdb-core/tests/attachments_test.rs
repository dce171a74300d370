//! Attachment behavior across in-memory, on-disk and encrypted databases

use revdb_core::storage::Result as StorageResult;
use revdb_core::{
    AttachmentInfo, BlobCipher, BlobKey, BlobStore, Database, DatabaseConfig, DiskBlobStore, Error, Map, Revision,
    RevisionId,
};
use serde_json::json;
use std::io::Read;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const HTML: &[u8] = b"<html>And this is an attachment.</html>";

struct XorCipher(u8);

impl BlobCipher for XorCipher {
    fn encrypt(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(plaintext.iter().map(|b| b ^ self.0).collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(ciphertext.iter().map(|b| b ^ self.0).collect())
    }
}

fn props(value: serde_json::Value) -> Map {
    revdb_core::map_from_json(value).unwrap()
}

/// Runs the attachment lifecycle and returns the saved revision.
fn exercise_attachments(db: &Database) -> Revision {
    let doc = db.document("attach").unwrap();
    let rev1 = doc
        .put_properties(props(json!({"foo": 1, "bar": false})))
        .unwrap();
    assert_eq!(rev1.attachment_names().len(), 0);
    assert!(matches!(db.get_attachment(&rev1, "index.html"), Err(Error::NotFound(_))));
    assert!(doc.attachment("index.html").unwrap().is_none());

    let mut draft = doc.create_revision().unwrap();
    draft.set_attachment("index.html", "text/plain; charset=utf-8", HTML).unwrap();
    let pending = draft.attachment("index.html").unwrap().unwrap();
    assert!(pending.doc_id().is_none());
    assert!(pending.rev_id().is_none());
    assert_eq!(pending.content().as_ref(), HTML);

    let rev2 = draft.save().unwrap();
    assert_eq!(rev2.parent_rev_id(), Some(rev1.rev_id()));
    let attachment = db.get_attachment(&rev2, "index.html").unwrap();
    assert_eq!(attachment.doc_id(), Some("attach"));
    assert_eq!(attachment.rev_id(), Some(rev2.rev_id()));
    assert_eq!(attachment.content_type(), "text/plain; charset=utf-8");
    assert_eq!(attachment.length(), HTML.len() as u64);
    assert_eq!(attachment.info().revpos, 2);
    let mut streamed = Vec::new();
    attachment.content_stream().read_to_end(&mut streamed).unwrap();
    assert_eq!(streamed, HTML);

    // a plain property update keeps the attachment of its parent
    let mut current = doc.properties().unwrap().unwrap();
    current.insert("foo".into(), 2.into());
    let rev3 = doc.put_properties(current).unwrap();
    assert_eq!(rev3.attachment_names(), vec!["index.html"]);
    assert_eq!(rev3.attachment_info("index.html").unwrap().revpos, 2);
    rev3
}

#[test]
fn test_attachments_in_memory() {
    let db = Database::open_in_memory().unwrap();
    let rev = exercise_attachments(&db);
    let attachment = db.get_attachment(&rev, "index.html").unwrap();
    assert!(attachment.content_path().is_none());
    assert_eq!(db.attachment_count().unwrap(), 1);
}

#[test]
fn test_attachments_on_disk_expose_content_path() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(DatabaseConfig::at(dir.path().join("db"))).unwrap();
    let rev = exercise_attachments(&db);
    let attachment = db.get_attachment(&rev, "index.html").unwrap();
    let path = attachment.content_path().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), HTML);
}

#[test]
fn test_encrypted_attachments_hide_content_path() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_with_cipher(DatabaseConfig::at(dir.path().join("db")), Arc::new(XorCipher(0x5a)))
        .unwrap();
    let rev = exercise_attachments(&db);
    let attachment = db.get_attachment(&rev, "index.html").unwrap();
    assert!(attachment.content_path().is_none());
    assert_eq!(attachment.content().as_ref(), HTML);
}

#[test]
fn test_attachments_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));
    let rev_id = {
        let db = Database::open(config.clone()).unwrap();
        let rev = exercise_attachments(&db);
        db.close().unwrap();
        rev.rev_id().clone()
    };
    let db = Database::open(config).unwrap();
    let rev = db.get_revision("attach", &rev_id).unwrap();
    let attachment = db.get_attachment(&rev, "index.html").unwrap();
    assert_eq!(attachment.content().as_ref(), HTML);
}

#[test]
fn test_compaction_collects_unreferenced_attachments() {
    let db = Database::open_in_memory().unwrap();
    let doc = db.document("gc").unwrap();
    let mut draft = doc.create_revision().unwrap();
    draft.set_attachment("old.bin", "application/octet-stream", &b"old content"[..]).unwrap();
    draft.save().unwrap();
    let mut draft = doc.create_revision().unwrap();
    draft.remove_attachment("old.bin");
    draft.set_attachment("new.bin", "application/octet-stream", &b"new content"[..]).unwrap();
    draft.save().unwrap();
    assert_eq!(db.attachment_count().unwrap(), 2);

    // the first revision still references the old blob
    assert_eq!(db.compact().unwrap().attachments_removed, 0);

    db.set_max_rev_tree_depth(1).unwrap();
    let stats = db.compact().unwrap();
    assert_eq!(stats.revisions_pruned, 1);
    assert_eq!(stats.attachments_removed, 1);
    assert_eq!(db.attachment_count().unwrap(), 1);
    assert!(doc.attachment("new.bin").unwrap().is_some());
}

#[test]
fn test_compaction_inside_transaction_defers_collection() {
    let db = Database::open_in_memory().unwrap();
    let doc = db.document("deferred").unwrap();
    let mut draft = doc.create_revision().unwrap();
    draft.set_attachment("a", "text/plain", &b"a"[..]).unwrap();
    draft.save().unwrap();
    let mut draft = doc.create_revision().unwrap();
    draft.remove_attachment("a");
    draft.save().unwrap();
    db.set_max_rev_tree_depth(1).unwrap();

    let ok = db
        .run_in_transaction(|| {
            let stats = db.compact().unwrap();
            assert_eq!(stats.revisions_pruned, 1);
            assert_eq!(stats.attachments_removed, 0);
            assert_eq!(db.attachment_count().unwrap(), 1);
            true
        })
        .unwrap();
    assert!(ok);
    assert_eq!(db.attachment_count().unwrap(), 0);
}

#[test]
fn test_force_insert_requires_installed_attachment() {
    let db = Database::open_in_memory().unwrap();
    let content = b"replicated bytes";
    let info = AttachmentInfo {
        name: "data.bin".into(),
        content_type: "application/octet-stream".into(),
        digest: BlobKey::from_data(content),
        length: content.len() as u64,
        revpos: 1,
    };
    let revision = Revision::new("remote", RevisionId::parse("1-abcd").unwrap(), false, Map::new())
        .with_attachments([info]);

    let missing = db.force_insert(&revision, &[], Some("peer"));
    assert!(matches!(missing, Err(Error::AttachmentMissing { .. })));

    let key = db.install_attachment(content).unwrap();
    assert_eq!(&key, &BlobKey::from_data(content));
    assert!(db.force_insert(&revision, &[], Some("peer")).unwrap());
    let saved = db.current_revision("remote").unwrap().unwrap();
    let attachment = db.get_attachment(&saved, "data.bin").unwrap();
    assert_eq!(attachment.content().as_ref(), content);
}

#[test]
fn test_save_waits_for_concurrent_compaction() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(DatabaseConfig::at(dir.path().join("db"))).unwrap();
    let doc = db.document("racer").unwrap();
    doc.put_properties(props(json!({"v": 1}))).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let compact_db = db.clone();
    let compactor = thread::spawn(move || {
        compact_db
            .run_in_transaction(|| {
                compact_db.compact().unwrap();
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                true
            })
            .unwrap()
    });
    started_rx.recv().unwrap();

    let mut draft = doc.create_revision().unwrap();
    draft.set_attachment("index.html", "text/html", HTML).unwrap();
    let saver = thread::spawn(move || draft.save());
    // the save is now queued behind the compaction's transaction
    thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();
    assert!(compactor.join().unwrap());

    let saved = saver.join().unwrap().unwrap();
    let attachment = db.get_attachment(&saved, "index.html").unwrap();
    assert_eq!(attachment.content().as_ref(), HTML);
    assert_eq!(db.attachment_count().unwrap(), 1);

    db.compact().unwrap();
    assert_eq!(doc.attachment("index.html").unwrap().unwrap().content().as_ref(), HTML);
}

#[test]
fn test_concurrent_disk_puts_of_same_blob() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DiskBlobStore::open(dir.path()).unwrap());
    let data: &'static [u8] = b"shared attachment content";
    let key = BlobKey::from_data(data);

    for _ in 0..5 {
        assert!(store.delete(&key).is_ok());
        let barrier = Arc::new(Barrier::new(8));
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.put(&key, data)
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }
        assert_eq!(store.keys().unwrap(), vec![key]);
        assert_eq!(store.get(&key).unwrap().unwrap().as_ref(), data);
    }

    let hex = key.to_hex();
    let shard: Vec<_> = std::fs::read_dir(dir.path().join(&hex[..2]))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(shard, vec![std::ffi::OsString::from(&hex[2..])]);
}
