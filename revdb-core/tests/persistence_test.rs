//! Reopen tests against the SQLite revision store and disk blob store

use revdb_core::{ChangesOptions, Database, DatabaseConfig, Map, Value};
use serde_json::json;
use tempfile::TempDir;

fn props(value: serde_json::Value) -> Map {
    revdb_core::map_from_json(value).unwrap()
}

#[test]
fn test_large_document_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("big.revdb");
    let content = "x".repeat(3 * 1024 * 1024);

    let db = Database::open(DatabaseConfig::at(&path)).unwrap();
    assert_eq!(db.name(), "big");
    let doc = db.document("large").unwrap();
    doc.put_properties(props(json!({"content": content.clone()})))
        .unwrap();
    db.close().unwrap();

    let reopened = Database::open(DatabaseConfig::at(&path)).unwrap();
    let doc = reopened.get_document("large").unwrap().unwrap();
    assert_eq!(doc.property("content").unwrap(), Some(Value::from(content)));
}

#[test]
fn test_reopen_preserves_trees_and_counters() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));

    let (uuid, head, sequence) = {
        let db = Database::open(config.clone()).unwrap();
        let mut rev = db.put_properties("doc", None, props(json!({"v": 0})), false).unwrap();
        for v in 1..5 {
            rev = db
                .put_properties("doc", Some(rev.rev_id()), props(json!({"v": v})), false)
                .unwrap();
        }
        let gone = db.put_properties("gone", None, Map::new(), false).unwrap();
        db.put_properties("gone", Some(gone.rev_id()), Map::new(), true)
            .unwrap();
        db.set_max_rev_tree_depth(2).unwrap();
        db.compact().unwrap();
        let result = (db.uuid().to_string(), rev.rev_id().clone(), db.last_sequence().unwrap());
        db.close().unwrap();
        result
    };

    let db = Database::open(config).unwrap();
    assert_eq!(db.uuid(), uuid);
    assert_eq!(db.last_sequence().unwrap(), sequence);
    assert_eq!(db.max_rev_tree_depth().unwrap(), 2);
    assert_eq!(db.document_count().unwrap(), 1);
    assert_eq!(db.current_revision("doc").unwrap().unwrap().rev_id(), &head);
    assert_eq!(db.revision_history("doc", &head).unwrap().len(), 2);
    assert!(db.current_revision("gone").unwrap().unwrap().is_deleted());

    let old = db.all_revisions("doc").unwrap();
    assert_eq!(old.len(), 2);
    let next = db
        .put_properties("doc", Some(&head), props(json!({"v": 5})), false)
        .unwrap();
    assert_eq!(next.sequence(), Some(sequence + 1));

    let changes = db.changes_since(sequence, &ChangesOptions::default(), None, None).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].rev_id(), next.rev_id());
}

#[test]
fn test_force_insert_of_pruned_revision_is_noop_after_reopen() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));
    let first = {
        let db = Database::open(config.clone()).unwrap();
        let first = db.put_properties("doc", None, props(json!({"v": 1})), false).unwrap();
        let mut rev = first.clone();
        for v in 2..5 {
            rev = db
                .put_properties("doc", Some(rev.rev_id()), props(json!({"v": v})), false)
                .unwrap();
        }
        db.set_max_rev_tree_depth(1).unwrap();
        db.compact().unwrap();
        db.close().unwrap();
        first
    };

    let db = Database::open(config).unwrap();
    assert!(db.get_revision("doc", first.rev_id()).is_err());
    let before = db.last_sequence().unwrap();
    assert!(!db.force_insert(&first, &[], Some("peer")).unwrap());
    assert_eq!(db.last_sequence().unwrap(), before);
}

#[test]
fn test_saved_config_is_used_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("configured");
    let config = DatabaseConfig {
        max_rev_tree_depth: 3,
        document_cache_capacity: 4,
        ..DatabaseConfig::at(&path)
    };
    config.save(&path).unwrap();

    let loaded = DatabaseConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    let db = Database::open(loaded).unwrap();
    assert_eq!(db.max_rev_tree_depth().unwrap(), 3);
    assert_eq!(db.path(), Some(path.as_path()));
}

#[test]
fn test_rolled_back_transaction_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));
    {
        let db = Database::open(config.clone()).unwrap();
        db.put_properties("kept", None, Map::new(), false).unwrap();
        let ok = db
            .run_in_transaction(|| {
                db.put_properties("dropped", None, Map::new(), false).unwrap();
                false
            })
            .unwrap();
        assert!(!ok);
        db.close().unwrap();
    }
    let db = Database::open(config).unwrap();
    assert!(db.get_document("kept").unwrap().is_some());
    assert!(db.get_document("dropped").unwrap().is_none());
    assert_eq!(db.last_sequence().unwrap(), 1);
}
