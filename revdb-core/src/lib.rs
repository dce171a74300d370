//! RevDB Core Library
//!
//! Embedded document database engine including:
//! - Revision trees with deterministic winner selection and conflicts
//! - Optimistic `put_properties` and replication-style `force_insert`
//! - Nestable transactions with batched change notification
//! - Sequence-ordered change feed
//! - Content-addressed attachment store with garbage collection
//! - Compaction to a maximum revision tree depth
//! - SQLite revision storage (WAL mode) and in-memory storage

pub mod attachments;
pub mod canonical;
pub mod changes;
pub mod compactor;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod rev_tree;
pub mod revision;
pub mod sqlite_store;
pub mod storage;
mod store;
mod transaction;
pub mod value;

pub use attachments::{
    Attachment, AttachmentInfo, AttachmentStore, BlobCipher, BlobKey, BlobStore, DiskBlobStore, MemoryBlobStore,
};
pub use canonical::{as_canonical_bytes, revision_digest};
pub use changes::{
    ChangeBatch, ChangeEvent, ChangeListener, ChangeNotifier, ChangeSource, ChangeStream, ChangesFilter,
    ChangesOptions, ListenerToken,
};
pub use compactor::CompactionStats;
pub use config::{database_name_from_path, DatabaseConfig};
pub use database::Database;
pub use document::{Document, UnsavedRevision};
pub use error::{Error, Result};
pub use rev_tree::{RevNode, RevisionTree};
pub use revision::{Revision, RevisionId};
pub use sqlite_store::SqliteRevisionStore;
pub use storage::{MemoryRevisionStore, RevisionStore, StorageError, StoredRevision, StoredState, WriteBatch};
pub use store::RESERVED_KEYS;
pub use value::{map_from_json, Map, Value};
