//! Content-addressed attachment storage
//!
//! Blobs are keyed by the SHA-256 of their plaintext. The same bytes attached
//! to any number of revisions are stored once; unreferenced blobs are removed
//! by compaction.

use crate::storage::{Result, StorageError};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Content hash of an attachment blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey([u8; 32]);

impl BlobKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the key of some content
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256-{}", self.to_hex())
    }
}

impl TryFrom<String> for BlobKey {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::from_hex(s.strip_prefix("sha256-").unwrap_or(&s))
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.to_string()
    }
}

/// Attachment metadata recorded in a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: String,
    pub content_type: String,
    pub digest: BlobKey,
    pub length: u64,
    /// Generation of the revision that introduced this content
    pub revpos: u32,
}

/// Encryption hook for attachment bytes at rest
pub trait BlobCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Raw blob storage backend
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &BlobKey) -> Result<Option<Bytes>>;

    /// Store bytes under a key. Storing an existing key is a no-op.
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()>;

    /// Returns false if the key was absent.
    fn delete(&self, key: &BlobKey) -> Result<bool>;

    fn contains(&self, key: &BlobKey) -> Result<bool>;

    fn keys(&self) -> Result<Vec<BlobKey>>;

    /// Filesystem location of a stored blob, for backends that have one
    fn path_of(&self, _key: &BlobKey) -> Option<PathBuf> {
        None
    }
}

/// In-memory blob backend
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .entry(*key)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(())
    }

    fn delete(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn contains(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    fn keys(&self) -> Result<Vec<BlobKey>> {
        Ok(self.blobs.read().keys().copied().collect())
    }
}

/// Filesystem blob backend: `<root>/<hex[..2]>/<hex[2..]>`
pub struct DiskBlobStore {
    root: PathBuf,
}

/// Suffix of files staged by an unfinished [`DiskBlobStore::put`]
const TMP_SUFFIX: &str = ".tmp";

impl DiskBlobStore {
    /// Open a blob directory, removing files left by interrupted writes.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        store.remove_stale_staging()?;
        Ok(store)
    }

    fn remove_stale_staging(&self) -> Result<()> {
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                    tracing::debug!("Removing stale attachment staging file {}", entry.path().display());
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    fn blob_path(&self, key: &BlobKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl BlobStore for DiskBlobStore {
    fn get(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        match fs::read(self.blob_path(key)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Each writer stages its own file; the blob appears with one rename.
        let tmp_path = path.with_extension(format!("{}{}", uuid::Uuid::new_v4().simple(), TMP_SUFFIX));
        let staged = fs::write(&tmp_path, data).and_then(|()| fs::rename(&tmp_path, &path));
        if let Err(e) = staged {
            let _ = fs::remove_file(&tmp_path);
            // Another writer stored the same content first.
            if !path.is_file() {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn delete(&self, key: &BlobKey) -> Result<bool> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blob_path(key).is_file())
    }

    fn keys(&self) -> Result<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(shard.path())? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if let Ok(key) = BlobKey::from_hex(&format!("{}{}", prefix, name)) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    fn path_of(&self, key: &BlobKey) -> Option<PathBuf> {
        let path = self.blob_path(key);
        path.is_file().then_some(path)
    }
}

/// Attachment store: a blob backend plus the optional cipher
pub struct AttachmentStore {
    blobs: Box<dyn BlobStore>,
    cipher: Option<Arc<dyn BlobCipher>>,
}

impl AttachmentStore {
    pub fn new(blobs: Box<dyn BlobStore>, cipher: Option<Arc<dyn BlobCipher>>) -> Self {
        Self { blobs, cipher }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBlobStore::new()), None)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Store content and return its key.
    pub fn store(&self, data: &[u8]) -> Result<BlobKey> {
        let key = BlobKey::from_data(data);
        if self.blobs.contains(&key)? {
            return Ok(key);
        }
        match &self.cipher {
            Some(cipher) => self.blobs.put(&key, &cipher.encrypt(data)?)?,
            None => self.blobs.put(&key, data)?,
        }
        tracing::debug!("Stored attachment blob {} ({} bytes)", key, data.len());
        Ok(key)
    }

    /// Read and decrypt content. `None` if the blob is absent.
    pub fn read(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        let Some(raw) = self.blobs.get(key)? else {
            return Ok(None);
        };
        let data = match &self.cipher {
            Some(cipher) => Bytes::from(cipher.decrypt(&raw)?),
            None => raw,
        };
        if BlobKey::from_data(&data) != *key {
            return Err(StorageError::Corrupt(format!("attachment blob {} fails its digest check", key)));
        }
        Ok(Some(data))
    }

    pub fn contains(&self, key: &BlobKey) -> Result<bool> {
        self.blobs.contains(key)
    }

    pub fn remove(&self, key: &BlobKey) -> Result<bool> {
        self.blobs.delete(key)
    }

    pub fn keys(&self) -> Result<Vec<BlobKey>> {
        self.blobs.keys()
    }

    /// Plain file holding the content. Always `None` when encrypted.
    pub fn content_path(&self, key: &BlobKey) -> Option<PathBuf> {
        if self.cipher.is_some() {
            return None;
        }
        self.blobs.path_of(key)
    }
}

/// An attachment with its content loaded
#[derive(Debug, Clone)]
pub struct Attachment {
    pub(crate) info: AttachmentInfo,
    pub(crate) content: Bytes,
    pub(crate) doc_id: Option<String>,
    pub(crate) rev_id: Option<crate::revision::RevisionId>,
    pub(crate) path: Option<PathBuf>,
}

impl Attachment {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn content_type(&self) -> &str {
        &self.info.content_type
    }

    pub fn digest(&self) -> &BlobKey {
        &self.info.digest
    }

    pub fn length(&self) -> u64 {
        self.info.length
    }

    pub fn info(&self) -> &AttachmentInfo {
        &self.info
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Reader over the content
    pub fn content_stream(&self) -> Cursor<Bytes> {
        Cursor::new(self.content.clone())
    }

    /// Plain file backing the content; absent for unsaved, in-memory or
    /// encrypted attachments
    pub fn content_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Owning document, `None` for attachments of an unsaved revision
    pub fn doc_id(&self) -> Option<&str> {
        self.doc_id.as_deref()
    }

    pub fn rev_id(&self) -> Option<&crate::revision::RevisionId> {
        self.rev_id.as_ref()
    }
}
