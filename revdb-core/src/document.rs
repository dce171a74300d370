//! Document handles and unsaved revisions

use crate::attachments::{Attachment, AttachmentInfo, BlobKey};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::revision::{Revision, RevisionId};
use crate::value::{Map, Value};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;

/// Identity shared by every handle to the same cached document
#[derive(Debug)]
pub(crate) struct DocumentState {
    id: String,
}

impl DocumentState {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

/// Handle to one document of a database
#[derive(Debug, Clone)]
pub struct Document {
    db: Database,
    state: Arc<DocumentState>,
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Document {
    pub(crate) fn new(db: Database, state: Arc<DocumentState>) -> Self {
        Self { db, state }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn current_revision(&self) -> Result<Option<Revision>> {
        self.db.current_revision(self.id())
    }

    pub fn current_revision_id(&self) -> Result<Option<RevisionId>> {
        Ok(self.current_revision()?.map(|rev| rev.rev_id))
    }

    pub fn is_deleted(&self) -> Result<bool> {
        Ok(self.current_revision()?.is_some_and(|rev| rev.deleted))
    }

    /// Current body with `_id`, `_rev` and (for tombstones) `_deleted`
    pub fn properties(&self) -> Result<Option<Map>> {
        let Some(rev) = self.current_revision()? else {
            return Ok(None);
        };
        let mut props = rev.body().cloned().unwrap_or_default();
        props.insert("_id".into(), Value::from(self.id()));
        props.insert("_rev".into(), Value::from(rev.rev_id().to_string()));
        if rev.is_deleted() {
            props.insert("_deleted".into(), Value::Bool(true));
        }
        Ok(Some(props))
    }

    /// Property of the current revision
    pub fn property(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.properties()?.and_then(|mut props| props.remove(key)))
    }

    /// Save `properties` as a new revision. The parent is taken from `_rev`
    /// and `_deleted: true` saves a tombstone.
    pub fn put_properties(&self, properties: Map) -> Result<Revision> {
        let parent = match properties.get("_rev") {
            Some(Value::String(rev)) => Some(RevisionId::parse(rev)?),
            Some(Value::Null) | None => None,
            Some(other) => return Err(Error::validation(format!("_rev must be a string, not {:?}", other))),
        };
        let deleted = properties.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        self.db.put_properties(self.id(), parent.as_ref(), properties, deleted)
    }

    /// Save a tombstone on top of the current revision.
    pub fn delete(&self) -> Result<Revision> {
        let current = self
            .current_revision_id()?
            .ok_or_else(|| Error::not_found(format!("document '{}'", self.id())))?;
        self.db.put_properties(self.id(), Some(&current), Map::new(), true)
    }

    /// Start a draft child of the current revision.
    pub fn create_revision(&self) -> Result<UnsavedRevision> {
        let current = self.current_revision()?;
        let (parent, properties, attachments) = match current {
            Some(rev) if !rev.is_deleted() => (
                Some(rev.rev_id.clone()),
                rev.body().cloned().unwrap_or_default(),
                (*rev.attachments).clone(),
            ),
            Some(rev) => (Some(rev.rev_id), Map::new(), BTreeMap::new()),
            None => (None, Map::new(), BTreeMap::new()),
        };
        Ok(UnsavedRevision {
            db: self.db.clone(),
            doc_id: self.id().to_string(),
            parent,
            properties,
            attachments,
            pending: HashMap::new(),
        })
    }

    pub fn revision_history(&self) -> Result<Vec<Revision>> {
        let current = self
            .current_revision_id()?
            .ok_or_else(|| Error::not_found(format!("document '{}'", self.id())))?;
        self.db.revision_history(self.id(), &current)
    }

    pub fn conflicting_revisions(&self) -> Result<Vec<Revision>> {
        self.db.conflicting_revisions(self.id())
    }

    pub fn leaf_revisions(&self) -> Result<Vec<Revision>> {
        self.db.leaf_revisions(self.id())
    }

    pub fn all_revisions(&self) -> Result<Vec<Revision>> {
        self.db.all_revisions(self.id())
    }

    pub fn get_revision(&self, rev_id: &RevisionId) -> Result<Revision> {
        self.db.get_revision(self.id(), rev_id)
    }

    /// Named attachment of the current revision
    pub fn attachment(&self, name: &str) -> Result<Option<Attachment>> {
        match self.current_revision()? {
            Some(rev) if rev.attachment_info(name).is_some() => self.db.get_attachment(&rev, name).map(Some),
            _ => Ok(None),
        }
    }
}

/// Draft of a new revision, saved with [`UnsavedRevision::save`]
#[derive(Debug)]
pub struct UnsavedRevision {
    db: Database,
    doc_id: String,
    parent: Option<RevisionId>,
    properties: Map,
    attachments: BTreeMap<String, AttachmentInfo>,
    /// Content added since the draft was created, not yet stored
    pending: HashMap<BlobKey, Bytes>,
}

impl UnsavedRevision {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn parent_rev_id(&self) -> Option<&RevisionId> {
        self.parent.as_ref()
    }

    pub fn properties(&self) -> &Map {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Map {
        &mut self.properties
    }

    pub fn set_properties(&mut self, properties: Map) {
        self.properties = properties;
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Add or replace an attachment with the content of `reader`.
    pub fn set_attachment(&mut self, name: &str, content_type: &str, mut reader: impl Read) -> Result<()> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(crate::storage::StorageError::from)?;
        let content = Bytes::from(data);
        let digest = BlobKey::from_data(&content);
        self.attachments.insert(
            name.to_string(),
            AttachmentInfo {
                name: name.to_string(),
                content_type: content_type.to_string(),
                digest,
                length: content.len() as u64,
                revpos: 0,
            },
        );
        self.pending.insert(digest, content);
        Ok(())
    }

    /// Returns false if there was no such attachment.
    pub fn remove_attachment(&mut self, name: &str) -> bool {
        self.attachments.remove(name).is_some()
    }

    pub fn attachment_names(&self) -> Vec<&str> {
        self.attachments.keys().map(String::as_str).collect()
    }

    /// Attachment as it would be saved
    pub fn attachment(&self, name: &str) -> Result<Option<Attachment>> {
        let Some(info) = self.attachments.get(name) else {
            return Ok(None);
        };
        let content = match self.pending.get(&info.digest) {
            Some(content) => content.clone(),
            None => self.db.read_blob(&info.digest)?.ok_or_else(|| Error::AttachmentMissing {
                doc_id: self.doc_id.clone(),
                digest: info.digest.to_string(),
            })?,
        };
        Ok(Some(Attachment {
            info: info.clone(),
            content,
            doc_id: None,
            rev_id: None,
            path: None,
        }))
    }

    /// Store new attachment content and save the revision.
    ///
    /// Both happen in one transaction, so a compaction committed by another
    /// thread cannot collect the new blobs before the revision references
    /// them.
    pub fn save(self) -> Result<Revision> {
        let Self {
            db,
            doc_id,
            parent,
            properties,
            attachments,
            pending,
        } = self;
        db.in_transaction(|| {
            for info in attachments.values() {
                if let Some(content) = pending.get(&info.digest) {
                    db.install_attachment(content)?;
                }
            }
            db.put_with_attachments(&doc_id, parent.as_ref(), properties, attachments)
        })
    }
}
