//! Interfaces of the collaborators that own file metadata and bytes.
//!
//! Nothing in this crate persists data itself. A [`Collection`] resolves and
//! stores file records, each named [`StorageAdapter`] holds one physical copy
//! of a file, and a [`TempStore`] receives the chunks of a resumable upload.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::gate::ValidatorSet;

/// A boxed stream of bytes read from a storage backend.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

/// A boxed byte sink accepting one chunk of an upload.
pub type ChunkSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Failure reported by a collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// The protocol status this error carries, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NotFound(_) => Some(StatusCode::NOT_FOUND),
            Self::Unavailable(_) | Self::Io(_) => None,
        }
    }
}

/// Identifier of a persisted file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of one stored replica of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDescriptor {
    pub size: u64,
    pub content_type: Option<String>,
    pub name: String,
    pub updated_at: SystemTime,
}

/// A file as seen by the transfer layer. `id` is `None` until the
/// collection has persisted the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRecord {
    pub id: Option<FileId>,
    pub name: Option<String>,
    pub copies: HashMap<String, CopyDescriptor>,
}

impl FileRecord {
    /// A record that has not been inserted yet.
    pub fn unsaved(name: Option<String>) -> Self {
        FileRecord { id: None, name, copies: HashMap::new() }
    }

    pub fn copy(&self, store: &str) -> Option<&CopyDescriptor> {
        self.copies.get(store)
    }
}

/// Data attached to a record before insertion.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub content_type: String,
    pub data: Bytes,
}

/// A record plus its data, handed to [`Collection::insert`].
#[derive(Debug, Clone)]
pub struct NewFile {
    pub record: FileRecord,
    pub attachment: Attachment,
}

/// Backend holding the bytes of one store.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Opens a stream over the inclusive byte range `[start, end]` of the
    /// stored file. Errors may be returned up front or from the stream.
    async fn create_read_stream(
        &self,
        file: &FileRecord,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, StoreError>;

    /// Stores `data` as the full content of `file`.
    async fn write(&self, file: &FileId, data: Bytes) -> Result<(), StoreError>;

    /// Deletes the stored bytes of `file`. Missing data is not an error.
    async fn remove(&self, file: &FileId) -> Result<(), StoreError>;
}

/// Temporary store collecting resumable upload chunks. Reassembly of the
/// chunks into a stored file is the store's own business.
#[async_trait]
pub trait TempStore: Send + Sync {
    /// Opens a sink for chunk number `chunk` of `file`. The write is only
    /// complete once the sink has been shut down.
    async fn create_write_stream(
        &self,
        file: &FileRecord,
        chunk: u64,
    ) -> Result<ChunkSink, StoreError>;
}

/// A named set of files with its stores, validators and temp store.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the store used when a request does not pick one.
    fn primary_store(&self) -> &str;

    fn store(&self, name: &str) -> Option<Arc<dyn StorageAdapter>>;

    fn validators(&self) -> &ValidatorSet;

    fn temp_store(&self) -> Arc<dyn TempStore>;

    async fn find(&self, id: &FileId) -> Result<Option<FileRecord>, StoreError>;

    /// Persists the file and triggers storage of its data, returning the
    /// new identifier.
    async fn insert(&self, file: NewFile) -> Result<FileId, StoreError>;

    /// Removes the record, returning whether anything was removed.
    async fn remove(&self, id: &FileId) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_for_addressed_errors() {
        assert_eq!(Some(StatusCode::NOT_FOUND), StoreError::NotFound("a".into()).status());
        assert_eq!(None, StoreError::Unavailable("down".into()).status());
    }

    #[test]
    fn test_file_id_serializes_as_string() {
        let id = FileId::new("abc");
        assert_eq!("\"abc\"", serde_json::to_string(&id).unwrap());
    }
}
