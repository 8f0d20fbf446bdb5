//! In-memory collaborators.
//!
//! Enough of a collection, a store and a temp store to serve files without
//! any backend, for tests, demos and embedding in small tools.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream;
use tokio::io::AsyncWrite;

use crate::gate::ValidatorSet;
use crate::store::{
    ByteStream, ChunkSink, Collection, CopyDescriptor, FileId, FileRecord, NewFile, StorageAdapter,
    StoreError, TempStore,
};

/// Largest chunk a [`MemoryStore`] read stream yields.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Name of the store every [`MemoryCollection`] starts with.
pub const MEMORY_STORE: &str = "memory";

/// A [`StorageAdapter`] keeping file contents in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<FileId, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: &FileId, data: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), data.into());
    }

    pub fn data(&self, id: &FileId) -> Option<Bytes> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn create_read_stream(
        &self,
        file: &FileRecord,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, StoreError> {
        let id = file.id.as_ref().ok_or_else(|| StoreError::NotFound("unsaved file".to_string()))?;
        let data = self.data(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let len = data.len() as u64;
        if start > end || end >= len {
            return Err(StoreError::Status {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                message: format!("range {start}-{end} outside {len} stored bytes"),
            });
        }

        // bounds checked above, so the offsets fit in usize
        let data = data.slice(start as usize..=end as usize);
        let chunks: Vec<Result<Bytes, StoreError>> = (0..data.len())
            .step_by(READ_CHUNK_SIZE)
            .map(|at| Ok(data.slice(at..data.len().min(at + READ_CHUNK_SIZE))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn write(&self, file: &FileId, data: Bytes) -> Result<(), StoreError> {
        self.put(file, data);
        Ok(())
    }

    async fn remove(&self, file: &FileId) -> Result<(), StoreError> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner).remove(file);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TempState {
    chunks: BTreeMap<(FileId, u64), Vec<u8>>,
    opened: u64,
}

/// A [`TempStore`] keeping chunks in memory. Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryTempStore {
    state: Arc<Mutex<TempState>>,
    received: Arc<AtomicU64>,
}

impl MemoryTempStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a completed chunk.
    pub fn chunk(&self, file: &FileId, chunk: u64) -> Option<Vec<u8>> {
        self.lock().chunks.get(&(file.clone(), chunk)).cloned()
    }

    /// Completed chunks of `file`, concatenated in index order.
    pub fn assemble(&self, file: &FileId) -> Vec<u8> {
        self.lock()
            .chunks
            .range((file.clone(), 0)..=(file.clone(), u64::MAX))
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// Number of write streams handed out.
    pub fn opened(&self) -> u64 {
        self.lock().opened
    }

    /// Bytes written to any sink, completed or not.
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TempState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TempStore for MemoryTempStore {
    async fn create_write_stream(
        &self,
        file: &FileRecord,
        chunk: u64,
    ) -> Result<ChunkSink, StoreError> {
        let id = file.id.clone().ok_or_else(|| StoreError::NotFound("unsaved file".to_string()))?;
        self.lock().opened += 1;
        Ok(Box::pin(ChunkWriter {
            key: (id, chunk),
            buffer: Vec::new(),
            store: self.clone(),
        }))
    }
}

/// Buffers one chunk and publishes it on shutdown.
struct ChunkWriter {
    key: (FileId, u64),
    buffer: Vec<u8>,
    store: MemoryTempStore,
}

impl AsyncWrite for ChunkWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.buffer.extend_from_slice(buf);
        this.store.received.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let data = std::mem::take(&mut this.buffer);
        this.store.lock().chunks.insert(this.key.clone(), data);
        Poll::Ready(Ok(()))
    }
}

/// A [`Collection`] keeping records in memory.
///
/// Starts with a single [`MemoryStore`] named [`MEMORY_STORE`] as its primary
/// store, a [`MemoryTempStore`] and no validators.
pub struct MemoryCollection {
    name: String,
    primary: String,
    memory: Arc<MemoryStore>,
    stores: HashMap<String, Arc<dyn StorageAdapter>>,
    validators: ValidatorSet,
    temp: Arc<dyn TempStore>,
    files: RwLock<HashMap<FileId, FileRecord>>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let mut stores: HashMap<String, Arc<dyn StorageAdapter>> = HashMap::new();
        stores.insert(MEMORY_STORE.to_string(), memory.clone());
        MemoryCollection {
            name: name.into(),
            primary: MEMORY_STORE.to_string(),
            memory,
            stores,
            validators: ValidatorSet::new(),
            temp: Arc::new(MemoryTempStore::new()),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_temp_store(mut self, temp: impl TempStore + 'static) -> Self {
        self.temp = Arc::new(temp);
        self
    }

    /// Registers an additional store.
    pub fn with_store(mut self, name: impl Into<String>, store: Arc<dyn StorageAdapter>) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    /// Registers a store and makes it the primary one.
    pub fn with_primary_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn StorageAdapter>,
    ) -> Self {
        let name = name.into();
        self.stores.insert(name.clone(), store);
        self.primary = name;
        self
    }

    /// The built-in [`MemoryStore`].
    pub fn primary(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    /// Adds `record` as-is. Its stores must already hold the data.
    pub fn add(&self, record: FileRecord) -> Option<FileId> {
        let id = record.id.clone()?;
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), record);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn primary_store(&self) -> &str {
        &self.primary
    }

    fn store(&self, name: &str) -> Option<Arc<dyn StorageAdapter>> {
        self.stores.get(name).cloned()
    }

    fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    fn temp_store(&self) -> Arc<dyn TempStore> {
        self.temp.clone()
    }

    async fn find(&self, id: &FileId) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.files.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned())
    }

    async fn insert(&self, file: NewFile) -> Result<FileId, StoreError> {
        let NewFile { mut record, attachment } = file;
        let id = FileId::new(uuid::Uuid::new_v4().simple().to_string());
        let store = self
            .stores
            .get(&self.primary)
            .ok_or_else(|| StoreError::Unavailable(format!("no store \"{}\"", self.primary)))?;

        let size = attachment.data.len() as u64;
        store.write(&id, attachment.data).await?;

        let copy = CopyDescriptor {
            size,
            content_type: Some(attachment.content_type),
            name: record.name.clone().unwrap_or_else(|| id.to_string()),
            updated_at: SystemTime::now(),
        };
        record.copies.insert(self.primary.clone(), copy);
        record.id = Some(id.clone());

        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), record);
        Ok(id)
    }

    async fn remove(&self, id: &FileId) -> Result<bool, StoreError> {
        let found = self.files.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned();
        let Some(record) = found else {
            return Ok(false);
        };
        // the record stays resolvable until every copy is gone
        for store in record.copies.keys().filter_map(|name| self.stores.get(name)) {
            store.remove(id).await?;
        }
        let removed = self.files.write().unwrap_or_else(PoisonError::into_inner).remove(id);
        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::store::Attachment;

    #[tokio::test]
    async fn test_memory_store_reads_bounded_range() {
        let store = MemoryStore::new();
        let id = FileId::new("a");
        store.put(&id, vec![7u8; 200 * 1024]);
        let file = FileRecord { id: Some(id), ..Default::default() };

        let mut stream = store.create_read_stream(&file, 10, 70_009).await.unwrap();
        let mut total = 0;
        let mut chunks = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
            chunks += 1;
        }
        assert_eq!(70_000, total);
        assert_eq!(2, chunks);
    }

    #[tokio::test]
    async fn test_memory_store_missing_object() {
        let store = MemoryStore::new();
        let file = FileRecord { id: Some(FileId::new("nope")), ..Default::default() };
        let err = store.create_read_stream(&file, 0, 0).await.err().unwrap();
        assert_eq!(Some(StatusCode::NOT_FOUND), err.status());
    }

    #[tokio::test]
    async fn test_temp_store_assembles_in_index_order() {
        use tokio::io::AsyncWriteExt;

        let temp = MemoryTempStore::new();
        let file = FileRecord { id: Some(FileId::new("f")), ..Default::default() };
        for (chunk, data) in [(2, "c"), (0, "a"), (1, "b")] {
            let mut sink = temp.create_write_stream(&file, chunk).await.unwrap();
            sink.write_all(data.as_bytes()).await.unwrap();
            sink.shutdown().await.unwrap();
        }
        assert_eq!(b"abc".to_vec(), temp.assemble(&FileId::new("f")));
        assert_eq!(3, temp.opened());
        assert_eq!(3, temp.bytes_received());
    }

    #[tokio::test]
    async fn test_remove_reports_whether_anything_was_removed() {
        let collection = MemoryCollection::new("c");
        let id = collection
            .insert(NewFile {
                record: FileRecord::unsaved(None),
                attachment: Attachment {
                    content_type: "text/plain".to_string(),
                    data: Bytes::from_static(b"x"),
                },
            })
            .await
            .unwrap();

        assert!(collection.remove(&id).await.unwrap());
        assert!(collection.primary().data(&id).is_none());
        assert!(!collection.remove(&id).await.unwrap());
    }

    /// Reads nothing, stores nothing and refuses to delete.
    struct StuckStore;

    #[async_trait]
    impl StorageAdapter for StuckStore {
        async fn create_read_stream(
            &self,
            _: &FileRecord,
            _: u64,
            _: u64,
        ) -> Result<ByteStream, StoreError> {
            Err(StoreError::Unavailable("stuck".to_string()))
        }

        async fn write(&self, _: &FileId, _: Bytes) -> Result<(), StoreError> {
            Ok(())
        }

        async fn remove(&self, _: &FileId) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("stuck".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_store_remove_keeps_record() {
        let collection =
            MemoryCollection::new("c").with_primary_store("stuck", Arc::new(StuckStore));
        let id = collection
            .insert(NewFile {
                record: FileRecord::unsaved(Some("a.txt".to_string())),
                attachment: Attachment {
                    content_type: "text/plain".to_string(),
                    data: Bytes::from_static(b"x"),
                },
            })
            .await
            .unwrap();

        assert!(collection.remove(&id).await.is_err());
        assert_eq!(1, collection.len());
        assert!(collection.find(&id).await.unwrap().is_some());
    }
}
