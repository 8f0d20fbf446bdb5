use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures::ready;
use pin_project::pin_project;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite};

use crate::store::{
    ByteStream, ChunkSink, FileId, FileRecord, StorageAdapter, StoreError, TempStore,
};

const IO_BUFFER_SIZE: usize = 64 * 1024;

fn checked_name(id: &FileId) -> Result<&str, StoreError> {
    let name = id.as_str();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StoreError::NotFound(name.to_string()));
    }
    Ok(name)
}

fn not_found(id: &FileId, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(id.to_string())
    } else {
        StoreError::Io(err)
    }
}

/// Implements [`StorageAdapter`] over a directory, one file per id.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, id: &FileId) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(checked_name(id)?))
    }

    /// Calls [`tokio::fs::metadata`] to determine the stored size.
    pub async fn size(&self, id: &FileId) -> Result<u64, StoreError> {
        let metadata = tokio::fs::metadata(self.path(id)?).await.map_err(|e| not_found(id, e))?;
        Ok(metadata.len())
    }
}

#[async_trait]
impl StorageAdapter for FsStore {
    async fn create_read_stream(
        &self,
        file: &FileRecord,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, StoreError> {
        let id = file
            .id
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("unsaved file".to_string()))?;
        let mut handle = File::open(self.path(id)?).await.map_err(|e| not_found(id, e))?;

        let byte_size = handle.metadata().await?.len();
        if start > end || end >= byte_size {
            return Err(StoreError::Status {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                message: format!("range {start}-{end} outside {byte_size} stored bytes"),
            });
        }
        handle.seek(io::SeekFrom::Start(start)).await?;

        let length = end - start + 1;
        let mut reader = handle.take(length);
        let stream = async_stream::stream! {
            let mut remaining = length;
            while remaining > 0 {
                let mut buffer = BytesMut::with_capacity(IO_BUFFER_SIZE);
                match reader.read_buf(&mut buffer).await {
                    Ok(0) => {
                        let err = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file shrank while reading",
                        );
                        yield Err(StoreError::Io(err));
                        break;
                    }
                    Ok(n) => {
                        remaining -= n as u64;
                        yield Ok(buffer.freeze());
                    }
                    Err(e) => {
                        yield Err(StoreError::Io(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn write(&self, file: &FileId, data: Bytes) -> Result<(), StoreError> {
        let path = self.path(file)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn remove(&self, file: &FileId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path(file)?).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StoreError::Io(e)),
            _ => Ok(()),
        }
    }
}

/// Implements [`TempStore`] over a directory: chunk `n` of file `id` is
/// written to `<root>/<id>/<n>.chunk.part` and renamed to
/// `<root>/<id>/<n>.chunk` when its sink is shut down. A sink dropped
/// earlier leaves only the `.part` file, which [`FsTempStore::chunks`]
/// ignores.
#[derive(Debug, Clone)]
pub struct FsTempStore {
    root: PathBuf,
}

impl FsTempStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsTempStore { root: root.into() }
    }

    pub fn chunk_path(&self, id: &FileId, chunk: u64) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(checked_name(id)?).join(format!("{chunk}.chunk")))
    }

    /// Indices of the chunks stored for `id`, ascending.
    pub async fn chunks(&self, id: &FileId) -> Result<Vec<u64>, StoreError> {
        let dir = self.root.join(checked_name(id)?);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_suffix(".chunk"))
                .and_then(|n| n.parse().ok());
            if let Some(index) = index {
                chunks.push(index);
            }
        }
        chunks.sort_unstable();
        Ok(chunks)
    }
}

#[async_trait]
impl TempStore for FsTempStore {
    async fn create_write_stream(
        &self,
        file: &FileRecord,
        chunk: u64,
    ) -> Result<ChunkSink, StoreError> {
        let id = file
            .id
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("unsaved file".to_string()))?;
        let target = self.chunk_path(id, chunk)?;
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut part = target.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        let file = File::create(&part).await?;
        Ok(Box::pin(ChunkFile {
            file,
            part,
            target,
            rename: None,
            renamed: false,
        }))
    }
}

type Rename = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Chunk sink publishing its file under the final name on shutdown.
#[pin_project]
struct ChunkFile {
    #[pin]
    file: File,
    part: PathBuf,
    target: PathBuf,
    rename: Option<Rename>,
    renamed: bool,
}

impl AsyncWrite for ChunkFile {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().file.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().file.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if *this.renamed {
            return Poll::Ready(Ok(()));
        }

        if this.rename.is_none() {
            ready!(this.file.as_mut().poll_shutdown(cx))?;
            let (part, target) = (this.part.clone(), this.target.clone());
            *this.rename = Some(Box::pin(tokio::fs::rename(part, target)));
        }

        let Some(rename) = this.rename.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(rename.as_mut().poll(cx));
        *this.rename = None;
        *this.renamed = result.is_ok();
        Poll::Ready(result)
    }
}
