//! Inbound transfers: whole-file inserts and resumable chunk writes.

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::gate::{Action, ActionGate, Identity};
use crate::store::{Attachment, Collection, FileId, FileRecord, NewFile, StoreError};

/// Creates files from a complete request body.
pub struct UploadIngestor;

impl UploadIngestor {
    /// Builds a record named `filename`, checks the `insert` permission,
    /// buffers `body` as its data and hands it to the collection.
    ///
    /// The permission check runs before the body is read, so a denied
    /// request never touches storage.
    pub async fn ingest_whole<S, E>(
        collection: &dyn Collection,
        filename: Option<String>,
        content_type: Option<&str>,
        body: S,
        identity: Option<&Identity>,
    ) -> Result<FileId>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        let record = FileRecord::unsaved(filename);
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| mime_guess::mime::APPLICATION_OCTET_STREAM.to_string());

        ActionGate::check(collection.validators(), Action::Insert, &record, identity)?;

        let data = buffer(body).await?;
        tracing::debug!(
            collection = collection.name(),
            bytes = data.len(),
            %content_type,
            "inserting file"
        );

        let file = NewFile {
            record,
            attachment: Attachment { content_type, data },
        };
        let id = collection.insert(file).await?;
        Ok(id)
    }
}

/// Forwards upload chunks to a collection's temp store.
pub struct ChunkIngestor;

impl ChunkIngestor {
    /// Writes `body` as chunk `chunk` of `file`, returning the index used.
    ///
    /// A missing or malformed index means chunk `0`. Chunked updates are
    /// governed by the `insert` permission.
    pub async fn ingest_chunk<S, E>(
        collection: &dyn Collection,
        file: &FileRecord,
        chunk: Option<&str>,
        body: S,
        identity: Option<&Identity>,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        let chunk = chunk_index(chunk);
        tracing::debug!(file = ?file.id, chunk, "PUT (update) received chunk");

        ActionGate::check(collection.validators(), Action::Insert, file, identity)?;

        let mut sink = collection.temp_store().create_write_stream(file, chunk).await?;

        futures::pin_mut!(body);
        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| Error::BadRequest(format!("failed to read body: {e}")))?;
            sink.write_all(&bytes).await.map_err(StoreError::Io)?;
        }
        sink.shutdown().await.map_err(StoreError::Io)?;

        Ok(chunk)
    }
}

/// Parses a chunk index, falling back to `0` for anything that is not a
/// non-negative integer.
pub(crate) fn chunk_index(raw: Option<&str>) -> u64 {
    match raw {
        None => 0,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::debug!(raw, "invalid chunk index, using 0");
            0
        }),
    }
}

async fn buffer<S, E>(body: S) -> Result<Bytes>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut data = BytesMut::new();
    futures::pin_mut!(body);
    while let Some(bytes) = body.next().await {
        let bytes = bytes.map_err(|e| Error::BadRequest(format!("failed to read body: {e}")))?;
        data.extend_from_slice(&bytes);
    }
    Ok(data.freeze())
}
