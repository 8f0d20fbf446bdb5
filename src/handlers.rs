//! Routing and request handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, RANGE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::{Action, ActionGate, Identity};
use crate::headers::{Disposition, HeaderConfig, TransferResponder};
use crate::ingest::{ChunkIngestor, UploadIngestor};
use crate::store::{Collection, FileId, FileRecord};
use crate::stream::DownloadStreamer;
use crate::{RangeParser, SingleByteRange};

/// Query parameters understood by the transfer routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferQuery {
    /// Present (with any value) to serve the file as an attachment.
    pub download: Option<String>,
    pub filename: Option<String>,
    pub chunk: Option<String>,
    pub store: Option<String>,
}

impl TransferQuery {
    pub fn disposition(&self) -> Disposition {
        match self.download {
            Some(_) => Disposition::Attachment(self.filename.clone()),
            None => Disposition::Inline,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileParams {
    collection: String,
    id: String,
    store: Option<String>,
}

#[derive(Debug, Serialize)]
struct Inserted {
    #[serde(rename = "_id")]
    id: FileId,
}

#[derive(Debug, Serialize)]
struct Updated {
    #[serde(rename = "_id")]
    id: FileId,
    chunk: u64,
}

#[derive(Debug, Serialize)]
struct Removed {
    deleted: bool,
}

struct Shared {
    collections: HashMap<String, Arc<dyn Collection>>,
    responder: TransferResponder,
    parser: RangeParser,
}

/// File transfer endpoints over a set of collections.
///
/// Cheap to clone; all state is immutable after [`FileAccessBuilder::build`].
#[derive(Clone)]
pub struct FileAccess {
    shared: Arc<Shared>,
}

impl FileAccess {
    pub fn builder() -> FileAccessBuilder {
        FileAccessBuilder::default()
    }

    pub fn collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        self.shared
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn responder(&self) -> &TransferResponder {
        &self.shared.responder
    }

    pub fn parser(&self) -> &RangeParser {
        &self.shared.parser
    }

    /// Routes:
    ///
    /// ```text
    /// GET    /{collection}/{id}[/{store}]   download, honoring Range
    /// PUT    /{collection}                  insert a whole file
    /// PUT    /{collection}/{id}?chunk=N     write one upload chunk
    /// DELETE /{collection}/{id}             remove
    /// ```
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        Router::new()
            .route("/{collection}", put(insert))
            .route("/{collection}/{id}", get(download).put(update).delete(remove))
            .route("/{collection}/{id}/{store}", get(download))
            .with_state(self.clone())
    }

    /// Serves `params.id` from `collection`, as a whole or the part the
    /// `Range` header selects.
    async fn serve(
        &self,
        params: &FileParams,
        query: &TransferQuery,
        headers: &HeaderMap,
        identity: Option<&Identity>,
    ) -> Result<Response> {
        let collection = self.collection(&params.collection)?;
        let file = find_file(collection.as_ref(), &params.id).await?;
        ActionGate::check(collection.validators(), Action::Download, &file, identity)?;

        let store_name = params
            .store
            .as_deref()
            .or(query.store.as_deref())
            .unwrap_or(collection.primary_store())
            .to_string();
        let store = collection
            .store(&store_name)
            .ok_or_else(|| Error::StoreNotFound(store_name.clone()))?;
        let copy = file.copy(&store_name).ok_or_else(|| Error::CopyNotFound(store_name.clone()))?;

        let range_header = match headers.get(RANGE) {
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| Error::RangeUnitUnsupported { size: copy.size })?,
            ),
            None => None,
        };
        let range = self.parser().parse(range_header, copy.size)?;
        let head = self
            .responder()
            .respond(collection.name(), &range, copy, &query.disposition())?;

        tracing::debug!(
            "read file \"{}\" bytes {}-{}/{}",
            copy.name,
            range.start(),
            range.end(),
            range.size()
        );
        let body = DownloadStreamer::open(store.as_ref(), &file, &range).await?;
        Ok((head.status, head.headers, body).into_response())
    }
}

impl std::fmt::Debug for FileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.shared.collections.keys().collect();
        names.sort();
        f.debug_struct("FileAccess")
            .field("collections", &names)
            .field("responder", &self.shared.responder)
            .field("parser", &self.shared.parser)
            .finish()
    }
}

/// Collects collections and response header rules for a [`FileAccess`].
#[derive(Default)]
pub struct FileAccessBuilder {
    collections: Vec<Arc<dyn Collection>>,
    headers: HeaderConfig,
    single_byte: SingleByteRange,
}

impl FileAccessBuilder {
    /// Serves `collection` under its own name. A later collection with the
    /// same name replaces an earlier one.
    pub fn collection(mut self, collection: Arc<dyn Collection>) -> Self {
        self.collections.push(collection);
        self
    }

    /// Adds a header to every download.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.global.push((name.into(), value.into()));
        self
    }

    /// Adds a header to downloads from `collection` only.
    pub fn collection_header(
        mut self,
        collection: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers
            .collections
            .entry(collection.into())
            .or_default()
            .push((name.into(), value.into()));
        self
    }

    /// Appends every rule of `config`.
    pub fn headers(mut self, config: HeaderConfig) -> Self {
        self.headers.global.extend(config.global);
        for (collection, pairs) in config.collections {
            self.headers.collections.entry(collection).or_default().extend(pairs);
        }
        self
    }

    pub fn single_byte_ranges(mut self, policy: SingleByteRange) -> Self {
        self.single_byte = policy;
        self
    }

    /// Validates the header rules. Fails with [`Error::InvalidHeader`].
    pub fn build(self) -> Result<FileAccess> {
        let responder = TransferResponder::from_config(&self.headers)?;

        let mut collections = HashMap::new();
        for collection in self.collections {
            let name = collection.name().to_string();
            if collections.insert(name.clone(), collection).is_some() {
                tracing::warn!(
                    collection = %name,
                    "collection registered twice, keeping the last one"
                );
            }
        }

        Ok(FileAccess {
            shared: Arc::new(Shared {
                collections,
                responder,
                parser: RangeParser::new(self.single_byte),
            }),
        })
    }
}

async fn find_file(collection: &dyn Collection, id: &str) -> Result<FileRecord> {
    collection
        .find(&FileId::new(id))
        .await?
        .ok_or_else(|| Error::FileNotFound(id.to_string()))
}

fn acting(identity: &Option<Extension<Identity>>) -> Option<&Identity> {
    identity.as_ref().map(|Extension(identity)| identity)
}

#[tracing::instrument(skip_all, fields(collection = %params.collection, id = %params.id))]
async fn download(
    State(access): State<FileAccess>,
    Path(params): Path<FileParams>,
    Query(query): Query<TransferQuery>,
    identity: Option<Extension<Identity>>,
    headers: HeaderMap,
) -> Result<Response> {
    access.serve(&params, &query, &headers, acting(&identity)).await
}

#[tracing::instrument(skip_all, fields(collection = %collection))]
async fn insert(
    State(access): State<FileAccess>,
    Path(collection): Path<String>,
    Query(query): Query<TransferQuery>,
    identity: Option<Extension<Identity>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Inserted>> {
    let collection = access.collection(&collection)?;
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());

    let id = UploadIngestor::ingest_whole(
        collection.as_ref(),
        query.filename,
        content_type,
        body.into_data_stream(),
        acting(&identity),
    )
    .await?;
    tracing::debug!(%id, "inserted file");
    Ok(Json(Inserted { id }))
}

#[tracing::instrument(skip_all, fields(collection = %params.collection, id = %params.id))]
async fn update(
    State(access): State<FileAccess>,
    Path(params): Path<FileParams>,
    Query(query): Query<TransferQuery>,
    identity: Option<Extension<Identity>>,
    body: Body,
) -> Result<Json<Updated>> {
    let collection = access.collection(&params.collection)?;
    let file = find_file(collection.as_ref(), &params.id).await?;

    let chunk = ChunkIngestor::ingest_chunk(
        collection.as_ref(),
        &file,
        query.chunk.as_deref(),
        body.into_data_stream(),
        acting(&identity),
    )
    .await?;
    Ok(Json(Updated { id: FileId::new(params.id), chunk }))
}

#[tracing::instrument(skip_all, fields(collection = %params.collection, id = %params.id))]
async fn remove(
    State(access): State<FileAccess>,
    Path(params): Path<FileParams>,
    identity: Option<Extension<Identity>>,
) -> Result<Json<Removed>> {
    let collection = access.collection(&params.collection)?;
    let file = find_file(collection.as_ref(), &params.id).await?;
    ActionGate::check(collection.validators(), Action::Remove, &file, acting(&identity))?;

    let deleted = collection.remove(&FileId::new(params.id)).await?;
    Ok(Json(Removed { deleted }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::memory::MemoryCollection;

    #[test]
    fn test_disposition_from_query() {
        let query = TransferQuery::default();
        assert_eq!(Disposition::Inline, query.disposition());

        let query = TransferQuery { download: Some(String::new()), ..Default::default() };
        assert_eq!(Disposition::Attachment(None), query.disposition());

        let query = TransferQuery {
            download: Some("true".to_string()),
            filename: Some("report.pdf".to_string()),
            ..Default::default()
        };
        assert_eq!(Disposition::Attachment(Some("report.pdf".to_string())), query.disposition());
    }

    #[test]
    fn test_build_rejects_bad_header() {
        let result = FileAccess::builder().header("X-Ok", "bad\nvalue").build();
        assert_matches!(result, Err(Error::InvalidHeader(_)));

        let result = FileAccess::builder().collection_header("images", "bad name", "x").build();
        assert_matches!(result, Err(Error::InvalidHeader(_)));
    }

    #[test]
    fn test_collection_lookup() {
        let access = FileAccess::builder()
            .collection(Arc::new(MemoryCollection::new("images")))
            .build()
            .unwrap();

        assert_eq!("images", access.collection("images").unwrap().name());
        assert_matches!(
            access.collection("docs").err(),
            Some(Error::CollectionNotFound(name)) if name == "docs"
        );
    }

    #[test]
    fn test_builder_merges_header_config() {
        let config = HeaderConfig {
            global: vec![("X-B".to_string(), "2".to_string())],
            collections: HashMap::from([(
                "images".to_string(),
                vec![("X-C".to_string(), "3".to_string())],
            )]),
        };
        let access = FileAccess::builder()
            .header("X-A", "1")
            .headers(config)
            .single_byte_ranges(SingleByteRange::Accept)
            .build()
            .unwrap();

        let names: Vec<_> = access
            .responder()
            .extra_headers("images")
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(vec!["x-a", "x-b", "x-c"], names);
        assert_eq!(SingleByteRange::Accept, access.parser().single_byte());
    }
}
