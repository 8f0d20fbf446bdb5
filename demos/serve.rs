//! Serves files over HTTP.
//!
//! ```text
//! cargo run --example serve -- [FILE...]
//! ```
//!
//! Every FILE is inserted into the `files` collection at startup and its id
//! printed. Set `DATA_DIR` to keep bytes and upload chunks on disk instead
//! of in memory.
//!
//! ```text
//! curl -H 'Range: bytes=0-99' http://localhost:3000/files/<id>
//! curl -T notes.txt 'http://localhost:3000/files?filename=notes.txt'
//! curl -T part0 'http://localhost:3000/files/<id>?chunk=0'
//! curl -X DELETE http://localhost:3000/files/<id>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use axum_file_access::memory::MemoryCollection;
use axum_file_access::{
    Attachment, Collection, FileAccess, FileRecord, FsStore, FsTempStore, NewFile,
};
use bytes::Bytes;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axum_file_access=debug".into()),
        )
        .init();

    let mut collection = MemoryCollection::new("files");
    if let Some(dir) = std::env::var_os("DATA_DIR").map(PathBuf::from) {
        tracing::info!(dir = %dir.display(), "storing files on disk");
        collection = collection
            .with_primary_store("fs", Arc::new(FsStore::new(dir.join("store"))))
            .with_temp_store(FsTempStore::new(dir.join("chunks")));
    }

    for path in std::env::args().skip(1).map(PathBuf::from) {
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(path = %path.display(), "could not read file: {e}");
                continue;
            }
        };
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let content_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();
        let file = NewFile {
            record: FileRecord::unsaved(name),
            attachment: Attachment { content_type, data: Bytes::from(data) },
        };
        match collection.insert(file).await {
            Ok(id) => println!("{} -> /files/{id}", path.display()),
            Err(e) => tracing::error!(path = %path.display(), "could not store file: {e}"),
        }
    }

    let access = FileAccess::builder()
        .collection(Arc::new(collection))
        .header("Cache-Control", "max-age=3600")
        .build()
        .unwrap();

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, access.router()).await.unwrap();
}
