//! Shared helpers for the HTTP tests.

use std::collections::HashMap;
use std::time::SystemTime;

use axum::Router;
use axum_file_access::memory::{MemoryCollection, MEMORY_STORE};
use axum_file_access::{CopyDescriptor, FileId, FileRecord};
use bytes::Bytes;

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn spawn(router: Router) -> String {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Deterministic content of `len` bytes.
#[allow(dead_code)]
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Describes a copy of `size` bytes.
pub fn copy(name: &str, size: u64, content_type: &str) -> CopyDescriptor {
    CopyDescriptor {
        size,
        content_type: Some(content_type.to_string()),
        name: name.to_string(),
        updated_at: SystemTime::now(),
    }
}

/// Registers a record whose copies live in `stores`, without writing data.
#[allow(dead_code)]
pub fn add_record(
    collection: &MemoryCollection,
    id: &str,
    stores: &[(&str, CopyDescriptor)],
) -> FileId {
    let record = FileRecord {
        id: Some(FileId::new(id)),
        name: stores.first().map(|(_, copy)| copy.name.clone()),
        copies: stores
            .iter()
            .map(|(store, copy)| (store.to_string(), copy.clone()))
            .collect::<HashMap<_, _>>(),
    };
    collection.add(record).unwrap()
}

/// Stores `data` in the collection's memory store and registers it.
#[allow(dead_code)]
pub fn add_file(collection: &MemoryCollection, id: &str, name: &str, data: Vec<u8>) -> FileId {
    let size = data.len() as u64;
    collection.primary().put(&FileId::new(id), Bytes::from(data));
    add_record(collection, id, &[(MEMORY_STORE, copy(name, size, "application/pdf"))])
}
