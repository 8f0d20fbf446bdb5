//! # axum-file-access
//!
//! HTTP access to stored files for [`axum`][1]: single byte-range downloads,
//! resumable chunked uploads, whole-file inserts and deletes.
//!
//! The crate owns the protocol layer only. File metadata lives behind the
//! [`Collection`] trait, bytes behind [`StorageAdapter`] and upload chunks
//! behind [`TempStore`]. Permissions are decided by the [`Validator`]s a
//! collection registers per [`Action`].
//!
//! ```
//! use axum_file_access::{parse_range, ByteRange};
//!
//! let range = parse_range(Some("bytes=0-32767"), 100_000).unwrap();
//! assert_eq!((0, 32767, 32768), (range.start(), range.end(), range.len()));
//! assert!(range.is_partial());
//!
//! let whole = parse_range(None, 1000).unwrap();
//! assert_eq!(ByteRange::full(1000), whole);
//! ```
//!
//! Serving a collection:
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum_file_access::FileAccess;
//! use axum_file_access::memory::MemoryCollection;
//!
//! #[tokio::main]
//! async fn main() {
//!     let access = FileAccess::builder()
//!         .collection(Arc::new(MemoryCollection::new("images")))
//!         .header("Cache-Control", "max-age=3600")
//!         .build()
//!         .unwrap();
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, access.router()).await.unwrap();
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

mod error;
mod file;
mod gate;
mod handlers;
mod headers;
mod ingest;
pub mod memory;
mod store;
mod stream;

use std::fmt;

pub use error::{Error, ErrorResponse, Result};
pub use file::{FsStore, FsTempStore};
pub use gate::{Action, ActionGate, Identity, Validator, ValidatorSet, Verdict};
pub use handlers::{FileAccess, FileAccessBuilder, TransferQuery};
pub use headers::{build_response, Disposition, HeaderConfig, ResponseHead, TransferResponder};
pub use ingest::{ChunkIngestor, UploadIngestor};
pub use store::{
    Attachment, ByteStream, ChunkSink, Collection, CopyDescriptor, FileId, FileRecord, NewFile,
    StorageAdapter, StoreError, TempStore,
};
pub use stream::{DownloadStreamer, RangedStream};

/// Unit of a byte range. Only `bytes` is understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeUnit {
    Bytes,
}

impl RangeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeUnit::Bytes => "bytes",
        }
    }
}

impl fmt::Display for RangeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated inclusive range `[start, end]` into a resource of `size`
/// bytes.
///
/// Only [`RangeParser`] and [`ByteRange::full`] construct values, so
/// `start <= end < size` holds for every non-empty range. The single
/// exception is the whole-resource range of an empty resource, for which
/// [`ByteRange::is_empty`] is true and nothing is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    start: u64,
    end: u64,
    size: u64,
    unit: RangeUnit,
    partial: bool,
}

impl ByteRange {
    /// The whole resource, as served when no range was requested.
    pub fn full(size: u64) -> Self {
        ByteRange {
            start: 0,
            end: size.saturating_sub(1),
            size,
            unit: RangeUnit::Bytes,
            partial: false,
        }
    }

    /// Inclusive offset of the first byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive offset of the last byte.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered, `end - start + 1`.
    pub fn len(&self) -> u64 {
        if self.size == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of the underlying resource.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn unit(&self) -> RangeUnit {
        self.unit
    }

    /// True when the range came from a client `Range` header.
    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

/// How a range whose start equals its end is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SingleByteRange {
    /// `bytes=N-N` is unsatisfiable; a range must satisfy `start < end`.
    #[default]
    Reject,
    /// `bytes=N-N` selects the one byte at offset `N`.
    Accept,
}

/// Parses `Range` request headers into [`ByteRange`]s.
///
/// Only a single contiguous `bytes` range is understood:
///
/// ```text
/// bytes=<start>-<end>    inclusive
/// bytes=<start>-         through the last byte
/// ```
///
/// Suffix ranges (`bytes=-N`) and range lists are rejected as
/// unsatisfiable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeParser {
    single_byte: SingleByteRange,
}

impl RangeParser {
    pub fn new(single_byte: SingleByteRange) -> Self {
        RangeParser { single_byte }
    }

    pub fn single_byte(&self) -> SingleByteRange {
        self.single_byte
    }

    /// Parses `header` against a resource of `total_size` bytes. An absent
    /// header yields [`ByteRange::full`].
    pub fn parse(&self, header: Option<&str>, total_size: u64) -> Result<ByteRange> {
        let Some(header) = header else {
            return Ok(ByteRange::full(total_size));
        };

        let unsupported = || Error::RangeUnitUnsupported { size: total_size };
        let unsatisfiable = || Error::RangeNotSatisfiable { size: total_size };

        let parts: Vec<&str> = header.split('=').collect();
        let [unit, bounds] = parts[..] else {
            return Err(unsupported());
        };
        if unit != RangeUnit::Bytes.as_str() {
            return Err(unsupported());
        }

        let bounds: Vec<&str> = bounds.split('-').collect();
        let (start, end) = match bounds[..] {
            [start] | [start, ""] => (start, None),
            [start, end] => (start, Some(end)),
            _ => return Err(unsatisfiable()),
        };

        let start = parse_offset(start).ok_or_else(unsatisfiable)?;
        let end = match end {
            Some(end) => parse_offset(end).ok_or_else(unsatisfiable)?,
            None => total_size.checked_sub(1).ok_or_else(unsatisfiable)?,
        };

        let ordered = match self.single_byte {
            SingleByteRange::Reject => start < end,
            SingleByteRange::Accept => start <= end,
        };
        if !ordered || end >= total_size {
            return Err(unsatisfiable());
        }

        Ok(ByteRange {
            start,
            end,
            size: total_size,
            unit: RangeUnit::Bytes,
            partial: true,
        })
    }
}

/// Parses a `Range` header with the default [`RangeParser`].
pub fn parse_range(header: Option<&str>, total_size: u64) -> Result<ByteRange> {
    RangeParser::default().parse(header, total_size)
}

fn parse_offset(token: &str) -> Option<u64> {
    let token = token.trim();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}
