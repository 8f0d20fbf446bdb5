//! Response header assembly for downloads.

use std::collections::HashMap;

use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, HeaderMapExt, LastModified};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::CopyDescriptor;
use crate::ByteRange;

/// Extra response headers added to every download, as loaded from
/// configuration. Pairs are applied in order, global ones first.
///
/// ```json
/// {
///   "global": [["Cache-Control", "max-age=3600"]],
///   "collections": { "images": [["X-Collection", "images"]] }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeaderConfig {
    #[serde(default)]
    pub global: Vec<(String, String)>,
    #[serde(default)]
    pub collections: HashMap<String, Vec<(String, String)>>,
}

type HeaderPair = (HeaderName, HeaderValue);

const OCTET_STREAM: &str = "application/octet-stream";

fn header_pair(name: &str, value: &str) -> Result<HeaderPair> {
    let name =
        HeaderName::try_from(name).map_err(|e| Error::InvalidHeader(format!("{name}: {e}")))?;
    let value =
        HeaderValue::try_from(value).map_err(|e| Error::InvalidHeader(format!("{name}: {e}")))?;
    Ok((name, value))
}

/// How the client should present the body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Inline,
    /// Download as a file; the name defaults to the copy's name.
    Attachment(Option<String>),
}

/// Status line and headers of a download response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Builds download response heads. Holds the validated extra headers and
/// never changes after construction.
#[derive(Debug, Clone, Default)]
pub struct TransferResponder {
    global: Vec<HeaderPair>,
    by_collection: HashMap<String, Vec<HeaderPair>>,
}

impl TransferResponder {
    /// Validates every configured header name and value.
    pub fn from_config(config: &HeaderConfig) -> Result<Self> {
        let global = config
            .global
            .iter()
            .map(|(name, value)| header_pair(name, value))
            .collect::<Result<_>>()?;
        let by_collection = config
            .collections
            .iter()
            .map(|(collection, pairs)| {
                let pairs = pairs
                    .iter()
                    .map(|(name, value)| header_pair(name, value))
                    .collect::<Result<_>>()?;
                Ok::<_, Error>((collection.clone(), pairs))
            })
            .collect::<Result<_>>()?;
        Ok(TransferResponder { global, by_collection })
    }

    /// Extra headers for `collection`: global ones, then the collection's.
    pub fn extra_headers<'a>(
        &'a self,
        collection: &str,
    ) -> impl Iterator<Item = &'a HeaderPair> + 'a {
        let scoped = self.by_collection.get(collection).map(Vec::as_slice).unwrap_or(&[]);
        self.global.iter().chain(scoped.iter())
    }

    /// Head for serving `range` of `copy` from `collection`.
    pub fn respond(
        &self,
        collection: &str,
        range: &ByteRange,
        copy: &CopyDescriptor,
        disposition: &Disposition,
    ) -> Result<ResponseHead> {
        build_response(range, copy, disposition, self.extra_headers(collection))
    }
}

/// Computes status and headers for a download. Pure: equal inputs give
/// equal heads.
///
/// Extra headers are appended after the computed ones and never replace
/// them; a repeated name produces several values.
pub fn build_response<'a>(
    range: &ByteRange,
    copy: &CopyDescriptor,
    disposition: &Disposition,
    extra: impl IntoIterator<Item = &'a HeaderPair>,
) -> Result<ResponseHead> {
    let mut headers = HeaderMap::new();

    let content_type = copy
        .content_type
        .as_deref()
        .and_then(|t| HeaderValue::from_str(t).ok())
        .unwrap_or_else(|| HeaderValue::from_static(OCTET_STREAM));
    headers.insert(CONTENT_TYPE, content_type);

    let content_disposition = match disposition {
        Disposition::Inline => HeaderValue::from_static("inline"),
        Disposition::Attachment(filename) => {
            let filename = filename.as_deref().unwrap_or(&copy.name);
            let value = format!("attachment; filename=\"{}\"", escape_quoted(filename));
            HeaderValue::from_str(&value)
                .map_err(|_| Error::BadRequest(format!("invalid filename {filename:?}")))?
        }
    };
    headers.insert(CONTENT_DISPOSITION, content_disposition);

    let status = if range.is_partial() {
        let content_range = ContentRange::bytes(range.start()..=range.end(), range.size())
            .map_err(|_| Error::RangeNotSatisfiable { size: range.size() })?;
        headers.typed_insert(AcceptRanges::bytes());
        headers.typed_insert(content_range);
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    headers.typed_insert(ContentLength(range.len()));
    headers.typed_insert(LastModified::from(copy.updated_at));

    for (name, value) in extra {
        headers.append(name.clone(), value.clone());
    }

    Ok(ResponseHead { status, headers })
}

fn escape_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
