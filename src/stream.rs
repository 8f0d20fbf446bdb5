use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use futures_util::StreamExt;
use http_body::{Body, Frame, SizeHint};
use pin_project::{pin_project, pinned_drop};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::store::{ByteStream, FileRecord, StorageAdapter, StoreError};
use crate::ByteRange;

/// Moves the bytes of a [`ByteRange`] from a storage backend to a client.
pub struct DownloadStreamer;

impl DownloadStreamer {
    /// Opens a read stream bounded to `range` and waits for its first chunk.
    ///
    /// Failures that happen while the backend opens the object are returned
    /// here, before any response head is committed. Later failures end the
    /// returned stream with an error, see [`RangedStream`].
    pub async fn open(
        adapter: &dyn StorageAdapter,
        file: &FileRecord,
        range: &ByteRange,
    ) -> Result<RangedStream<ByteStream>> {
        if range.is_empty() {
            return Ok(RangedStream::new(Box::pin(futures::stream::empty()), None, 0));
        }

        let mut inner = adapter
            .create_read_stream(file, range.start(), range.end())
            .await
            .map_err(|e| Error::streaming(&e))?;

        let first = match inner.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(Error::streaming(&e)),
            None => {
                let err = StoreError::Unavailable("storage returned no data".to_string());
                return Err(Error::streaming(&err));
            }
        };

        Ok(RangedStream::new(inner, Some(first), range.len()))
    }

    /// Copies `stream` into `sink` in order, returning the bytes written and
    /// how the transfer ended. The sink's write readiness paces the source.
    pub async fn pipe<S, W>(stream: RangedStream<S>, sink: &mut W) -> (u64, Result<()>)
    where
        S: Stream<Item = std::result::Result<Bytes, StoreError>>,
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        futures::pin_mut!(stream);

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => return (written, Err(Error::streaming(&e))),
            };
            if let Err(e) = sink.write_all(&chunk).await {
                return (written, Err(Error::streaming(&StoreError::Io(e))));
            }
            written += chunk.len() as u64;
        }

        match sink.flush().await {
            Ok(()) => (written, Ok(())),
            Err(e) => (written, Err(Error::streaming(&StoreError::Io(e)))),
        }
    }

    /// [`open`](Self::open) followed by [`pipe`](Self::pipe).
    pub async fn stream<W>(
        adapter: &dyn StorageAdapter,
        file: &FileRecord,
        range: &ByteRange,
        sink: &mut W,
    ) -> (u64, Result<()>)
    where
        W: AsyncWrite + Unpin,
    {
        match Self::open(adapter, file, range).await {
            Ok(stream) => Self::pipe(stream, sink).await,
            Err(e) => (0, Err(e)),
        }
    }
}

/// Response body over a bounded storage read. Implements [`Stream`],
/// [`Body`], and [`IntoResponse`].
///
/// Yields exactly the range length. Surplus backend bytes are dropped; a
/// backend error, or an end of data before the range is complete, ends the
/// stream with an error. Served through axum, that error aborts the
/// connection, so the client sees fewer bytes than `Content-Length` and
/// never a clean end of body.
#[pin_project(PinnedDrop)]
pub struct RangedStream<S> {
    pending: Option<Bytes>,
    remaining: u64,
    length: u64,
    failed: bool,
    #[pin]
    inner: S,
}

impl<S> RangedStream<S> {
    pub(crate) fn new(inner: S, pending: Option<Bytes>, length: u64) -> Self {
        RangedStream {
            pending,
            remaining: length,
            length,
            failed: false,
            inner,
        }
    }

    /// Bytes the stream has yet to produce.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

#[pinned_drop]
impl<S> PinnedDrop for RangedStream<S> {
    fn drop(self: Pin<&mut Self>) {
        if self.remaining > 0 && !self.failed {
            tracing::debug!(
                sent = self.length - self.remaining,
                length = self.length,
                "download dropped before completion, releasing storage stream"
            );
        }
    }
}

impl<S> Stream for RangedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, StoreError>>,
{
    type Item = std::result::Result<Bytes, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.remaining == 0 || *this.failed {
            return Poll::Ready(None);
        }

        let chunk = match this.pending.take() {
            Some(chunk) => chunk,
            None => match this.inner.poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => chunk,
                Poll::Ready(Some(Err(e))) => {
                    *this.failed = true;
                    tracing::error!(
                        error = %e,
                        sent = *this.length - *this.remaining,
                        length = *this.length,
                        "storage stream failed mid-transfer"
                    );
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.failed = true;
                    let sent = *this.length - *this.remaining;
                    tracing::error!(sent, length = *this.length, "storage stream ended early");
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("storage ended after {sent} of {} bytes", this.length),
                    );
                    return Poll::Ready(Some(Err(StoreError::Io(err))));
                }
            },
        };

        // remaining is non-zero here, so this only ever clips surplus bytes
        let take = usize::try_from(*this.remaining).unwrap_or(usize::MAX).min(chunk.len());
        let chunk = chunk.slice(..take);
        *this.remaining -= take as u64;

        Poll::Ready(Some(Ok(chunk)))
    }
}

impl<S> Body for RangedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, StoreError>>,
{
    type Data = Bytes;
    type Error = StoreError;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == 0
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, StoreError>>> {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<S> IntoResponse for RangedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, StoreError>> + Send + 'static,
{
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}
