use crate::{Pool, ResponseWriter};
use async_compression::futures::bufread::GzipEncoder;
use futures_lite::{io::Cursor, AsyncReadExt};
use http_types::headers::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use std::{
    fmt::{self, Debug, Formatter},
    sync::OnceLock,
};
use trellis_http::{BoxedTransport, Result};

/**
A response writer that buffers uncompressed chunks and compresses them
onto the writer below on flush.

It is a separate layer because the framework can fall back and roll the
compression back if something goes wrong with the response, writing
http errors in plain form instead: see
[`GzipResponseWriter::disable`].
*/
pub struct GzipResponseWriter {
    inner: Option<Box<ResponseWriter>>,
    chunks: Vec<u8>,
    disabled: bool,
}

impl Debug for GzipResponseWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipResponseWriter")
            .field("buffered", &self.chunks.len())
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl Default for GzipResponseWriter {
    fn default() -> Self {
        Self {
            inner: None,
            chunks: Vec::new(),
            disabled: false,
        }
    }
}

impl GzipResponseWriter {
    /// Prepare this gzip writer on top of the provided writer. Called
    /// per-request when a handler upgrades the response to gzip.
    pub fn begin_gzip_response(&mut self, inner: ResponseWriter) {
        self.inner = Some(Box::new(inner));
        self.chunks.truncate(0);
        self.disabled = false;
    }

    pub(crate) fn inner(&self) -> &ResponseWriter {
        self.inner
            .as_deref()
            .expect("gzip response writer used before begin_gzip_response")
    }

    pub(crate) fn inner_mut(&mut self) -> &mut ResponseWriter {
        self.inner
            .as_deref_mut()
            .expect("gzip response writer used before begin_gzip_response")
    }

    /// Buffer bytes for compression, returning the uncompressed
    /// length. Nothing reaches the wire until flush.
    pub fn write(&mut self, contents: &[u8]) -> usize {
        self.chunks.extend_from_slice(contents);
        contents.len()
    }

    /// Buffer a string for compression, setting a plain-text content
    /// type when none has been set.
    pub fn write_string(&mut self, contents: &str) -> usize {
        let n = self.write(contents.as_bytes());
        if self.inner().headers().get(CONTENT_TYPE).is_none() {
            self.inner_mut()
                .headers_mut()
                .insert(CONTENT_TYPE, "text/plain; charset=utf-8");
        }
        n
    }

    /**
    Compress and transmit `contents` to the writer below right now,
    returning the compressed length. In disabled (pass-through) mode
    the bytes are written as they are and no compression headers are
    added.

    Note that after this no new headers can reach the client.
    */
    pub async fn write_now(&mut self, contents: &[u8]) -> Result<usize> {
        if self.disabled {
            return self.inner_mut().write(contents).await;
        }

        add_gzip_headers(self.inner_mut());
        // Content-Length would describe the uncompressed body, it
        // must not accompany compressed output
        self.inner_mut().headers_mut().remove(CONTENT_LENGTH);

        let mut data = Vec::new();
        let mut encoder = GzipEncoder::new(Cursor::new(contents));
        encoder.read_to_end(&mut data).await?;
        log::trace!("gzipped body from {} to {}", contents.len(), data.len());
        self.inner_mut().write(&data).await
    }

    /// Compress and transmit everything buffered, then commit the
    /// writer below.
    pub async fn flush_response(&mut self) -> Result<()> {
        let chunks = std::mem::take(&mut self.chunks);
        self.write_now(&chunks).await?;
        self.inner_mut().flush_response().await
    }

    /// Discard the buffered chunks without transmitting them.
    pub fn reset_body(&mut self) {
        self.chunks.truncate(0);
    }

    /// Switch subsequent writes to pass-through: contents will reach
    /// the client in plain form.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    /// Whether this writer is in pass-through mode.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Recover the writer below, abandoning any buffered chunks.
    pub fn into_inner(mut self) -> Option<ResponseWriter> {
        self.inner.take().map(|boxed| *boxed)
    }

    pub(crate) async fn end_response(mut self) -> Option<BoxedTransport> {
        let inner = self.inner.take();
        self.chunks.truncate(0);
        self.disabled = false;
        gzip_writer_pool().put(self);
        match inner {
            Some(inner) => inner.end_response().await,
            None => None,
        }
    }
}

/// Add the headers that must accompany compressed output: `Vary:
/// Accept-Encoding` and `Content-Encoding: gzip`.
pub fn add_gzip_headers(writer: &mut ResponseWriter) {
    let headers = writer.headers_mut();
    if !headers
        .get(VARY)
        .map(|vary| vary.as_str().to_ascii_lowercase().contains("accept-encoding"))
        .unwrap_or_default()
    {
        headers.append(VARY, ACCEPT_ENCODING.as_str());
    }
    if headers.get(CONTENT_ENCODING).is_none() {
        headers.append(CONTENT_ENCODING, "gzip");
    }
}

/// The process-wide pool that recycles [`GzipResponseWriter`] values
/// across requests.
pub fn gzip_writer_pool() -> &'static Pool<GzipResponseWriter> {
    static POOL: OnceLock<Pool<GzipResponseWriter>> = OnceLock::new();
    POOL.get_or_init(Pool::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResponseRecorder;
    use http_types::StatusCode;

    fn gzip_over_recorder() -> GzipResponseWriter {
        // a detached recorder stands in for the wire
        let recorder = ResponseRecorder::detached();
        let mut gzip = GzipResponseWriter::default();
        gzip.begin_gzip_response(ResponseWriter::Recorder(recorder));
        gzip
    }

    #[test]
    fn write_buffers_and_reports_uncompressed_len() {
        let mut gzip = gzip_over_recorder();
        assert_eq!(gzip.write(b"hello"), 5);
        assert_eq!(gzip.write(b" world"), 6);
        assert_eq!(gzip.inner().written(), crate::NO_WRITTEN);
    }

    #[test]
    fn flush_compresses_and_sets_headers() {
        smol::block_on(async {
            let mut gzip = gzip_over_recorder();
            gzip.write(b"hello hello hello hello");
            gzip.flush_response().await.unwrap();

            let mut inner = gzip.into_inner().unwrap();
            assert_eq!(
                inner.headers().get(CONTENT_ENCODING).map(|v| v.as_str()),
                Some("gzip")
            );
            assert_eq!(
                inner.headers().get(VARY).map(|v| v.as_str()),
                Some("accept-encoding")
            );
            assert!(inner.headers().get(CONTENT_LENGTH).is_none());

            let recorder = inner.recorder_mut().unwrap();
            assert!(!recorder.body().is_empty());
            assert_ne!(recorder.body(), b"hello hello hello hello");
        });
    }

    #[test]
    fn disabled_passes_through_without_headers() {
        smol::block_on(async {
            let mut gzip = gzip_over_recorder();
            gzip.disable();
            gzip.write(b"plain");
            gzip.flush_response().await.unwrap();

            let mut inner = gzip.into_inner().unwrap();
            assert!(inner.headers().get(CONTENT_ENCODING).is_none());
            assert!(inner.headers().get(VARY).is_none());
            let recorder = inner.recorder_mut().unwrap();
            assert_eq!(recorder.body(), b"plain");
            assert_eq!(recorder.status(), StatusCode::Ok);
        });
    }
}
