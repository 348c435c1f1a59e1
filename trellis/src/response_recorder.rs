use crate::{
    response_writer::{clone_headers, ResponseWriter},
    NO_WRITTEN,
};
use http_types::{headers::Headers, StatusCode};
use std::fmt::{self, Debug, Formatter};
use trellis_http::{BoxedTransport, Result};

/**
A response writer that records the status code, headers and body
instead of transmitting them, enabling transactional overwrite and
reset until an explicit flush replays everything onto the writer below.
*/
pub struct ResponseRecorder {
    inner: Option<Box<ResponseWriter>>,
    headers: Headers,
    headers_snapshot: Headers,
    status: StatusCode,
    body: Vec<u8>,
    written: i64,
}

impl Debug for ResponseRecorder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRecorder")
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .field("written", &self.written)
            .finish()
    }
}

impl Default for ResponseRecorder {
    fn default() -> Self {
        Self {
            inner: None,
            headers: Headers::new(),
            headers_snapshot: Headers::new(),
            status: StatusCode::Ok,
            body: Vec::new(),
            written: NO_WRITTEN,
        }
    }
}

impl ResponseRecorder {
    /// A recorder with no writer below it, used for detached
    /// snapshots (see [`ResponseWriter::clone_response`]).
    pub fn detached() -> Self {
        Self::default()
    }

    /// Begin recording on top of the provided writer, seeding the
    /// recorded status and headers from its current state.
    pub fn begin_record(inner: ResponseWriter) -> Self {
        let headers = clone_headers(inner.headers());
        Self {
            status: inner.status_code(),
            headers_snapshot: clone_headers(&headers),
            headers,
            inner: Some(Box::new(inner)),
            body: Vec::new(),
            written: NO_WRITTEN,
        }
    }

    pub(crate) fn inner_writer(&self) -> Option<&ResponseWriter> {
        self.inner.as_deref()
    }

    pub(crate) fn inner_writer_mut(&mut self) -> Option<&mut ResponseWriter> {
        self.inner.as_deref_mut()
    }

    /// the recorded headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// mutable access to the recorded headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// the recorded status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// record a status code
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    // written-byte accounting stays with the writer below: nothing
    // recorded here has reached the client until flush
    pub(crate) fn written(&self) -> i64 {
        match &self.inner {
            Some(inner) => inner.written(),
            None => self.written,
        }
    }

    pub(crate) fn set_written(&mut self, n: i64) {
        match &mut self.inner {
            Some(inner) => inner.set_written(n),
            None => self.written = n,
        }
    }

    /// Buffer body bytes, returning the buffered length.
    pub fn write(&mut self, contents: &[u8]) -> usize {
        self.body.extend_from_slice(contents);
        contents.len()
    }

    /// a read-only view of the recorded body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the recorded body.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Discard the recorded body. Nothing is transmitted.
    pub fn reset_body(&mut self) {
        self.body.truncate(0);
    }

    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Restore the recorded headers to their state when recording
    /// began.
    pub fn reset_headers(&mut self) {
        self.headers = clone_headers(&self.headers_snapshot);
    }

    /// Drop all recorded headers.
    pub fn clear_headers(&mut self) {
        self.headers = Headers::new();
    }

    /// Discard everything recorded so far: status, headers and body.
    pub fn reset(&mut self) {
        self.status = StatusCode::Ok;
        self.reset_headers();
        self.reset_body();
    }

    /// Replay the recorded response onto the writer below: status and
    /// headers first, then the pre-flush commit of the inner writer,
    /// then the recorded body.
    pub async fn flush_response(&mut self) -> Result<()> {
        let status = self.status;
        let headers = clone_headers(&self.headers);
        let body = std::mem::take(&mut self.body);

        if let Some(inner) = self.inner.as_deref_mut() {
            inner.write_header(status);
            *inner.headers_mut() = headers;
            inner.flush_response().await?;
            if !body.is_empty() {
                inner.write(&body).await?;
            }
        }
        Ok(())
    }

    /// Recover the writer below, abandoning anything recorded and not
    /// yet flushed.
    pub fn into_inner(self) -> Option<ResponseWriter> {
        self.inner.map(|boxed| *boxed)
    }

    /// Dismantle this recorder into the writer below and everything it
    /// recorded.
    pub fn into_parts(self) -> (Option<ResponseWriter>, StatusCode, Headers, Vec<u8>) {
        (
            self.inner.map(|boxed| *boxed),
            self.status,
            self.headers,
            self.body,
        )
    }

    pub(crate) async fn end_response(self) -> Option<BoxedTransport> {
        match self.inner {
            Some(inner) => inner.end_response().await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BaseWriter, STATUS_CODE_WRITTEN};

    #[test]
    fn recording_buffers_without_side_effects() {
        let base = ResponseWriter::Base(BaseWriter::new());
        let mut recorder = ResponseRecorder::begin_record(base);

        recorder.set_status(StatusCode::Accepted);
        assert_eq!(recorder.write(b"hello"), 5);
        assert_eq!(recorder.body(), b"hello");
        // nothing reached the client, accounting reflects that
        assert_eq!(recorder.written(), NO_WRITTEN);

        recorder.reset_body();
        assert_eq!(recorder.body(), b"");

        // the writer below was never touched
        let inner = recorder.into_inner().unwrap();
        assert_eq!(inner.written(), NO_WRITTEN);
        assert_eq!(inner.status_code(), StatusCode::Ok);
    }

    #[test]
    fn set_written_accepts_sentinels_only() {
        let mut writer = ResponseWriter::Recorder(ResponseRecorder::detached());
        writer.set_written(100);
        assert_eq!(writer.written(), NO_WRITTEN);
        writer.set_written(STATUS_CODE_WRITTEN);
        assert_eq!(writer.written(), STATUS_CODE_WRITTEN);
    }
}
