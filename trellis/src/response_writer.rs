use crate::{
    gzip_writer::GzipResponseWriter, handler::BoxFuture, response_recorder::ResponseRecorder,
    Pool,
};
use futures_lite::AsyncWriteExt;
use http_types::{
    headers::{Headers, CONTENT_LENGTH, DATE, TRANSFER_ENCODING},
    StatusCode, Version,
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::OnceLock,
};
use trellis_http::{BoxedTransport, Error, Result};

/// Sentinel for [`ResponseWriter::written`]: nothing has been
/// transmitted yet and the response writer is still live.
pub const NO_WRITTEN: i64 = -1;

/// Sentinel for [`ResponseWriter::written`]: the status code and
/// headers were transmitted but no body bytes were.
pub const STATUS_CODE_WRITTEN: i64 = 0;

/// The single pre-flush callback slot. Registered via
/// [`ResponseWriter::set_before_flush`], invoked exactly once just
/// before the response is committed to the wire. Last writer wins.
pub type BeforeFlush = Box<dyn FnOnce() + Send + 'static>;

const SERVER: &str = concat!("trellis/", env!("CARGO_PKG_VERSION"));

/**
The layered response writer a [`Context`](crate::Context) owns.

Exactly one writer is active per context at a time. It starts as
[`BaseWriter`], which owns the connection transport and performs the
actual wire writes; layering a recorder or gzip writer on top wraps the
current writer and installs the new layer as the context's writer.
*/
pub enum ResponseWriter {
    /// writes directly to the transport
    Base(BaseWriter),
    /// buffers status, headers and body for transactional replay
    Recorder(ResponseRecorder),
    /// buffers uncompressed chunks and compresses on flush
    Gzip(GzipResponseWriter),
}

impl Debug for ResponseWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base(_) => f.write_str("ResponseWriter::Base"),
            Self::Recorder(_) => f.write_str("ResponseWriter::Recorder"),
            Self::Gzip(_) => f.write_str("ResponseWriter::Gzip"),
        }
    }
}

impl ResponseWriter {
    /// the response headers as they will be (or were) transmitted
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Base(w) => &w.headers,
            Self::Recorder(w) => w.headers(),
            Self::Gzip(w) => w.inner().headers(),
        }
    }

    /// mutable access to the response headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Base(w) => &mut w.headers,
            Self::Recorder(w) => w.headers_mut(),
            Self::Gzip(w) => w.inner_mut().headers_mut(),
        }
    }

    /// Record the status code to transmit. Does not transmit anything:
    /// the status goes out at the earliest of the first body byte, an
    /// explicit flush, or end-of-request.
    pub fn write_header(&mut self, status: StatusCode) {
        match self {
            Self::Base(w) => w.status = status,
            Self::Recorder(w) => w.set_status(status),
            Self::Gzip(w) => w.inner_mut().write_header(status),
        }
    }

    /// the status code as currently recorded
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Base(w) => w.status,
            Self::Recorder(w) => w.status(),
            Self::Gzip(w) => w.inner().status_code(),
        }
    }

    /// Total bytes accounted to the client: [`NO_WRITTEN`] before
    /// anything happened, [`STATUS_CODE_WRITTEN`] after only the head,
    /// a positive count of body bytes after that.
    pub fn written(&self) -> i64 {
        match self {
            Self::Base(w) => w.written,
            Self::Recorder(w) => w.written(),
            Self::Gzip(w) => w.inner().written(),
        }
    }

    /// Manually account written bytes; only the [`NO_WRITTEN`] and
    /// [`STATUS_CODE_WRITTEN`] sentinels are accepted.
    pub fn set_written(&mut self, n: i64) {
        if (NO_WRITTEN..=STATUS_CODE_WRITTEN).contains(&n) {
            match self {
                Self::Base(w) => w.written = n,
                Self::Recorder(w) => w.set_written(n),
                Self::Gzip(w) => w.inner_mut().set_written(n),
            }
        }
    }

    /// Write body bytes. The base writer transmits (sending the
    /// deferred head first if needed); the recorder and gzip layers
    /// buffer and report the uncompressed length.
    pub async fn write(&mut self, contents: &[u8]) -> Result<usize> {
        match self {
            Self::Base(w) => w.write(contents).await,
            Self::Recorder(w) => Ok(w.write(contents)),
            Self::Gzip(w) => Ok(w.write(contents)),
        }
    }

    /// Write a string body. See [`ResponseWriter::write`]. The gzip
    /// layer additionally defaults the content type to plain text.
    pub async fn write_string(&mut self, contents: &str) -> Result<usize> {
        match self {
            Self::Gzip(w) => Ok(w.write_string(contents)),
            _ => self.write(contents.as_bytes()).await,
        }
    }

    /// Write formatted content to the response.
    pub async fn writef(&mut self, args: fmt::Arguments<'_>) -> Result<usize> {
        let contents = fmt::format(args);
        self.write(contents.as_bytes()).await
    }

    /**
    Commit the response: run the pre-flush callback (exactly once),
    then make sure the status and headers have been transmitted. For
    the buffering layers this is the point where their content reaches
    the writer below.

    `flush_response` may be called before `end_response`, but it should
    be the last write-path call on this response writer.
    */
    pub fn flush_response(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self {
                Self::Base(w) => w.flush_response().await,
                Self::Recorder(w) => w.flush_response().await,
                Self::Gzip(w) => w.flush_response().await,
            }
        })
    }

    /// Push any buffered transport data toward the client without
    /// committing the response. Used between stream-writer iterations.
    pub fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self {
                Self::Base(w) => match &mut w.transport {
                    Some(transport) => Ok(transport.flush().await?),
                    None => Err(Error::WriterDetached),
                },
                Self::Recorder(w) => match w.inner_writer_mut() {
                    Some(inner) => inner.flush().await,
                    None => Ok(()),
                },
                Self::Gzip(w) => w.inner_mut().flush().await,
            }
        })
    }

    /**
    The final call on a response writer. Terminates the wire framing,
    returns every layer to its pool, and yields the transport back for
    connection reuse. The writer must not be used afterwards, which the
    by-value receiver enforces.
    */
    pub fn end_response(self) -> BoxFuture<'static, Option<BoxedTransport>> {
        Box::pin(async move {
            match self {
                Self::Base(w) => w.end_response().await,
                Self::Recorder(w) => w.end_response().await,
                Self::Gzip(w) => w.end_response().await,
            }
        })
    }

    /// Register the pre-flush callback. The slot holds exactly one
    /// callback; registering again replaces the previous one.
    pub fn set_before_flush(&mut self, cb: BeforeFlush) {
        match self {
            Self::Base(w) => w.before_flush = Some(cb),
            Self::Recorder(w) => match w.inner_writer_mut() {
                Some(inner) => inner.set_before_flush(cb),
                None => {}
            },
            Self::Gzip(w) => w.inner_mut().set_before_flush(cb),
        }
    }

    /// Whether a pre-flush callback is currently registered.
    pub fn has_before_flush(&self) -> bool {
        match self {
            Self::Base(w) => w.before_flush.is_some(),
            Self::Recorder(w) => w
                .inner_writer()
                .map(ResponseWriter::has_before_flush)
                .unwrap_or_default(),
            Self::Gzip(w) => w.inner().has_before_flush(),
        }
    }

    /// A channel that receives at most one message, when the client
    /// connection is observed to have gone away.
    pub fn close_notify(&self) -> async_channel::Receiver<()> {
        match self {
            Self::Base(w) => w.close_rx.clone(),
            Self::Recorder(w) => match w.inner_writer() {
                Some(inner) => inner.close_notify(),
                None => async_channel::bounded(1).1,
            },
            Self::Gzip(w) => w.inner().close_notify(),
        }
    }

    /**
    Take over the connection. The http machinery will not touch the
    transport again; managing and closing it becomes the caller's
    responsibility. Only the base writer can be hijacked.
    */
    pub fn hijack(&mut self) -> Result<BoxedTransport> {
        match self {
            Self::Base(w) => {
                w.written = STATUS_CODE_WRITTEN;
                w.transport.take().ok_or(Error::WriterDetached)
            }
            Self::Recorder(_) | Self::Gzip(_) => Err(Error::HijackNotSupported),
        }
    }

    /// Initiate a server push. Always fails: push is an http/2 feature
    /// and this writer speaks http/1.x.
    pub fn push(&mut self, _target: &str) -> Result<()> {
        Err(Error::PushNotSupported)
    }

    /**
    A detached copy of this writer's current status, headers and
    written count, in recorder form. The copy holds no transport and
    can be inspected or replayed without affecting this writer.
    */
    pub fn clone_response(&self) -> ResponseWriter {
        let mut recorder = ResponseRecorder::detached();
        recorder.set_status(self.status_code());
        recorder.set_written(self.written());
        *recorder.headers_mut() = clone_headers(self.headers());
        ResponseWriter::Recorder(recorder)
    }

    /**
    Replay this writer's recorded state (status, headers, and body when
    this is a recorder) onto another writer. Failure status codes are
    first-class: a successful status is not forced onto the target.
    */
    pub async fn write_to(&mut self, to: &mut ResponseWriter) -> Result<()> {
        if crate::status_code_not_successful(self.status_code()) {
            to.write_header(self.status_code());
        }

        for (name, values) in self.headers().iter() {
            if to.headers().get(name.clone()).is_none() {
                for value in values.iter() {
                    to.headers_mut().append(name.clone(), value.clone());
                }
            }
        }

        if let Self::Recorder(recorder) = self {
            let body = recorder.take_body();
            if !body.is_empty() {
                to.write(&body).await?;
            }
        }

        Ok(())
    }

    /// Whether the active layer is the recording writer.
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recorder(_))
    }

    /// The recording layer, when active.
    pub fn recorder_mut(&mut self) -> Option<&mut ResponseRecorder> {
        match self {
            Self::Recorder(w) => Some(w),
            _ => None,
        }
    }

    /// The gzip layer, when active.
    pub fn gzip_mut(&mut self) -> Option<&mut GzipResponseWriter> {
        match self {
            Self::Gzip(w) => Some(w),
            _ => None,
        }
    }
}

/**
The basic response writer. It writes directly to the transport it was
bound to at `begin_response`, deferring the status line and headers
until the first body byte or an explicit flush.
*/
pub struct BaseWriter {
    pub(crate) transport: Option<BoxedTransport>,
    pub(crate) headers: Headers,
    pub(crate) status: StatusCode,
    pub(crate) written: i64,
    pub(crate) before_flush: Option<BeforeFlush>,
    pub(crate) version: Version,
    pub(crate) head_request: bool,
    chunked: bool,
    pub(crate) close_tx: async_channel::Sender<()>,
    pub(crate) close_rx: async_channel::Receiver<()>,
}

impl Debug for BaseWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseWriter")
            .field("status", &self.status)
            .field("written", &self.written)
            .field("chunked", &self.chunked)
            .finish()
    }
}

impl Default for BaseWriter {
    fn default() -> Self {
        let (close_tx, close_rx) = async_channel::bounded(1);
        Self {
            transport: None,
            headers: Headers::new(),
            status: StatusCode::Ok,
            written: NO_WRITTEN,
            before_flush: None,
            version: Version::Http1_1,
            head_request: false,
            chunked: false,
            close_tx,
            close_rx,
        }
    }
}

impl BaseWriter {
    /// Construct a base writer that is not yet bound to a transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// The response headers of this writer.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the response headers, for pre-routing
    /// wrappers operating on the raw writer.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The recorded status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Record a status code without transmitting it.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Take the transport out of this writer, detaching it. Raw
    /// handlers installed through a router downgrade use this to own
    /// the connection.
    pub fn take_transport(&mut self) -> Option<BoxedTransport> {
        self.transport.take()
    }

    /// Bind this writer to a transport and reset all per-response
    /// state. Called once per request, before any handler runs.
    pub fn begin_response(
        &mut self,
        transport: BoxedTransport,
        version: Version,
        head_request: bool,
    ) {
        let (close_tx, close_rx) = async_channel::bounded(1);
        self.transport = Some(transport);
        self.headers = Headers::new();
        self.status = StatusCode::Ok;
        self.written = NO_WRITTEN;
        self.before_flush = None;
        self.version = version;
        self.head_request = head_request;
        self.chunked = false;
        self.close_tx = close_tx;
        self.close_rx = close_rx;
    }

    fn body_is_allowed(&self) -> bool {
        let code = self.status as u16;
        !self.head_request && code >= 200 && code != 204 && code != 304
    }

    async fn try_write_head(&mut self) -> Result<()> {
        if self.written != NO_WRITTEN {
            return Ok(());
        }
        self.written = STATUS_CODE_WRITTEN;

        if self.headers.get(CONTENT_LENGTH).is_none() && self.body_is_allowed() {
            if self.version == Version::Http1_1 {
                self.chunked = true;
                self.headers.insert(TRANSFER_ENCODING, "chunked");
            } else {
                // 1.0 has no chunked framing, the body runs to close
                self.headers.insert("connection", "close");
            }
        }
        if self.headers.get("server").is_none() {
            self.headers.insert("server", SERVER);
        }
        if self.headers.get(DATE).is_none() {
            self.headers
                .insert(DATE, httpdate::fmt_http_date(std::time::SystemTime::now()).as_str());
        }

        let version = match self.version {
            Version::Http1_0 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let mut head = format!(
            "{} {} {}\r\n",
            version, self.status as u16, self.status.canonical_reason()
        );

        let mut headers = self.headers.iter().collect::<Vec<_>>();
        headers.sort_unstable_by_key(|(name, _)| name.as_str());
        for (name, values) in headers {
            for value in values.iter() {
                head.push_str(name.as_str());
                head.push_str(": ");
                head.push_str(value.as_str());
                head.push_str("\r\n");
            }
        }
        head.push_str("\r\n");

        log::trace!("sending head:\n{}", &head);
        self.transport_write(head.as_bytes()).await?;
        Ok(())
    }

    async fn transport_write(&mut self, bytes: &[u8]) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(Error::WriterDetached)?;
        match transport.write_all(bytes).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // the peer is gone, wake any close-notify subscribers
                let _ = self.close_tx.try_send(());
                Err(error.into())
            }
        }
    }

    /// Transmit body bytes, sending the deferred head first when
    /// needed. Returns the number of body bytes accounted.
    pub async fn write(&mut self, contents: &[u8]) -> Result<usize> {
        self.try_write_head().await?;

        if !self.body_is_allowed() {
            // HEAD responses and bodiless statuses account but do not
            // transmit
            self.written += contents.len() as i64;
            return Ok(contents.len());
        }

        if self.chunked {
            if !contents.is_empty() {
                let size = format!("{:x}\r\n", contents.len());
                self.transport_write(size.as_bytes()).await?;
                self.transport_write(contents).await?;
                self.transport_write(b"\r\n").await?;
            }
        } else {
            self.transport_write(contents).await?;
        }

        self.written += contents.len() as i64;
        Ok(contents.len())
    }

    /// Run the pre-flush callback, if any, then make sure the head has
    /// been transmitted.
    pub async fn flush_response(&mut self) -> Result<()> {
        if let Some(before_flush) = self.before_flush.take() {
            before_flush();
        }
        self.try_write_head().await
    }

    /// Terminate the wire framing and yield the transport back. The
    /// writer value is recycled through [`base_writer_pool`].
    pub async fn end_response(mut self) -> Option<BoxedTransport> {
        if self.written == NO_WRITTEN {
            // a response without any flush still must answer
            if self.try_write_head().await.is_err() {
                return None;
            }
        }
        if self.chunked {
            if self.transport_write(b"0\r\n\r\n").await.is_err() {
                return None;
            }
        }
        let transport = self.transport.take();
        base_writer_pool().put(self);
        transport
    }
}

pub(crate) fn clone_headers(headers: &Headers) -> Headers {
    let mut cloned = Headers::new();
    for (name, values) in headers.iter() {
        for value in values.iter() {
            cloned.append(name.clone(), value.clone());
        }
    }
    cloned
}

/// The process-wide pool that recycles [`BaseWriter`] values across
/// requests.
pub fn base_writer_pool() -> &'static Pool<BaseWriter> {
    static POOL: OnceLock<Pool<BaseWriter>> = OnceLock::new();
    POOL.get_or_init(Pool::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_sentinels() {
        let writer = BaseWriter::new();
        assert_eq!(writer.written, NO_WRITTEN);

        let mut writer = ResponseWriter::Base(writer);
        writer.set_written(5); // out of the sentinel range, ignored
        assert_eq!(writer.written(), NO_WRITTEN);
        writer.set_written(STATUS_CODE_WRITTEN);
        assert_eq!(writer.written(), STATUS_CODE_WRITTEN);
    }

    #[test]
    fn write_header_only_records() {
        let mut writer = ResponseWriter::Base(BaseWriter::new());
        writer.write_header(StatusCode::ImATeapot);
        assert_eq!(writer.status_code(), StatusCode::ImATeapot);
        assert_eq!(writer.written(), NO_WRITTEN);
    }

    #[test]
    fn clone_is_detached() {
        let mut writer = ResponseWriter::Base(BaseWriter::new());
        writer.write_header(StatusCode::NotFound);
        writer.headers_mut().insert("x-test", "yes");

        let clone = writer.clone_response();
        assert_eq!(clone.status_code(), StatusCode::NotFound);
        assert_eq!(
            clone.headers().get("x-test").map(|v| v.as_str()),
            Some("yes")
        );

        writer.write_header(StatusCode::Ok);
        assert_eq!(clone.status_code(), StatusCode::NotFound);
    }
}
