use std::borrow::Cow;
use std::str::Utf8Error;

use thiserror::Error;

/// Concrete errors that occur within trellis' http implementation
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// [`std::io::Error`]
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// connection was closed
    #[error("connection closed by client")]
    Closed,

    /// [`httparse::Error`]
    #[error(transparent)]
    Httparse(#[from] httparse::Error),

    /// an incomplete http head
    #[error("partial http head")]
    PartialHead,

    /// to mitigate against malicious http clients, we do not allow
    /// request heads beyond this length
    #[error("headers were malformed or longer than allowed")]
    HeadersTooLong,

    /// we were unable to parse a header
    #[error("malformed http header {0}")]
    MalformedHeader(Cow<'static, str>),

    /// we do not speak this http version
    #[error("unsupported http version 1.{0}")]
    UnsupportedVersion(u8),

    /// we were unable to parse this http method
    #[error("unsupported http method {0}")]
    UnrecognizedMethod(String),

    /// this request did not have a method
    #[error("missing method")]
    MissingMethod,

    /// this request did not specify a path
    #[error("request path missing")]
    RequestPathMissing,

    /// we expected utf8, but there was an encoding error
    #[error(transparent)]
    EncodingError(#[from] Utf8Error),

    /// we received a header that does not make sense in context
    #[error("unexpected header: {0}")]
    UnexpectedHeader(&'static str),

    /// we do not read received bodies beyond this length into memory
    #[error("received body too long. maximum {0} bytes")]
    ReceivedBodyTooLong(u64),

    /// the per-request body size limit installed by the application
    /// was exceeded
    #[error("request body larger than the configured limit of {0} bytes")]
    BodyLimitExceeded(u64),

    /// the response writer no longer holds a transport, usually
    /// because the connection was hijacked
    #[error("response writer is detached from its transport")]
    WriterDetached,

    /// server push is an http/2 feature
    #[error("push is not supported by this response writer")]
    PushNotSupported,

    /// this response writer layer cannot yield the underlying
    /// transport
    #[error("hijack is not supported by this response writer")]
    HijackNotSupported,

    /// the client did not advertise gzip support in Accept-Encoding
    #[error("client does not support gzip compression")]
    GzipUnsupported,

    /// the request is outside the window where this operation applies
    #[error("skip: {0}")]
    Skipped(&'static str),
}

/// this crate's result type
pub type Result<T> = std::result::Result<T, Error>;
