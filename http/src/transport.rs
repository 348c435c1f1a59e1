use futures_lite::{AsyncRead, AsyncWrite};
use std::{
    fmt::{self, Debug, Formatter},
    io::Result,
    pin::Pin,
    task::{Context, Poll},
};

/**
The bidirectional byte stream the http protocol is spoken over.

This is a blanket trait: anything that is an async duplex stream and can
be sent between tasks qualifies, including tcp streams, unix streams,
tls-wrapped streams, and in-memory test transports.
*/
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

/**
A type-erased [`Transport`].

The connection loop boxes the accepted stream exactly once and the same
box travels through the response writer and back for connection reuse,
so no downcasting is ever required.
*/
pub struct BoxedTransport(Box<dyn Transport>);

impl BoxedTransport {
    /// Box the provided transport
    pub fn new(transport: impl Transport) -> Self {
        Self(Box::new(transport))
    }
}

impl Debug for BoxedTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxedTransport").finish()
    }
}

impl AsyncRead for BoxedTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<usize>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut *self.0).poll_close(cx)
    }
}
