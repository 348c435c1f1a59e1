use futures_lite::{AsyncRead, AsyncWrite};
use std::{
    fmt::{self, Debug, Formatter},
    io,
    pin::Pin,
    sync::{Arc, RwLock},
    task::{Context, Poll, Waker},
};

#[derive(Default)]
struct CursorInner {
    data: Vec<u8>,
    cursor: usize,
    waker: Option<Waker>,
    closed: bool,
}

/// One direction of an in-memory duplex connection: appended to by one
/// side, consumed from by the other.
#[derive(Default)]
pub struct CloseableCursor(RwLock<CursorInner>);

impl CloseableCursor {
    /// the total number of bytes ever written to this direction
    pub fn len(&self) -> usize {
        self.0.read().map(|inner| inner.data.len()).unwrap_or_default()
    }

    /// whether nothing has been written to this direction
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// a copy of everything ever written to this direction,
    /// regardless of how much has been consumed
    pub fn contents(&self) -> Vec<u8> {
        self.0.read().map(|inner| inner.data.clone()).unwrap_or_default()
    }

    /// close this direction, waking any pending read
    pub fn close(&self) {
        if let Ok(mut inner) = self.0.write() {
            inner.closed = true;
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
    }
}

impl Debug for CloseableCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.0.read().map_err(|_| fmt::Error)?;
        f.debug_struct("CloseableCursor")
            .field("len", &inner.data.len())
            .field("cursor", &inner.cursor)
            .field("closed", &inner.closed)
            .finish()
    }
}

/**
A readable and writable in-memory transport for tests.

[`TestTransport::new`] constructs a connected pair representing the two
ends of a connection: bytes written to either end become readable from
the other, and either end can be closed.
*/
#[derive(Clone, Debug)]
pub struct TestTransport {
    /// the direction this end reads from
    pub read: Arc<CloseableCursor>,
    /// the direction this end writes to
    pub write: Arc<CloseableCursor>,
}

impl TestTransport {
    /// Construct a connected transport pair.
    pub fn new() -> (TestTransport, TestTransport) {
        let a = Arc::new(CloseableCursor::default());
        let b = Arc::new(CloseableCursor::default());

        (
            TestTransport {
                read: a.clone(),
                write: b.clone(),
            },
            TestTransport { read: b, write: a },
        )
    }

    /// Close the write direction, representing a disconnection.
    pub fn close(&self) {
        self.write.close();
    }

    /// Everything the peer has written so far.
    pub fn received(&self) -> Vec<u8> {
        self.read.contents()
    }
}

impl AsyncRead for TestTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self
            .read
            .0
            .write()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned"))?;

        if inner.cursor < inner.data.len() {
            let bytes = buf.len().min(inner.data.len() - inner.cursor);
            buf[..bytes].copy_from_slice(&inner.data[inner.cursor..inner.cursor + bytes]);
            inner.cursor += bytes;
            Poll::Ready(Ok(bytes))
        } else if inner.closed {
            Poll::Ready(Ok(0))
        } else {
            inner.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl AsyncWrite for TestTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self
            .write
            .0
            .write()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned"))?;

        if inner.closed {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        } else {
            inner.data.extend_from_slice(buf);
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
            Poll::Ready(Ok(buf.len()))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.write.close();
        Poll::Ready(Ok(()))
    }
}
