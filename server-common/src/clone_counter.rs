use futures_lite::Future;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
};

#[derive(Default)]
struct CloneCounterInner {
    count: AtomicUsize,
    wakers: Mutex<Vec<Waker>>,
}

impl CloneCounterInner {
    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        if let Ok(mut wakers) = self.wakers.lock() {
            for waker in wakers.drain(..) {
                waker.wake();
            }
        }
    }
}

/**
An atomic counter that increments on clone and decrements on drop.

The server clones it into every connection task; awaiting the original
resolves once every clone has dropped, which is exactly the "no
requests in flight" condition graceful shutdown needs.
*/
#[derive(Default, Debug)]
pub struct CloneCounter(Arc<CloneCounterInner>);

impl std::fmt::Debug for CloneCounterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneCounterInner")
            .field("count", &self.current())
            .finish()
    }
}

impl CloneCounter {
    /// Construct a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current count. The original counter is zero, so this is
    /// the number of live clones.
    pub fn current(&self) -> usize {
        self.0.current()
    }
}

impl Clone for CloneCounter {
    fn clone(&self) -> Self {
        self.0.count.fetch_add(1, Ordering::SeqCst);
        Self(self.0.clone())
    }
}

impl Drop for CloneCounter {
    fn drop(&mut self) {
        let previously = self.0.count.fetch_sub(1, Ordering::SeqCst);
        if previously == 0 {
            // the original dropping; restore so awaiting clones do
            // not underflow
            self.0.count.fetch_add(1, Ordering::SeqCst);
        }
        self.0.wake();
    }
}

impl Future for &CloneCounter {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.0.current() == 0 {
            return Poll::Ready(());
        }
        if let Ok(mut wakers) = self.0.wakers.lock() {
            wakers.push(cx.waker().clone());
        }
        if self.0.current() == 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::poll_once;

    #[test]
    fn counts_clones() {
        smol::block_on(async {
            let counter = CloneCounter::new();
            assert_eq!(counter.current(), 0);
            (&counter).await; // ready immediately

            let clone = counter.clone();
            assert_eq!(counter.current(), 1);
            assert_eq!(poll_once(&counter).await, None); // pending

            drop(clone);
            assert_eq!(counter.current(), 0);
            (&counter).await;
        });
    }
}
