use crate::{BaseWriter, Context};
use std::{
    fmt::{self, Debug, Formatter},
    sync::Mutex,
};
use trellis_http::{BoxedTransport, Request};

const MAX_POOLED: usize = 64;

/**
A mutex-guarded free list.

Released objects must not be used afterwards; the pool may drop any
release to bound memory.
*/
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
}

impl<T> Debug for Pool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").finish()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    /// Construct an empty pool.
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take an object off the free list, if one is available.
    pub fn get(&self) -> Option<T> {
        self.free.lock().ok().and_then(|mut free| free.pop())
    }

    /// Return an object to the free list. Drops the object instead
    /// when the list is at capacity.
    pub fn put(&self, object: T) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOLED {
                free.push(object);
            }
        }
    }

    /// The number of objects currently on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or_default()
    }
}

/// The factory a [`ContextPool`] fills itself with.
pub type ContextFactory = Box<dyn Fn() -> Context + Send + Sync>;

/**
The context pool: recycles [`Context`] values across requests.

`acquire` hands out a context (creating one through the factory on
first demand) with `begin_request` already called; `release` runs
`end_request`, recovers the transport for connection reuse, and returns
the context to the free list.
*/
pub struct ContextPool {
    pool: Pool<Context>,
    factory: Mutex<ContextFactory>,
}

impl Debug for ContextPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("idle", &self.pool.idle())
            .finish()
    }
}

impl ContextPool {
    /// Construct a pool around the provided context factory.
    pub fn new(factory: ContextFactory) -> Self {
        Self {
            pool: Pool::new(),
            factory: Mutex::new(factory),
        }
    }

    /**
    Replace the factory, so that custom context construction can be
    injected before the server starts. Already-pooled contexts from the
    previous factory are discarded.
    */
    pub fn attach(&self, factory: ContextFactory) {
        if let Ok(mut current) = self.factory.lock() {
            *current = factory;
        }
        while self.pool.get().is_some() {}
    }

    /// Take a context from the pool (or build one) and begin the
    /// request on it.
    pub fn acquire(&self, writer: BaseWriter, request: Request) -> Context {
        let mut ctx = self.pool.get().unwrap_or_else(|| {
            let factory = self.factory.lock().expect("context factory poisoned");
            factory()
        });
        ctx.begin_request(writer, request);
        ctx
    }

    /// End the request on this context, recycle it, and recover the
    /// transport for connection reuse.
    pub async fn release(&self, mut ctx: Context) -> Option<BoxedTransport> {
        let transport = ctx.end_request().await;
        self.pool.put(ctx);
        transport
    }

    /// Return a context to the pool without ending the request on it;
    /// the caller promises it has already been cleaned up.
    pub fn release_light(&self, ctx: Context) {
        self.pool.put(ctx);
    }
}
