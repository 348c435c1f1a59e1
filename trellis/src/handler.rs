use crate::Context;
use async_trait::async_trait;
use std::{borrow::Cow, future::Future, pin::Pin, sync::Arc};

/// A boxed future, the form in which handler closures return their
/// work.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/**
# The building block of a trellis application.

A handler is an async function over a mutable [`Context`]. There is no
type-level distinction between middleware and endpoints: a middleware is
simply a handler that calls [`Context::next`] to run the rest of the
chain, and an endpoint is one that does not.

The simplest handler is a closure taking `&mut Context` and returning a
[`BoxFuture`]; the [`handler`] helper erases it:

```
use trellis::{handler, BoxFuture, Context};

let hello = handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let _ = ctx.write_string("hello world").await;
    })
});
# let _ = hello;
```

Named types implement [`Handler`] directly when they carry state or
want a custom [`Handler::name`].
*/
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Run this handler against the provided context.
    async fn handle(&self, ctx: &mut Context);

    /// The name of this handler, used in route traces and debugging.
    /// Defaults to the type name.
    fn name(&self) -> Cow<'static, str> {
        std::any::type_name::<Self>().into()
    }
}

/// The handler chain a route carries and a context executes.
pub type Handlers = Vec<Arc<dyn Handler>>;

#[async_trait]
impl<Fun> Handler for Fun
where
    Fun: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &mut Context) {
        (self)(ctx).await
    }
}

#[async_trait]
impl Handler for Box<dyn Handler> {
    async fn handle(&self, ctx: &mut Context) {
        self.as_ref().handle(ctx).await
    }

    fn name(&self) -> Cow<'static, str> {
        self.as_ref().name()
    }
}

#[async_trait]
impl Handler for &'static str {
    async fn handle(&self, ctx: &mut Context) {
        let _ = ctx.write_string(self).await;
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(self)
    }
}

/// Erase a handler closure or named handler into the `Arc<dyn Handler>`
/// form that chains are made of.
pub fn handler(h: impl Handler) -> Arc<dyn Handler> {
    Arc::new(h)
}
