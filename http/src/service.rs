use crate::{BoxedTransport, Request};
use async_trait::async_trait;
use std::sync::Arc;

/**
The seam between the connection loop and the framework above it.

For each parsed request, the connection loop surrenders the boxed
transport to the service and expects it back when the response has been
fully written, so the connection can be reused for the next request.
Returning `None` means the service took the transport for itself (for
example through a hijack) and the loop must forget the connection.
*/
#[async_trait]
pub trait HttpService: Send + Sync + 'static {
    /// handle a single request, returning the transport for reuse
    async fn call(&self, transport: BoxedTransport, request: Request) -> Option<BoxedTransport>;
}

#[async_trait]
impl<S: HttpService> HttpService for Arc<S> {
    async fn call(&self, transport: BoxedTransport, request: Request) -> Option<BoxedTransport> {
        S::call(self, transport, request).await
    }
}
