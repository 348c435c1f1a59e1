use crate::handler::RouterHandler;
use std::sync::{Arc, Mutex, RwLock};
use trellis::{BaseWriter, BoxFuture, Context, ContextPool, ResponseWriter, StatusCode};
use trellis_http::{BoxedTransport, Request};

/**
The raw request model: an owned base writer (bound to the transport)
and the parsed request, resolving to the transport for connection
reuse. This is what the router's main dispatch looks like from below,
and what a downgraded router delegates to directly.
*/
pub type RawHandler =
    Arc<dyn Fn(BaseWriter, Request) -> BoxFuture<'static, Option<BoxedTransport>> + Send + Sync>;

/**
A pre-routing wrapper over the raw request model. The third argument
runs the rest of the stack (ultimately the router); a wrapper that
never calls it answers the request by itself.
*/
pub type WrapperFunc = Arc<
    dyn Fn(BaseWriter, Request, RawHandler) -> BoxFuture<'static, Option<BoxedTransport>>
        + Send
        + Sync,
>;

/**
The router shell: owns the main dispatch built from a
[`RouterHandler`] and a context pool, an optional stack of pre-routing
wrappers (executed last-registered-first), and the downgraded mode in
which the framework skips context allocation entirely and delegates to
a user-supplied raw handler.
*/
#[derive(Default)]
pub struct Router {
    request_handler: RwLock<Option<Arc<RouterHandler>>>,
    main_handler: RwLock<Option<RawHandler>>,
    wrapper: Mutex<Option<WrapperFunc>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("downgraded", &self.downgraded())
            .finish()
    }
}

impl Router {
    /// Construct an empty router shell.
    pub fn new() -> Self {
        Self::default()
    }

    /**
    Install the dispatch path: acquire a context from the pool, run
    the router runtime, release the context. Applies the wrapper
    stack, if any. Called by the application's build, and again by
    refreshes.
    */
    pub fn build_router(&self, pool: Arc<ContextPool>, handler: RouterHandler) {
        let handler = Arc::new(handler);

        let dispatch = handler.clone();
        let mut main: RawHandler = Arc::new(move |writer: BaseWriter, request: Request| {
            let pool = pool.clone();
            let dispatch = dispatch.clone();
            Box::pin(async move {
                let mut ctx = pool.acquire(writer, request);
                dispatch.handle_request(&mut ctx).await;
                pool.release(ctx).await
            })
        });

        if let Some(wrapper) = self
            .wrapper
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
        {
            main = wrap(wrapper, main);
        }

        if let Ok(mut slot) = self.request_handler.write() {
            *slot = Some(handler);
        }
        if let Ok(mut slot) = self.main_handler.write() {
            *slot = Some(main);
        }
    }

    /**
    Add a wrapper on top of the main router. Wrappers run
    last-registered-first, each receiving the raw writer/request pair
    and a callback that continues toward the router. Must be called
    before the router is built.
    */
    pub fn wrap_router(&self, wrapper: WrapperFunc) {
        let Ok(mut guard) = self.wrapper.lock() else {
            return;
        };

        *guard = Some(match guard.take() {
            None => wrapper,
            Some(previous) => {
                let next_wrapper = wrapper;
                Arc::new(move |writer, request, next| {
                    let previous = previous.clone();
                    let next_wrapper = next_wrapper.clone();
                    Box::pin(async move {
                        let continue_to_previous: RawHandler =
                            Arc::new(move |writer2, request2| {
                                let previous = previous.clone();
                                let next = next.clone();
                                Box::pin(
                                    async move { previous(writer2, request2, next).await },
                                )
                            });
                        next_wrapper(writer, request, continue_to_previous).await
                    })
                })
            }
        });
    }

    /**
    Replace the main dispatch with a custom raw handler, bypassing the
    context pool, the router runtime, and the wrapper stack. The
    caller is responsible for everything from here on.
    */
    pub fn downgrade(&self, new_main: RawHandler) {
        if let Ok(mut slot) = self.main_handler.write() {
            *slot = Some(new_main);
        }
        if let Ok(mut slot) = self.request_handler.write() {
            *slot = None;
        }
    }

    /// Whether this router has been downgraded to a raw handler.
    pub fn downgraded(&self) -> bool {
        let main = self
            .main_handler
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or_default();
        let request = self
            .request_handler
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or_default();
        main && !request
    }

    /// The current main dispatch, if the router has been built.
    pub fn main(&self) -> Option<RawHandler> {
        self.main_handler.read().ok().and_then(|slot| slot.clone())
    }

    /// Serve one raw writer/request pair through the main dispatch.
    pub async fn serve_http(
        &self,
        writer: BaseWriter,
        request: Request,
    ) -> Option<BoxedTransport> {
        match self.main() {
            Some(main) => main(writer, request).await,
            None => {
                log::error!("router used before it was built");
                let mut writer = ResponseWriter::Base(writer);
                writer.write_header(StatusCode::NotFound);
                if writer.flush_response().await.is_err() {
                    return None;
                }
                writer.end_response().await
            }
        }
    }

    /**
    Serve an already-acquired context directly through the router
    runtime, bypassing the wrapper stack. Used for cross-routing
    within a request.
    */
    pub async fn serve_http_c(&self, ctx: &mut Context) {
        let handler = self
            .request_handler
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler.handle_request(ctx).await;
        }
    }

    /// The built router runtime, if any.
    pub fn request_handler(&self) -> Option<Arc<RouterHandler>> {
        self.request_handler
            .read()
            .ok()
            .and_then(|slot| slot.clone())
    }
}

fn wrap(wrapper: WrapperFunc, main: RawHandler) -> RawHandler {
    Arc::new(move |writer, request| {
        let wrapper = wrapper.clone();
        let main = main.clone();
        Box::pin(async move { wrapper(writer, request, main).await })
    })
}
