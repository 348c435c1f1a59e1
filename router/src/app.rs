use crate::{
    execution_rules::ExecutionRules,
    handler::RouterHandler,
    route::Route,
    router::{RawHandler, Router, WrapperFunc},
    status::{fire_status_handler, ErrorCodeHandlers},
};
use async_trait::async_trait;
use http_types::Method;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};
use trellis::{
    base_writer_pool, Application, Configuration, Context, ContextPool, FrameworkError, Handlers,
    RouteInfo, StatusCode, ViewEngine,
};
use trellis_http::{BoxedTransport, HttpService, Request};
use trellis_server_common::{register_on_interrupt, Supervisor, SERVER_CLOSED};

/**
# The trellis application.

Collects the route set, owns the router shell and the context pool,
and implements [`HttpService`] so a server can feed it raw
transport/request pairs. Cloning an `App` clones a handle to the same
application.

```
use trellis::Context;
use trellis_router::App;

let app = App::new();
app.get(
    "/",
    vec![trellis::handler(|ctx: &mut Context| -> trellis::BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = ctx.write_string("index").await;
        })
    })],
)
.unwrap();
app.build().unwrap();
```
*/
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

pub(crate) struct AppInner {
    config: Configuration,
    routes: Mutex<Vec<Route>>,
    global_begin: Mutex<Handlers>,
    global_done: Mutex<Handlers>,
    rules: Mutex<ExecutionRules>,
    router: Router,
    pool: Arc<ContextPool>,
    status_handlers: Mutex<ErrorCodeHandlers>,
    view: OnceLock<Box<dyn ViewEngine>>,
    built: AtomicBool,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.inner.routes.lock().map(|r| r.len()).unwrap_or(0))
            .field("built", &self.inner.built.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Construct an application with the default configuration.
    pub fn new() -> Self {
        Self::with_configuration(Configuration::default())
    }

    /// Construct an application with the provided configuration.
    pub fn with_configuration(config: Configuration) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<AppInner>| {
            let weak = weak.clone();
            let factory = Box::new(move || {
                let app: Arc<dyn Application> = weak
                    .upgrade()
                    .expect("context created after application was dropped");
                Context::new(app)
            });

            AppInner {
                config,
                routes: Mutex::new(Vec::new()),
                global_begin: Mutex::new(Vec::new()),
                global_done: Mutex::new(Vec::new()),
                rules: Mutex::new(ExecutionRules::default()),
                router: Router::new(),
                pool: Arc::new(ContextPool::new(factory)),
                status_handlers: Mutex::new(ErrorCodeHandlers::new()),
                view: OnceLock::new(),
                built: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    /// The application's read-only configuration.
    pub fn configuration(&self) -> &Configuration {
        &self.inner.config
    }

    /// The application's context pool, for
    /// [`attach`](ContextPool::attach)-ing a custom factory before the
    /// server starts.
    pub fn context_pool(&self) -> &Arc<ContextPool> {
        &self.inner.pool
    }

    //  +------------------------------------------------------------+
    //  | Route registration                                         |
    //  +------------------------------------------------------------+

    /**
    Register a route for `method path`, returning its generated name.
    Globally registered middleware is spliced in at build time.
    */
    pub fn handle(
        &self,
        method: Method,
        path: &str,
        handlers: Handlers,
    ) -> Result<String, FrameworkError> {
        self.handle_on("", method, path, handlers)
    }

    /// Register a route under a subdomain (including its trailing
    /// dot, or `*.` for any subdomain), returning its generated name.
    pub fn handle_on(
        &self,
        subdomain: &str,
        method: Method,
        path: &str,
        handlers: Handlers,
    ) -> Result<String, FrameworkError> {
        let mut route = Route::new(method, subdomain, path, handlers)?;

        if let Ok(begin) = self.inner.global_begin.lock() {
            route.use_handlers(begin.clone());
        }
        if let Ok(done) = self.inner.global_done.lock() {
            route.done(done.clone());
        }

        let name = route.name.clone();
        self.inner
            .routes
            .lock()
            .map_err(|_| FrameworkError::new("route registry poisoned"))?
            .push(route);
        Ok(name)
    }

    /// Register a GET route.
    pub fn get(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Get, path, handlers.into())
    }

    /// Register a POST route.
    pub fn post(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Post, path, handlers.into())
    }

    /// Register a PUT route.
    pub fn put(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Put, path, handlers.into())
    }

    /// Register a DELETE route.
    pub fn delete(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Delete, path, handlers.into())
    }

    /// Register a PATCH route.
    pub fn patch(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Patch, path, handlers.into())
    }

    /// Register a HEAD route.
    pub fn head(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Head, path, handlers.into())
    }

    /// Register an OPTIONS route.
    pub fn options(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        self.handle(Method::Options, path, handlers.into())
    }

    /**
    Register an offline route: it participates in nothing until
    brought online with [`App::set_route_online`] and a router
    refresh.
    */
    pub fn none(&self, path: &str, handlers: impl Into<Handlers>) -> Result<String, FrameworkError> {
        let name = self.handle(Method::Get, path, handlers.into())?;
        self.with_route(&name, |route| {
            route.set_status_offline();
        });
        Ok(name)
    }

    /**
    Register middleware that runs before every route's main chain.
    Applies to already registered routes and to routes registered
    afterwards.
    */
    pub fn use_global(&self, handlers: Handlers) {
        if let Ok(mut routes) = self.inner.routes.lock() {
            for route in routes.iter_mut() {
                route.use_handlers(handlers.clone());
            }
        }
        if let Ok(mut begin) = self.inner.global_begin.lock() {
            begin.extend(handlers);
        }
    }

    /// Register cleanup handlers that run after every route's main
    /// chain.
    pub fn done_global(&self, handlers: Handlers) {
        if let Ok(mut routes) = self.inner.routes.lock() {
            for route in routes.iter_mut() {
                route.done(handlers.clone());
            }
        }
        if let Ok(mut done) = self.inner.global_done.lock() {
            done.extend(handlers);
        }
    }

    /// Set the execution rules applied to every route at build time.
    pub fn set_execution_rules(&self, rules: ExecutionRules) {
        if let Ok(mut slot) = self.inner.rules.lock() {
            *slot = rules;
        }
    }

    /// Register a handler chain for an error status code.
    pub fn on_error_code(&self, status: StatusCode, handlers: Handlers) -> bool {
        self.inner
            .status_handlers
            .lock()
            .map(|mut registry| registry.register(status, handlers))
            .unwrap_or_default()
    }

    /// Register the view engine. Only the first registration wins.
    pub fn set_view_engine(&self, engine: impl ViewEngine) {
        let _ = self.inner.view.set(Box::new(engine));
    }

    /// A read-only view of the named route.
    pub fn get_route(&self, name: &str) -> Option<RouteInfo> {
        self.inner
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.iter().find(|route| route.name == name).map(Route::info))
    }

    /// Run `f` over the named route, e.g. to toggle it offline.
    /// A [`App::refresh_router`] is required for routing changes to
    /// take effect.
    pub fn with_route(&self, name: &str, f: impl FnOnce(&mut Route)) -> bool {
        self.inner
            .routes
            .lock()
            .ok()
            .and_then(|mut routes| {
                routes
                    .iter_mut()
                    .find(|route| route.name == name)
                    .map(f)
            })
            .is_some()
    }

    /// Take the named route offline. Requires a refresh.
    pub fn set_route_offline(&self, name: &str) -> bool {
        self.with_route(name, |route| {
            route.set_status_offline();
        })
    }

    /// Bring the named route online under `method`. Requires a
    /// refresh.
    pub fn set_route_online(&self, name: &str, method: Method) -> bool {
        self.with_route(name, |route| {
            route.change_method(Some(method));
        })
    }

    //  +------------------------------------------------------------+
    //  | Building and serving                                       |
    //  +------------------------------------------------------------+

    /// Add a pre-routing wrapper. See [`Router::wrap_router`]; must
    /// be called before [`App::build`].
    pub fn wrap_router(&self, wrapper: WrapperFunc) {
        self.inner.router.wrap_router(wrapper);
    }

    /// Downgrade the router to a custom raw handler. See
    /// [`Router::downgrade`].
    pub fn downgrade(&self, raw: RawHandler) {
        self.inner.router.downgrade(raw);
    }

    /// Whether the router has been downgraded.
    pub fn downgraded(&self) -> bool {
        self.inner.router.downgraded()
    }

    /// The router shell.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    fn build_router_now(&self) -> Result<(), FrameworkError> {
        let rules = self
            .inner
            .rules
            .lock()
            .map(|rules| *rules)
            .unwrap_or_default();

        let mut handler = RouterHandler::new();
        {
            let mut routes = self
                .inner
                .routes
                .lock()
                .map_err(|_| FrameworkError::new("route registry poisoned"))?;
            handler.build(&mut routes, &rules)?;
        }

        self.inner
            .router
            .build_router(self.inner.pool.clone(), handler);
        Ok(())
    }

    /**
    Build the dispatch trees from the registered routes. Idempotent:
    after the first successful build this is a no-op; use
    [`App::refresh_router`] after changing route state at runtime.
    Aggregated route errors fail the build and should be treated as
    fatal at startup.
    */
    pub fn build(&self) -> Result<(), FrameworkError> {
        if self.inner.built.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.router.downgraded() {
            return Ok(());
        }
        self.build_router_now()
    }

    /**
    Rebuild the dispatch trees in place, picking up route state
    changes (method swaps, offline toggles). Must not race in-flight
    requests: call it from a quiesced state.
    */
    pub fn refresh_router(&self) -> Result<(), FrameworkError> {
        self.inner.built.store(true, Ordering::SeqCst);
        self.build_router_now()
    }

    /**
    Build the application and wrap it in a supervised host for `addr`.
    The host's "server closed" error is pre-registered as ignored, so
    a graceful shutdown reads as success.
    */
    pub fn new_host(&self, addr: &str) -> Result<Arc<Supervisor>, FrameworkError> {
        self.build()?;
        let supervisor = Arc::new(Supervisor::new(addr, Arc::new(self.clone())));
        supervisor.ignore_error(SERVER_CLOSED);
        Ok(supervisor)
    }

    /**
    Build, bind `addr`, and serve until the process is interrupted,
    shutting down gracefully with a five second drain deadline.
    */
    pub fn listen(&self, addr: &str) -> Result<(), FrameworkError> {
        let supervisor = self.new_host(addr)?;

        {
            let supervisor = supervisor.clone();
            register_on_interrupt(move || {
                smol::block_on(supervisor.shutdown(Some(Duration::from_secs(5))));
            });
        }

        smol::block_on(supervisor.listen_and_serve())
            .map_err(|error| FrameworkError::new(error.to_string()))
    }
}

#[async_trait]
impl HttpService for App {
    async fn call(&self, transport: BoxedTransport, request: Request) -> Option<BoxedTransport> {
        let mut writer = base_writer_pool().get().unwrap_or_default();
        writer.begin_response(transport, request.version(), request.method() == Method::Head);
        self.inner.router.serve_http(writer, request).await
    }
}

#[async_trait]
impl Application for AppInner {
    fn configuration(&self) -> &Configuration {
        &self.config
    }

    async fn fire_error_code(&self, ctx: &mut Context) {
        let status = ctx.get_status_code();
        let chain = self
            .status_handlers
            .lock()
            .ok()
            .and_then(|mut registry| registry.chain_for(status));

        if let Some((status, handlers)) = chain {
            fire_status_handler(ctx, status, handlers).await;
        }
    }

    async fn serve_http_c(&self, ctx: &mut Context) {
        self.router.serve_http_c(ctx).await;
    }

    fn route_exists(&self, ctx: &mut Context, method: Method, path: &str) -> bool {
        match self.router.request_handler() {
            Some(handler) => handler.route_exists(ctx, method, path),
            None => false,
        }
    }

    fn route_info(&self, name: &str) -> Option<RouteInfo> {
        self.routes
            .lock()
            .ok()
            .and_then(|routes| routes.iter().find(|route| route.name == name).map(Route::info))
    }

    fn view_engine(&self) -> Option<&dyn ViewEngine> {
        self.view.get().map(Box::as_ref)
    }
}
