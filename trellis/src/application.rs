use crate::{Context, Store};
use async_trait::async_trait;
use http_types::Method;
use std::io;

/**
Read-only configuration shared by every context of an application.

All setters are chainable; construct with [`Configuration::new`] and
hand the result to the application before it starts serving.
*/
#[derive(Clone, Debug)]
pub struct Configuration {
    /// the charset appended to text content types
    pub charset: String,
    /// the host (virtual host) this application considers its own,
    /// used by the subdomain wildcard gate
    pub vhost: String,
    /// disable stripping of trailing slashes from request paths
    pub disable_path_correction: bool,
    /// correct the path in place instead of redirecting to the
    /// corrected path
    pub disable_path_correction_redirection: bool,
    /// answer 405 with an Allow header instead of 404 when another
    /// method matches the path
    pub fire_method_not_allowed: bool,
    /// do not invoke registered status-code handlers automatically at
    /// the end of a failed request
    pub disable_auto_fire_status_code: bool,
    /// keep the request body readable after `unmarshal_body` consumed
    /// it
    pub disable_body_consumption_on_unmarshal: bool,
    /// headers consulted, in order, to resolve the client address
    /// behind proxies
    pub remote_addr_headers: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            charset: String::from("utf-8"),
            vhost: String::new(),
            disable_path_correction: false,
            disable_path_correction_redirection: false,
            fire_method_not_allowed: false,
            disable_auto_fire_status_code: false,
            disable_body_consumption_on_unmarshal: false,
            remote_addr_headers: Vec::new(),
        }
    }
}

impl Configuration {
    /// Construct the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the charset appended to text content types. Defaults to
    /// utf-8.
    pub fn with_charset(mut self, charset: &str) -> Self {
        self.charset = String::from(charset);
        self
    }

    /// Set the application's own host, enabling the `*.` subdomain
    /// wildcard to exclude it.
    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = String::from(vhost);
        self
    }

    /// Disable trailing-slash path correction.
    pub fn without_path_correction(mut self) -> Self {
        self.disable_path_correction = true;
        self
    }

    /// Correct paths in place instead of redirecting.
    pub fn without_path_correction_redirection(mut self) -> Self {
        self.disable_path_correction_redirection = true;
        self
    }

    /// Respond 405 with an Allow header when the path matches under a
    /// different method.
    pub fn with_fire_method_not_allowed(mut self) -> Self {
        self.fire_method_not_allowed = true;
        self
    }

    /// Do not fire status-code handlers automatically on failed
    /// responses.
    pub fn without_auto_fire_status_code(mut self) -> Self {
        self.disable_auto_fire_status_code = true;
        self
    }

    /// Keep the request body readable after it was unmarshaled.
    pub fn with_body_preserved_on_unmarshal(mut self) -> Self {
        self.disable_body_consumption_on_unmarshal = true;
        self
    }

    /// Add a header consulted to resolve the client address behind
    /// proxies, e.g. `X-Forwarded-For`.
    pub fn with_remote_addr_header(mut self, header: &str) -> Self {
        self.remote_addr_headers.push(String::from(header));
        self
    }
}

/**
A read-only view of a registered route, exposed to contexts through
[`Application::route_info`].
*/
#[derive(Clone, Debug)]
pub struct RouteInfo {
    /// the route's registered name
    pub name: String,
    /// the route's method, `None` when the route is offline
    pub method: Option<Method>,
    /// the route's subdomain, including its trailing dot
    pub subdomain: String,
    /// the registered path template
    pub path: String,
    /// the path with parameter positions replaced by `%v`
    pub formatted_path: String,
}

/**
The external view renderer seam. The framework pins only this call
shape; template engines live outside the core and are registered on the
application.
*/
pub trait ViewEngine: Send + Sync + 'static {
    /// Render the template `name` inside `layout` (empty for none),
    /// reading whatever it needs from the request's view data store,
    /// writing the result into `writer`.
    fn render(&self, writer: &mut dyn io::Write, name: &str, layout: &str, data: &Store)
        -> io::Result<()>;
}

/**
The application as seen from a [`Context`]: read-only configuration,
route lookup, raw-context dispatch, and status-code handler firing.

The router crate provides the concrete implementation; contexts hold an
`Arc<dyn Application>` so the core stays decoupled from routing.
*/
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// the application's read-only configuration
    fn configuration(&self) -> &Configuration;

    /// Invoke the status-code handler chain registered for the
    /// context's current status code, if any.
    async fn fire_error_code(&self, ctx: &mut Context);

    /// Dispatch the context through the application's router, as if
    /// its request had just arrived. Used by [`Context::exec`].
    async fn serve_http_c(&self, ctx: &mut Context);

    /// Whether a route exists for the method and path, honoring the
    /// context's host for subdomain routes.
    fn route_exists(&self, ctx: &mut Context, method: Method, path: &str) -> bool;

    /// Look up a registered route by name.
    fn route_info(&self, name: &str) -> Option<RouteInfo>;

    /// The registered view engine, if any.
    fn view_engine(&self) -> Option<&dyn ViewEngine> {
        None
    }
}
