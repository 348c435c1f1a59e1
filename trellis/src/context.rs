use crate::{
    application::Application,
    gzip_writer::gzip_writer_pool,
    handler::{Handler, Handlers},
    response_recorder::ResponseRecorder,
    response_writer::{BaseWriter, ResponseWriter},
    status_code_not_successful, RequestParams, RouteInfo, Store,
};
use cookie::Cookie;
use http_types::{
    headers::{
        HeaderName, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, ETAG, IF_MODIFIED_SINCE, LAST_MODIFIED,
        LOCATION, SET_COOKIE,
    },
    Method, StatusCode,
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use trellis_http::{decode_path, decode_query, BoxedTransport, Error, Request, Result};

/// The values-store key under which [`Context::view_layout`] records
/// the layout for a subsequent [`Context::view`] call.
pub const VIEW_LAYOUT_KEY: &str = "trellis.view.layout";

/// The values-store key prefix under which [`Context::view_data`]
/// records data for the view engine.
pub const VIEW_DATA_PREFIX: &str = "trellis.view.data.";

/// Layout sentinel that disables the engine's configured layout for a
/// single render.
pub const NO_LAYOUT: &str = "trellis.nolayout";

/// Content type for raw binary responses; the configured charset is
/// never appended to it.
pub const CONTENT_BINARY: &str = "application/octet-stream";

pub(crate) const SKIP_TRANSACTIONS_KEY: &str = "trellis.transactions.skipped";

const STOP_EXECUTION_INDEX: isize = -1;

static LAST_CAPTURED_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The total number of context ids handed out so far in this process.
pub fn last_captured_context_id() -> u64 {
    LAST_CAPTURED_CONTEXT_ID.load(Ordering::Relaxed)
}

/**
The per-request context.

A context owns, for the duration of one request: the parsed request,
the current response-writer layer, the handler chain and its cursor,
the path-parameter store filled by the router, and a generic user-value
store for middleware communication. Contexts are recycled through the
[`ContextPool`](crate::ContextPool): `begin_request` resets all of this
in place, so a freshly acquired context always observes empty stores
and a zero cursor.
*/
pub struct Context {
    id: u64,
    writer: Option<ResponseWriter>,
    request: Option<Request>,
    current_route_name: String,
    params: RequestParams,
    values: Store,
    app: Arc<dyn Application>,
    handlers: Handlers,
    cursor: isize,
    max_request_body_size: Option<u64>,
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("writer", &self.writer)
            .field("request", &self.request)
            .field("current_route_name", &self.current_route_name)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ▶ {}:{}",
            self.id,
            self.remote_addr(),
            self.method(),
            self.request
                .as_ref()
                .map(Request::raw_path)
                .unwrap_or_default()
        )
    }
}

impl Context {
    /// Construct a context bound to its owning application. Normally
    /// called only by the context pool's factory.
    pub fn new(app: Arc<dyn Application>) -> Self {
        Self {
            id: 0,
            writer: None,
            request: None,
            current_route_name: String::new(),
            params: RequestParams::new(),
            values: Store::new(),
            app,
            handlers: Vec::new(),
            cursor: 0,
            max_request_body_size: None,
        }
    }

    /// The context's unique request id, assigned lazily on first use.
    pub fn id(&mut self) -> u64 {
        if self.id == 0 {
            self.id = LAST_CAPTURED_CONTEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.id
    }

    //  +------------------------------------------------------------+
    //  | Request lifecycle                                          |
    //  +------------------------------------------------------------+

    /**
    Prepare this context for a new request: handlers cleared, both
    stores truncated in place, cursor reset, and the provided base
    writer installed as the current response writer.
    */
    pub fn begin_request(&mut self, writer: BaseWriter, request: Request) {
        self.handlers.truncate(0);
        self.values.reset();
        self.params.reset();
        self.cursor = 0;
        self.current_route_name.clear();
        self.max_request_body_size = None;
        self.id = 0;
        self.writer = Some(ResponseWriter::Base(writer));
        self.request = Some(request);
    }

    /**
    Finish the request. When the response status is a failure, nothing
    was written, and the application allows it, the registered
    status-code handler chain fires first; then the writer is flushed
    and ended, yielding the transport back for connection reuse.
    */
    pub async fn end_request(&mut self) -> Option<BoxedTransport> {
        if status_code_not_successful(self.get_status_code())
            && !self.app.configuration().disable_auto_fire_status_code
            && self.writer().written() <= 0
        {
            let app = self.app.clone();
            app.fire_error_code(self).await;
        }

        let mut writer = self.writer.take()?;
        if let Err(error) = writer.flush_response().await {
            log::debug!("flushing response: {:?}", error);
        }
        self.request = None;
        writer.end_response().await
    }

    //  +------------------------------------------------------------+
    //  | Handler chain control                                      |
    //  +------------------------------------------------------------+

    /// Replace the handler chain and execute its first handler.
    /// The chain cursor is intentionally left as-is; see
    /// [`Context::handler_index`] for resetting it.
    pub async fn do_handlers(&mut self, handlers: Handlers) {
        if handlers.is_empty() {
            return;
        }
        self.handlers = handlers;
        let first = self.handlers[0].clone();
        first.handle(self).await;
    }

    /// Append handlers to the current chain at serve time. They are
    /// not persisted to the route.
    pub fn add_handler(&mut self, handlers: Handlers) {
        self.handlers.extend(handlers);
    }

    /// Replace the handler chain without executing anything.
    pub fn set_handlers(&mut self, handlers: Handlers) {
        self.handlers = handlers;
    }

    /// The current handler chain.
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /**
    Set the chain cursor to `n` if it is in range, returning the
    resulting cursor. Passing `-1` queries the current cursor without
    changing it.
    */
    pub fn handler_index(&mut self, n: isize) -> isize {
        if n < 0 || n > self.handlers.len() as isize - 1 {
            return self.cursor;
        }
        self.cursor = n;
        n
    }

    /// The name of the handler at the cursor, for debugging.
    pub fn handler_name(&self) -> String {
        self.handlers
            .get(self.cursor.max(0) as usize)
            .map(|handler| handler.name().into_owned())
            .unwrap_or_default()
    }

    /**
    Run the next handler in the chain, if execution has not been
    stopped and one exists. Middleware calls this to hand control
    onward.
    */
    pub async fn next(&mut self) {
        if self.is_stopped() {
            return;
        }
        let n = self.cursor + 1;
        if (n as usize) < self.handlers.len() {
            self.cursor = n;
            let handler = self.handlers[n as usize].clone();
            handler.handle(self).await;
        }
    }

    /**
    If the chain has a next handler, run it and advance the cursor past
    it so it is not re-entered, returning `true`. Otherwise, when `alt`
    is empty, answer 404 and stop execution; when `alt` is non-empty,
    install it as the new chain and run it from its start (the outer
    chain is abandoned). Returns `false` in both fallback cases.
    */
    pub async fn next_or(&mut self, alt: Handlers) -> bool {
        if let Some(next) = self.next_handler() {
            next.handle(self).await;
            self.skip();
            return true;
        }

        if alt.is_empty() {
            self.not_found();
            self.stop_execution();
            return false;
        }

        self.do_handlers(alt).await;
        false
    }

    /// [`Context::next_or`] with no alternative chain.
    pub async fn next_or_not_found(&mut self) -> bool {
        self.next_or(Vec::new()).await
    }

    /// The next handler in the chain, without executing it. `None`
    /// when stopped or exhausted.
    pub fn next_handler(&self) -> Option<Arc<dyn Handler>> {
        if self.is_stopped() {
            return None;
        }
        self.handlers.get((self.cursor + 1) as usize).cloned()
    }

    /// Advance the cursor without invoking the handler it lands on.
    pub fn skip(&mut self) {
        self.handler_index(self.cursor + 1);
    }

    /// Stop the chain: subsequent [`Context::next`] calls become
    /// no-ops.
    pub fn stop_execution(&mut self) {
        self.cursor = STOP_EXECUTION_INDEX;
    }

    /// Whether [`Context::stop_execution`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.cursor == STOP_EXECUTION_INDEX
    }

    /**
    Run `handler` against this context and report whether it advanced
    the chain (called [`Context::next`]) without stopping it. Used to
    detect middleware that expects the chain to continue.
    */
    pub async fn proceed(&mut self, handler: &Arc<dyn Handler>) -> bool {
        let before = self.cursor;
        handler.handle(self).await;
        self.cursor > before && !self.is_stopped()
    }

    //  +------------------------------------------------------------+
    //  | Accessors                                                  |
    //  +------------------------------------------------------------+

    /// The current response writer layer.
    pub fn writer(&self) -> &ResponseWriter {
        self.writer
            .as_ref()
            .expect("context used outside of a request lifecycle")
    }

    /// Mutable access to the current response writer layer.
    pub fn writer_mut(&mut self) -> &mut ResponseWriter {
        self.writer
            .as_mut()
            .expect("context used outside of a request lifecycle")
    }

    /// Replace the context's response writer layer.
    pub fn reset_response_writer(&mut self, writer: ResponseWriter) {
        self.writer = Some(writer);
    }

    pub(crate) fn take_writer(&mut self) -> Option<ResponseWriter> {
        self.writer.take()
    }

    /// The request this context serves.
    pub fn request(&self) -> &Request {
        self.request
            .as_ref()
            .expect("context used outside of a request lifecycle")
    }

    /// Mutable access to the request this context serves.
    pub fn request_mut(&mut self) -> &mut Request {
        self.request
            .as_mut()
            .expect("context used outside of a request lifecycle")
    }

    /// The owning application.
    pub fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    /// Record the matched route's name; called by the router.
    pub fn set_current_route_name(&mut self, name: impl Into<String>) {
        self.current_route_name = name.into();
    }

    /// The matched route's name for this request.
    pub fn current_route_name(&self) -> &str {
        &self.current_route_name
    }

    /// A read-only view of the matched route.
    pub fn get_current_route(&self) -> Option<RouteInfo> {
        self.app.route_info(&self.current_route_name)
    }

    /// The path parameters bound by the route matcher.
    pub fn params(&self) -> &RequestParams {
        &self.params
    }

    /// Mutable access to the path parameters; the router fills these
    /// during the trie search.
    pub fn params_mut(&mut self) -> &mut RequestParams {
        &mut self.params
    }

    /// The generic user-value store for middleware communication.
    pub fn values(&self) -> &Store {
        &self.values
    }

    /// Mutable access to the user-value store.
    pub fn values_mut(&mut self) -> &mut Store {
        &mut self.values
    }

    //  +------------------------------------------------------------+
    //  | Request introspection                                      |
    //  +------------------------------------------------------------+

    /// The request method.
    pub fn method(&self) -> Method {
        self.request
            .as_ref()
            .map(Request::method)
            .unwrap_or(Method::Get)
    }

    /// The request path, without any query component.
    pub fn path(&self) -> &str {
        self.request
            .as_ref()
            .map(Request::path)
            .unwrap_or_default()
    }

    /// The request path, percent-decoded when `escape` is set.
    pub fn request_path(&self, escape: bool) -> String {
        if escape {
            decode_path(self.path())
        } else {
            String::from(self.path())
        }
    }

    /// The host this request was addressed to.
    pub fn host(&self) -> &str {
        self.request
            .as_ref()
            .map(Request::host)
            .unwrap_or_default()
    }

    /// The subdomain portion of the request host, if any.
    pub fn subdomain(&self) -> &str {
        self.request
            .as_ref()
            .map(Request::subdomain)
            .unwrap_or_default()
    }

    /// Whether the request host carries a `www.` subdomain.
    pub fn is_www(&self) -> bool {
        self.host().starts_with("www.")
    }

    /**
    The client address, resolved through the configured forwarded-for
    headers first (taking the first entry of the first header that has
    one), then the transport peer address.
    */
    pub fn remote_addr(&self) -> String {
        for header in &self.app.configuration().remote_addr_headers {
            if let Some(value) = self.get_header(header) {
                if let Some(first) = value.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return String::from(first);
                    }
                }
            }
        }

        self.request
            .as_ref()
            .and_then(Request::peer_addr)
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    /// The last value of the named request header.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        let request = self.request.as_ref()?;
        let name = HeaderName::from_str(name).ok()?;
        request.headers().get(name).map(|v| v.as_str())
    }

    /// Whether this request was made with `XMLHttpRequest`.
    pub fn is_ajax(&self) -> bool {
        self.get_header("x-requested-with")
            .map(|value| value == "XMLHttpRequest")
            .unwrap_or_default()
    }

    /// The request's Content-Type header.
    pub fn get_content_type_requested(&self) -> Option<&str> {
        self.request().content_type()
    }

    /// The request's declared Content-Length.
    pub fn get_content_length(&self) -> u64 {
        self.request().content_length()
    }

    /// The `maxage` value of the request's Cache-Control header, or
    /// `-1` when absent.
    pub fn max_age(&self) -> i64 {
        if let Some(header) = self.get_header("cache-control") {
            for part in header.split(',') {
                let part = part.trim().replace(' ', "");
                if let Some(value) = part
                    .strip_prefix("maxage=")
                    .or_else(|| part.strip_prefix("max-age="))
                {
                    if let Ok(n) = value.parse() {
                        return n;
                    }
                }
            }
        }
        -1
    }

    //  +------------------------------------------------------------+
    //  | Url query parameters                                       |
    //  +------------------------------------------------------------+

    /// All query parameters, decoded, in order of appearance.
    pub fn url_params(&self) -> Vec<(String, String)> {
        self.request()
            .query()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let mut parts = pair.splitn(2, '=');
                (
                    decode_query(parts.next().unwrap_or_default()),
                    decode_query(parts.next().unwrap_or_default()),
                )
            })
            .collect()
    }

    /// The decoded value of the named query parameter.
    pub fn url_param(&self, name: &str) -> Option<String> {
        self.url_params()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Whether the named query parameter is present.
    pub fn url_param_exists(&self, name: &str) -> bool {
        self.url_param(name).is_some()
    }

    /// The named query parameter, or `def` when absent.
    pub fn url_param_default(&self, name: &str, def: &str) -> String {
        self.url_param(name).unwrap_or_else(|| String::from(def))
    }

    /// The named query parameter with surrounding whitespace removed.
    pub fn url_param_trim(&self, name: &str) -> Option<String> {
        self.url_param(name).map(|value| String::from(value.trim()))
    }

    /// The named query parameter parsed as an integer.
    pub fn url_param_i64(&self, name: &str) -> Option<i64> {
        self.url_param(name).and_then(|value| value.parse().ok())
    }

    /// The named query parameter parsed as an integer, or `def`.
    pub fn url_param_i64_default(&self, name: &str, def: i64) -> i64 {
        self.url_param_i64(name).unwrap_or(def)
    }

    /// The named query parameter parsed as a float.
    pub fn url_param_f64(&self, name: &str) -> Option<f64> {
        self.url_param(name).and_then(|value| value.parse().ok())
    }

    /// The named query parameter parsed as a bool.
    pub fn url_param_bool(&self, name: &str) -> Option<bool> {
        self.url_param(name).and_then(|value| value.parse().ok())
    }

    //  +------------------------------------------------------------+
    //  | Form values                                                |
    //  +------------------------------------------------------------+

    /**
    Form values from the url-encoded request body plus the query
    string. Multipart bodies are the concern of external codecs.
    */
    pub fn form_values(&self) -> Vec<(String, String)> {
        let mut values = self.url_params();

        let urlencoded = self
            .get_content_type_requested()
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or_default();

        if urlencoded {
            if let Some(body) = self.request().body() {
                let body = String::from_utf8_lossy(body);
                for pair in body.split('&').filter(|pair| !pair.is_empty()) {
                    let mut parts = pair.splitn(2, '=');
                    values.push((
                        decode_query(parts.next().unwrap_or_default()),
                        decode_query(parts.next().unwrap_or_default()),
                    ));
                }
            }
        }

        values
    }

    /// The named form value from body or query.
    pub fn form_value(&self, name: &str) -> Option<String> {
        self.form_values()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// The named form value, or `def` when absent.
    pub fn form_value_default(&self, name: &str, def: &str) -> String {
        self.form_value(name).unwrap_or_else(|| String::from(def))
    }

    //  +------------------------------------------------------------+
    //  | Response headers and status                                |
    //  +------------------------------------------------------------+

    /**
    Add a response header. An empty value removes the header
    altogether.
    */
    pub fn header(&mut self, name: &str, value: &str) {
        let Ok(name) = HeaderName::from_str(name) else {
            return;
        };
        if value.is_empty() {
            self.writer_mut().headers_mut().remove(name);
        } else {
            self.writer_mut().headers_mut().append(name, value);
        }
    }

    /**
    Set the response Content-Type. A value containing a dot is treated
    as a file path or extension and resolved through the mime table;
    the configured charset is appended to anything that does not
    already carry one, except the binary sentinel.
    */
    pub fn content_type(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }

        let mut ctype = if value.contains('.') {
            mime_guess::from_path(value)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            String::from(value)
        };

        if !ctype.contains("charset") && ctype != CONTENT_BINARY {
            ctype.push_str("; charset=");
            ctype.push_str(&self.app.configuration().charset);
        }

        self.writer_mut()
            .headers_mut()
            .insert(CONTENT_TYPE, ctype.as_str());
    }

    /// The response Content-Type as currently set.
    pub fn get_content_type(&self) -> Option<&str> {
        self.writer().headers().get(CONTENT_TYPE).map(|v| v.as_str())
    }

    /// Record the response status code. It is transmitted on the
    /// first body byte or at flush, whichever comes first.
    pub fn status_code(&mut self, status: StatusCode) {
        self.writer_mut().write_header(status);
    }

    /// The response status code as currently recorded.
    pub fn get_status_code(&self) -> StatusCode {
        self.writer().status_code()
    }

    /// Record a 404. The registered not-found handler chain fires at
    /// the end of the request unless something is written first.
    pub fn not_found(&mut self) {
        self.status_code(StatusCode::NotFound);
    }

    //  +------------------------------------------------------------+
    //  | Body writers                                               |
    //  +------------------------------------------------------------+

    /// Write body bytes through the current writer layer.
    pub async fn write(&mut self, contents: &[u8]) -> Result<usize> {
        self.writer_mut().write(contents).await
    }

    /// Write a string body through the current writer layer.
    pub async fn write_string(&mut self, contents: &str) -> Result<usize> {
        self.writer_mut().write_string(contents).await
    }

    /// Write formatted content through the current writer layer.
    pub async fn writef(&mut self, args: fmt::Arguments<'_>) -> Result<usize> {
        self.writer_mut().writef(args).await
    }

    /// Write an html body, setting the content type.
    pub async fn html(&mut self, contents: &str) -> Result<usize> {
        self.content_type("text/html");
        self.write_string(contents).await
    }

    /// Write a plain-text body, setting the content type.
    pub async fn text(&mut self, contents: &str) -> Result<usize> {
        self.content_type("text/plain");
        self.write_string(contents).await
    }

    /// Write a binary body, setting the content type to the binary
    /// sentinel.
    pub async fn binary(&mut self, contents: &[u8]) -> Result<usize> {
        self.content_type(CONTENT_BINARY);
        self.write(contents).await
    }

    /**
    Redirect to `url`, stopping execution. The status is the previous
    response code when it was a redirect code, else the provided one,
    else 302.
    */
    pub fn redirect(&mut self, url: &str, status: Option<StatusCode>) {
        self.stop_execution();

        let previous = self.get_status_code();
        let mut chosen = if (previous as u16) >= 300 {
            Some(previous)
        } else {
            None
        };
        if let Some(status) = status {
            chosen = Some(status);
        }

        self.writer_mut().headers_mut().insert(LOCATION, url);
        self.status_code(chosen.unwrap_or(StatusCode::Found));
    }

    //  +------------------------------------------------------------+
    //  | Body readers                                               |
    //  +------------------------------------------------------------+

    /**
    Install a request body size limit, enforced by the framework body
    readers: once a read would exceed it, the read fails. Should be
    called before the body is read.
    */
    pub fn set_max_request_body_size(&mut self, limit: u64) {
        self.max_request_body_size = Some(limit);
    }

    /**
    Read the full request body, honoring the installed size limit.
    Unless the configuration preserves bodies, the body is consumed
    and subsequent reads observe it empty.
    */
    pub fn read_body(&mut self) -> Result<Vec<u8>> {
        let preserve = self
            .app
            .configuration()
            .disable_body_consumption_on_unmarshal;

        let request = self.request_mut();
        let body = if preserve {
            request.body().map(<[u8]>::to_vec)
        } else {
            request.take_body()
        };
        let body = body.unwrap_or_default();

        if let Some(limit) = self.max_request_body_size {
            if body.len() as u64 > limit {
                return Err(Error::BodyLimitExceeded(limit));
            }
        }

        Ok(body)
    }

    /// Read the full request body as a string.
    pub fn read_string(&mut self) -> Result<String> {
        let body = self.read_body()?;
        String::from_utf8(body)
            .map_err(|err| Error::EncodingError(err.utf8_error()))
    }

    /**
    Read the full request body and decode it into `out`, which carries
    its own decoding capability. Preferred over
    [`Context::unmarshal_body_with`] when the target type knows how to
    decode itself.
    */
    pub fn unmarshal_body<D: BodyDecoder>(&mut self, out: &mut D) -> Result<()> {
        let body = self.read_body()?;
        out.decode(&body).map_err(invalid_body)
    }

    /// Read the full request body and run the provided unmarshaler
    /// over it.
    pub fn unmarshal_body_with<T>(
        &mut self,
        unmarshaler: impl FnOnce(&[u8]) -> std::result::Result<T, BoxedDecodeError>,
    ) -> Result<T> {
        let body = self.read_body()?;
        unmarshaler(&body).map_err(invalid_body)
    }

    //  +------------------------------------------------------------+
    //  | Expiration                                                 |
    //  +------------------------------------------------------------+

    /// Set the Last-Modified response header from `modtime`.
    pub fn set_last_modified(&mut self, modtime: SystemTime) {
        self.writer_mut()
            .headers_mut()
            .insert(LAST_MODIFIED, httpdate::fmt_http_date(modtime).as_str());
    }

    /**
    Whether the resource changed since the client's `If-Modified-Since`
    timestamp. `Ok(false)` means a 304 is appropriate. Sub-second drift
    counts as unmodified. An `Err` means the check did not apply (not a
    GET/HEAD, no header, or unparseable header), not that the resource
    changed.
    */
    pub fn check_if_modified_since(&self, modtime: SystemTime) -> Result<bool> {
        let method = self.method();
        if method != Method::Get && method != Method::Head {
            return Err(Error::Skipped("method"));
        }
        let ims = self
            .get_header(IF_MODIFIED_SINCE.as_str())
            .ok_or(Error::Skipped("if-modified-since header missing"))?;
        let client_time =
            httpdate::parse_http_date(ims).map_err(|_| Error::Skipped("unparseable time"))?;

        Ok(modtime >= client_time + Duration::from_secs(1))
    }

    /**
    Answer 304 Not Modified, removing the headers a bodiless
    revalidation must not carry: Content-Type, Content-Length, and
    Last-Modified when an ETag is present.
    */
    pub fn write_not_modified(&mut self) {
        let headers = self.writer_mut().headers_mut();
        headers.remove(CONTENT_TYPE);
        headers.remove(CONTENT_LENGTH);
        if headers.get(ETAG).is_some() {
            headers.remove(LAST_MODIFIED);
        }
        self.status_code(StatusCode::NotModified);
    }

    /// Write `body` with Last-Modified bookkeeping: a 304 when the
    /// client is current, the body otherwise.
    pub async fn write_with_expiration(
        &mut self,
        body: &[u8],
        modtime: SystemTime,
    ) -> Result<usize> {
        if let Ok(false) = self.check_if_modified_since(modtime) {
            self.write_not_modified();
            return Ok(0);
        }

        self.set_last_modified(modtime);
        self.write(body).await
    }

    //  +------------------------------------------------------------+
    //  | Gzip                                                       |
    //  +------------------------------------------------------------+

    /// Whether any Accept-Encoding token of this request mentions
    /// gzip.
    pub fn client_supports_gzip(&self) -> bool {
        self.get_header("accept-encoding")
            .map(|header| {
                header
                    .split(',')
                    .any(|token| token.trim().split(';').next().unwrap_or_default().contains("gzip"))
            })
            .unwrap_or_default()
    }

    /**
    Upgrade the current writer to the gzip layer (once) and return it.
    Subsequent context writes buffer uncompressed bytes that are
    compressed onto the wire at flush.
    */
    pub fn gzip_response_writer(&mut self) -> &mut crate::GzipResponseWriter {
        if !matches!(self.writer(), ResponseWriter::Gzip(_)) {
            let inner = self
                .writer
                .take()
                .expect("context used outside of a request lifecycle");
            let mut gzip = gzip_writer_pool().get().unwrap_or_default();
            gzip.begin_gzip_response(inner);
            self.writer = Some(ResponseWriter::Gzip(gzip));
        }
        self.writer_mut()
            .gzip_mut()
            .expect("gzip writer was just installed")
    }

    /// Write gzip-buffered bytes, failing when the client did not
    /// advertise gzip support.
    pub async fn write_gzip(&mut self, contents: &[u8]) -> Result<usize> {
        if !self.client_supports_gzip() {
            return Err(Error::GzipUnsupported);
        }
        Ok(self.gzip_response_writer().write(contents))
    }

    /// Like [`Context::write_gzip`], but falls back to a plain write
    /// for clients without gzip support.
    pub async fn try_write_gzip(&mut self, contents: &[u8]) -> Result<usize> {
        match self.write_gzip(contents).await {
            Ok(n) => Ok(n),
            Err(Error::GzipUnsupported) => self.write(contents).await,
            Err(error) => Err(error),
        }
    }

    /// Enable or disable transparent gzip compression for subsequent
    /// writes, when the client supports it.
    pub fn gzip(&mut self, enable: bool) {
        if enable {
            if self.client_supports_gzip() {
                let _ = self.gzip_response_writer();
            }
        } else if let Some(gzip) = self.writer_mut().gzip_mut() {
            gzip.disable();
        }
    }

    //  +------------------------------------------------------------+
    //  | Recording                                                  |
    //  +------------------------------------------------------------+

    /**
    Upgrade the base writer to the recording layer, so that status,
    headers and body can be reset or replaced until the response is
    flushed. A no-op when a recorder or gzip layer is already active.
    */
    pub fn record(&mut self) {
        if matches!(self.writer(), ResponseWriter::Base(_)) {
            let inner = self
                .writer
                .take()
                .expect("context used outside of a request lifecycle");
            self.writer = Some(ResponseWriter::Recorder(ResponseRecorder::begin_record(
                inner,
            )));
        }
    }

    /// The recording layer, starting it if the base writer is still
    /// active. `None` when a gzip layer is in the way.
    pub fn recorder(&mut self) -> Option<&mut ResponseRecorder> {
        self.record();
        self.writer_mut().recorder_mut()
    }

    /// Whether the recording layer is active.
    pub fn is_recording(&self) -> bool {
        self.writer().is_recording()
    }

    //  +------------------------------------------------------------+
    //  | Streaming and connection lifecycle                         |
    //  +------------------------------------------------------------+

    /**
    Repeatedly call `writer` to produce body chunks, flushing after
    each one, until it returns `false` or the client connection goes
    away. The callback fills the provided buffer; the framework owns
    the writes.
    */
    pub async fn stream_writer(
        &mut self,
        mut writer: impl FnMut(&mut Vec<u8>) -> bool,
    ) -> Result<()> {
        let notify_closed = self.writer().close_notify();
        let mut buf = Vec::new();

        loop {
            if notify_closed.try_recv().is_ok() {
                return Ok(());
            }

            let should_continue = writer(&mut buf);
            if !buf.is_empty() {
                self.write(&buf).await?;
                buf.truncate(0);
            }
            self.writer_mut().flush().await?;

            if !should_continue {
                return Ok(());
            }
        }
    }

    /**
    Run `cb` on its own task when the underlying connection is observed
    to have gone away, at most once. Returns whether the writer could
    provide a close notification channel.
    */
    pub fn on_connection_close(&self, cb: impl FnOnce() + Send + 'static) -> bool {
        let notify = self.writer().close_notify();
        smol::spawn(async move {
            if notify.recv().await.is_ok() {
                cb();
            }
        })
        .detach();
        true
    }

    /**
    Run `cb` when the connection closes or right before the response is
    flushed, whichever happens first, at most once. The pre-flush slot
    holds a single callback: registering again replaces the previous
    one.
    */
    pub fn on_close(&mut self, cb: impl Fn() + Send + Sync + 'static) {
        let cb = Arc::new(cb);
        let once = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let cb = cb.clone();
            let once = once.clone();
            self.on_connection_close(move || {
                if !once.swap(true, Ordering::SeqCst) {
                    cb();
                }
            });
        }

        self.writer_mut().set_before_flush(Box::new(move || {
            if !once.swap(true, Ordering::SeqCst) {
                cb();
            }
        }));
    }

    //  +------------------------------------------------------------+
    //  | Views                                                      |
    //  +------------------------------------------------------------+

    /// Record the layout for a subsequent [`Context::view`] call in
    /// the same request.
    pub fn view_layout(&mut self, layout: &str) {
        self.values.set(VIEW_LAYOUT_KEY, String::from(layout));
    }

    /// Record a data value for the view engine, readable under
    /// `trellis.view.data.<key>`.
    pub fn view_data(&mut self, key: &str, value: impl std::any::Any + Send + Sync) {
        self.values.set(format!("{VIEW_DATA_PREFIX}{key}"), value);
    }

    /**
    Render `filename` through the application's view engine, honoring
    the recorded layout and data contexts. On failure the status
    becomes 500 and execution stops.
    */
    pub async fn view(&mut self, filename: &str) -> Result<()> {
        self.content_type("text/html");

        let layout = self
            .values
            .get_string(VIEW_LAYOUT_KEY)
            .map(String::from)
            .unwrap_or_default();

        let app = self.app.clone();
        let Some(engine) = app.view_engine() else {
            log::error!("view: no view engine registered");
            self.status_code(StatusCode::InternalServerError);
            self.stop_execution();
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no view engine registered",
            )));
        };

        let mut rendered = Vec::new();
        match engine.render(&mut rendered, filename, &layout, &self.values) {
            Ok(()) => {
                self.write(&rendered).await?;
                Ok(())
            }
            Err(error) => {
                log::error!("view: {}", error);
                self.status_code(StatusCode::InternalServerError);
                self.stop_execution();
                Err(error.into())
            }
        }
    }

    //  +------------------------------------------------------------+
    //  | Files                                                      |
    //  +------------------------------------------------------------+

    /**
    Serve in-memory content as a file: content type from the filename
    extension, Last-Modified bookkeeping (a 304 when the client is
    current), and gzip when requested and supported.
    */
    pub async fn serve_content(
        &mut self,
        content: &[u8],
        filename: &str,
        modtime: SystemTime,
        gzip_compression: bool,
    ) -> Result<usize> {
        if let Ok(false) = self.check_if_modified_since(modtime) {
            self.write_not_modified();
            return Ok(0);
        }

        self.content_type(filename);
        self.set_last_modified(modtime);

        if gzip_compression && self.client_supports_gzip() {
            self.write_gzip(content).await
        } else {
            self.write(content).await
        }
    }

    /// Serve a file from disk. See [`Context::serve_content`].
    pub async fn serve_file(&mut self, path: &Path, gzip_compression: bool) -> Result<usize> {
        let owned = path.to_path_buf();
        let (content, modtime) = smol::unblock(move || {
            let content = std::fs::read(&owned)?;
            let modtime = std::fs::metadata(&owned)
                .and_then(|meta| meta.modified())
                .unwrap_or_else(|_| SystemTime::now());
            std::io::Result::Ok((content, modtime))
        })
        .await?;

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.serve_content(&content, &filename, modtime, gzip_compression)
            .await
    }

    /// Serve a file as a forced download under `destination_name`.
    pub async fn send_file(&mut self, path: &Path, destination_name: &str) -> Result<usize> {
        self.header(
            "content-disposition",
            &format!("attachment;filename={destination_name}"),
        );
        self.serve_file(path, false).await
    }

    //  +------------------------------------------------------------+
    //  | Cookies                                                    |
    //  +------------------------------------------------------------+

    /// Add a Set-Cookie header for the provided cookie.
    pub fn set_cookie(&mut self, cookie: &Cookie<'_>) {
        self.writer_mut()
            .headers_mut()
            .append(SET_COOKIE, cookie.to_string().as_str());
    }

    /// Set a session-ish cookie with path `/`, http-only, and a two
    /// hour lifetime.
    pub fn set_cookie_kv(&mut self, name: &str, value: &str) {
        let mut cookie = Cookie::new(String::from(name), String::from(value));
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_max_age(cookie::time::Duration::minutes(120));
        self.set_cookie(&cookie);
    }

    /// The value of the named request cookie.
    pub fn get_cookie(&self, name: &str) -> Option<String> {
        let header = self.request().headers().get(COOKIE)?;
        for part in header.as_str().split(';') {
            if let Ok(cookie) = Cookie::parse(part.trim()) {
                if cookie.name() == name {
                    return Some(String::from(cookie.value()));
                }
            }
        }
        None
    }

    /// Instruct the client to drop the named cookie.
    pub fn remove_cookie(&mut self, name: &str) {
        let mut cookie = Cookie::new(String::from(name), String::new());
        cookie.set_path("/");
        cookie.make_removal();
        self.set_cookie(&cookie);
    }

    /// Visit every request cookie in order.
    pub fn visit_all_cookies(&self, mut visitor: impl FnMut(&str, &str)) {
        if let Some(header) = self.request().headers().get(COOKIE) {
            for part in header.as_str().split(';') {
                if let Ok(cookie) = Cookie::parse(part.trim()) {
                    visitor(cookie.name(), cookie.value());
                }
            }
        }
    }

    //  +------------------------------------------------------------+
    //  | Transactions                                               |
    //  +------------------------------------------------------------+

    /// Short-circuit any subsequent [`Context::begin_transaction`]
    /// calls in this request.
    pub fn skip_transactions(&mut self) {
        self.values.set(SKIP_TRANSACTIONS_KEY, 1i64);
    }

    /// Whether transactions have been skipped for this request.
    pub fn transactions_skipped(&self) -> bool {
        self.values.get_i64(SKIP_TRANSACTIONS_KEY) == Some(1)
    }

    //  +------------------------------------------------------------+
    //  | Cross-routing                                              |
    //  +------------------------------------------------------------+

    /**
    Dispatch another route of the application as if `method path` had
    been requested, then restore the chain, cursor, method and path of
    the outer request. Parameters and user values are shared across the
    inner call, so the two routes can communicate.
    */
    pub async fn exec(&mut self, method: Method, path: &str) {
        if path.is_empty() {
            return;
        }

        let backup_handlers = std::mem::take(&mut self.handlers);
        let backup_cursor = self.cursor;
        let (backup_path, backup_method) = {
            let request = self.request();
            (String::from(request.raw_path()), request.method())
        };

        {
            let request = self.request_mut();
            request.set_method(method);
            request.set_raw_path(path);
        }
        self.cursor = 0;

        let app = self.app.clone();
        app.serve_http_c(self).await;

        {
            let request = self.request_mut();
            request.set_method(backup_method);
            request.set_raw_path(&backup_path);
        }
        self.handlers = backup_handlers;
        self.cursor = backup_cursor;
    }

    /// Whether a route exists for the method and path, honoring this
    /// request's host for subdomain routes.
    pub fn route_exists(&mut self, method: Method, path: &str) -> bool {
        let app = self.app.clone();
        app.route_exists(self, method, path)
    }
}

/// The boxed error type decoders and unmarshalers report.
pub type BoxedDecodeError = Box<dyn std::error::Error + Send + Sync>;

/**
The self-decoding capability: a type that knows how to populate itself
from raw request body bytes. Preferred by
[`Context::unmarshal_body`] over an external unmarshaler.
*/
pub trait BodyDecoder {
    /// Decode the raw body into `self`.
    fn decode(&mut self, body: &[u8]) -> std::result::Result<(), BoxedDecodeError>;
}

fn invalid_body(err: BoxedDecodeError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}
