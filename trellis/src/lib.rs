#![forbid(unsafe_code)]
#![deny(
    clippy::dbg_macro,
    rustdoc::missing_crate_level_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications
)]
/*!
# Welcome to the `trellis` crate!

This crate is the core of the trellis web framework: the per-request
[`Context`] that a chain of [`Handler`]s threads through, the layered
response writer stack ([`ResponseWriter`]) that the context writes into,
and the object pools that recycle both across requests.

Routing, the server supervisor, and the tls stack live in sibling
crates; this one tries to stay focused on the request/response lifecycle
itself:

* a [`Context`] is acquired from a [`ContextPool`] when a request
  arrives and released (and recycled) when the response has been
  flushed;
* handlers are async functions over `&mut Context` with explicit chain
  control: [`Context::next`], [`Context::skip`],
  [`Context::stop_execution`];
* the response writer starts as a plain [`BaseWriter`] that owns the
  connection's transport, and can be layered with a recording writer
  (for transactional responses) or a gzip writer (for transparent
  compression) at any point in the chain.
*/

mod handler;
pub use handler::{handler, BoxFuture, Handler, Handlers};

mod context;
pub use context::{
    last_captured_context_id, BodyDecoder, BoxedDecodeError, Context, CONTENT_BINARY, NO_LAYOUT,
    VIEW_DATA_PREFIX, VIEW_LAYOUT_KEY,
};

mod store;
pub use store::Store;

mod params;
pub use params::RequestParams;

mod response_writer;
pub use response_writer::{
    base_writer_pool, BaseWriter, BeforeFlush, ResponseWriter, NO_WRITTEN, STATUS_CODE_WRITTEN,
};

mod response_recorder;
pub use response_recorder::ResponseRecorder;

mod gzip_writer;
pub use gzip_writer::{add_gzip_headers, gzip_writer_pool, GzipResponseWriter};

mod pool;
pub use pool::{ContextFactory, ContextPool, Pool};

mod application;
pub use application::{Application, Configuration, RouteInfo, ViewEngine};

mod transaction;

pub mod errors;
pub use errors::{FrameworkError, Reporter};

pub use async_trait::async_trait;
pub use log;
pub use trellis_http as http;
pub use trellis_http::{http_types, Method, StatusCode};

/// Whether a status code is outside the successful range, defined as
/// `< 200 || >= 400`. Status-code handlers fire only for these.
pub fn status_code_not_successful(status: StatusCode) -> bool {
    let code = status as u16;
    !(200..400).contains(&code)
}
