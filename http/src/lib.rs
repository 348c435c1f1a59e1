#![forbid(unsafe_code)]
#![deny(
    clippy::dbg_macro,
    missing_copy_implementations,
    rustdoc::missing_crate_level_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications
)]
#![warn(missing_docs)]
/*!
This crate provides the http 1.x plumbing for trellis.

It owns the lowest layer of the stack: the [`Transport`](transport::Transport)
abstraction over a bidirectional byte stream, the head parser that turns
incoming bytes into a [`Request`], and the [`HttpService`] seam through
which the framework above receives `(transport, request)` pairs and hands
the transport back when it is done with it.

As this is primarily intended for internal use by the higher-level trellis
crates, the api here is likely to be less stable than theirs.
*/

mod error;
pub use error::{Error, Result};

mod http_config;
pub use http_config::HttpConfig;

mod request;
pub use request::Request;

mod receive;
pub use receive::{receive_request, should_close};

mod service;
pub use service::HttpService;

/// Types to represent the bidirectional data stream over which the
/// http protocol is communicated
pub mod transport;
pub use transport::{BoxedTransport, Transport};

mod util;
pub use util::{decode_path, decode_query, is_loopback_subdomain};

pub use http_types;
pub use http_types::{headers, headers::Headers, Method, StatusCode, Url, Version};
pub use stopper::Stopper;

/// A pre-rendered http response to send when the request head could
/// not be parsed.
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r
Connection: close\r
Content-Length: 0\r
\r\n";
