#![forbid(unsafe_code)]
#![deny(
    clippy::dbg_macro,
    rustdoc::missing_crate_level_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications
)]
#![warn(missing_docs)]
/*!
Routing for the trellis web framework, and the [`App`] type that ties
the framework together.

The matcher is a compact trie keyed by `(method, subdomain)`: static
segments, `:named` parameters, `*wildcard` tails, with literal > named
> wildcard preference and back-off to the nearest wildcard ancestor.
Route state (online/offline, method swaps) can change at runtime and
takes effect on [`App::refresh_router`].
*/

pub mod path;
pub use path::{Segment, Template};

mod route;
pub use route::Route;

mod trie;
pub use trie::{Trie, TrieNode};

mod handler;
pub use handler::{RouterHandler, SUBDOMAIN_WILDCARD_INDICATOR};

mod router;
pub use router::{RawHandler, Router, WrapperFunc};

mod status;
pub use status::{fire_status_handler, ErrorCodeHandler, ErrorCodeHandlers};

mod execution_rules;
pub use execution_rules::{ExecutionOptions, ExecutionRules};

mod app;
pub use app::App;

pub use http_types::Method;
