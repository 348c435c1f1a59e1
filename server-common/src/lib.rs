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
The serving side of trellis: the tcp accept loop, the per-connection
request loop, tls acceptors (manual certificates and automatic ACME),
the [`Supervisor`] that wraps a listening server with lifecycle hooks
and deferred-flow control, and the process-wide [`interrupt`] listener.
*/

mod acceptor;
pub use acceptor::Acceptor;

mod clone_counter;
pub use clone_counter::CloneCounter;

mod server;
pub use server::{handle_stream, serve_transport, server_closed, Server, SERVER_CLOSED};

mod supervisor;
pub use supervisor::{Supervisor, TaskHost};

mod tls;
pub use tls::RustlsAcceptor;

mod interrupt;
pub use interrupt::{interrupt, register_on_interrupt, InterruptListener};

pub use stopper::Stopper;
