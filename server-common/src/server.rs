use crate::{Acceptor, CloneCounter};
use async_net::{TcpListener, TcpStream};
use futures_lite::{AsyncWriteExt, StreamExt};
use smol::Timer;
use std::{io, net::SocketAddr, sync::Arc};
use stopper::Stopper;
use trellis_http::{
    receive_request, should_close, BoxedTransport, Error, HttpConfig, HttpService, Transport,
    BAD_REQUEST,
};

/// The error string a supervised serve resolves with after a graceful
/// stop. Register it as an ignored error to keep it away from
/// on-error hooks.
pub const SERVER_CLOSED: &str = "server closed";

/// The error a supervised serve resolves with after a graceful stop.
pub fn server_closed() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, SERVER_CLOSED))
}

/**
A listening http server: an address, tuning parameters, and the
[`HttpService`] that answers requests. One server per listening
endpoint; the [`Supervisor`](crate::Supervisor) wraps it with
lifecycle management.
*/
pub struct Server {
    addr: String,
    http_config: HttpConfig,
    service: Arc<dyn HttpService>,
    stopper: Stopper,
    counter: CloneCounter,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("active_connections", &self.counter.current())
            .finish()
    }
}

impl Server {
    /// Construct a server for the address, e.g. `":8080"` or
    /// `"localhost:3000"`.
    pub fn new(addr: &str, service: Arc<dyn HttpService>) -> Self {
        Self {
            addr: String::from(addr),
            http_config: HttpConfig::default(),
            service,
            stopper: Stopper::new(),
            counter: CloneCounter::new(),
        }
    }

    /// Replace the http tuning parameters.
    pub fn with_http_config(mut self, http_config: HttpConfig) -> Self {
        self.http_config = http_config;
        self
    }

    /// The configured address, with an empty host expanded.
    pub fn addr(&self) -> String {
        resolve_addr(&self.addr)
    }

    /// The stopper that winds this server down.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// The active-connection counter.
    pub fn counter(&self) -> &CloneCounter {
        &self.counter
    }

    /// The service answering this server's requests.
    pub fn service(&self) -> Arc<dyn HttpService> {
        self.service.clone()
    }

    /// The http tuning parameters.
    pub fn http_config(&self) -> HttpConfig {
        self.http_config
    }

    /// Bind this server's address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.addr()).await
    }

    /**
    Accept connections until the stopper stops, serving each on its
    own task through the provided acceptor. Always resolves with the
    [`SERVER_CLOSED`] error, matching the contract that a finished
    serve is an abnormal condition unless it was a graceful stop.
    */
    pub async fn serve<A: Acceptor<TcpStream>>(
        &self,
        listener: TcpListener,
        acceptor: A,
        secure: bool,
    ) -> Result<(), Error> {
        log::info!("listening on {:?}", listener.local_addr());
        let mut incoming = self.stopper.stop_stream(listener.incoming());

        while let Some(Ok(stream)) = incoming.next().await {
            let _ = stream.set_nodelay(true);
            let peer = stream.peer_addr().ok();
            smol::spawn(handle_stream(
                stream,
                acceptor.clone(),
                self.service.clone(),
                self.stopper.clone(),
                self.http_config,
                self.counter.clone(),
                peer,
                secure,
            ))
            .detach();
        }

        Err(server_closed())
    }
}

/// Expand `":8080"` to `"0.0.0.0:8080"` and the bare `":http"` /
/// `":https"` service names to their ports.
pub(crate) fn resolve_addr(addr: &str) -> String {
    let addr = match addr {
        ":http" => ":80",
        ":https" => ":443",
        other => other,
    };
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        String::from(addr)
    }
}

/**
Serve one accepted stream: perform the acceptor's handshake, then loop
parsing requests and feeding them to the service until the connection
closes, errors, is hijacked, or the stopper stops.
*/
#[allow(clippy::too_many_arguments)]
pub async fn handle_stream<T: Transport>(
    stream: T,
    acceptor: impl Acceptor<T>,
    service: Arc<dyn HttpService>,
    stopper: Stopper,
    config: HttpConfig,
    counter: CloneCounter,
    peer: Option<SocketAddr>,
    secure: bool,
) {
    let stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(error) => {
            log::error!("acceptor error: {:?}", error);
            return;
        }
    };

    serve_transport(stream, service, stopper, config, counter, peer, secure).await;
}

/**
The keep-alive request loop over an already-negotiated transport.
*/
pub async fn serve_transport<T: Transport>(
    stream: T,
    service: Arc<dyn HttpService>,
    stopper: Stopper,
    config: HttpConfig,
    counter: CloneCounter,
    peer: Option<SocketAddr>,
    secure: bool,
) {
    let _counter = counter;
    let mut transport = BoxedTransport::new(stream);
    let mut buffer = Vec::new();

    loop {
        let received = receive_with_timeout(&mut transport, &mut buffer, &stopper, &config).await;

        match received {
            Ok(Some(mut request)) => {
                request.set_peer_addr(peer);
                request.set_secure(secure);

                let close = should_close(&request) || stopper.is_stopped();

                match service.call(transport, request).await {
                    Some(returned) => {
                        transport = returned;
                        if close {
                            break;
                        }
                    }
                    None => {
                        // hijacked, the transport is no longer ours
                        log::debug!("connection taken over by the service");
                        return;
                    }
                }
            }

            Ok(None) | Err(Error::Closed) => {
                log::debug!("closing connection");
                break;
            }

            Err(Error::Io(error)) if error.kind() == io::ErrorKind::TimedOut => {
                log::debug!("closing idle connection after read timeout");
                break;
            }

            Err(error) => {
                log::error!("http error: {:?}", error);
                let _ = transport.write_all(BAD_REQUEST).await;
                break;
            }
        }
    }
}

async fn receive_with_timeout(
    transport: &mut BoxedTransport,
    buffer: &mut Vec<u8>,
    stopper: &Stopper,
    config: &HttpConfig,
) -> Result<Option<trellis_http::Request>, Error> {
    match config.read_timeout {
        None => receive_request(transport, buffer, stopper, config).await,
        Some(timeout) => {
            let read = receive_request(transport, buffer, stopper, config);
            let deadline = async {
                Timer::after(timeout).await;
                Err(Error::Io(io::ErrorKind::TimedOut.into()))
            };
            futures_lite::future::or(read, deadline).await
        }
    }
}
