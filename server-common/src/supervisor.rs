use crate::{
    server::{server_closed, serve_transport, Server},
    RustlsAcceptor,
};
use async_net::TcpListener;
use futures_lite::{Future, StreamExt};
use futures_rustls::rustls::ServerConfig;
use rustls_acme::{caches::DirCache, AcmeConfig};
use smol::Timer;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use stopper::Stopper;
use trellis_http::{Error, HttpConfig, HttpService};

/// The grace period the auto-tls auxiliary redirect server gets to
/// wind down during shutdown.
const AUX_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/**
The handle an on-serve hook receives: enough to identify the endpoint
and to ask the supervised server to wind down.
*/
#[derive(Clone)]
pub struct TaskHost {
    /// the resolved listening address
    pub addr: String,
    stopper: Stopper,
}

impl std::fmt::Debug for TaskHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHost").field("addr", &self.addr).finish()
    }
}

impl TaskHost {
    /// Ask the supervised server to stop accepting and wind down.
    pub fn shutdown(&self) {
        self.stopper.stop();
    }
}

/**
# The wrapper and manager for a listening server.

A supervisor owns one [`Server`] and adds lifecycle management on top:

* hook lists for on-serve, on-error and on-shutdown, each callback
  notified on its own task;
* an ignored-error string set that filters expected errors (such as
  [`SERVER_CLOSED`](crate::SERVER_CLOSED)) away from hooks and from
  the serve result;
* a deferred-flow gate: [`Supervisor::defer_flow`] keeps `serve` from
  returning after its inner serve finished, until
  [`Supervisor::restore_flow`];
* the tls variants: plaintext, manual certificates, and automatic
  ACME with an auxiliary port-80 redirect server.
*/
pub struct Supervisor {
    server: Server,
    closed_manually: AtomicI32,
    manually_tls: AtomicBool,
    should_wait: AtomicI32,
    unblock_tx: async_channel::Sender<()>,
    unblock_rx: async_channel::Receiver<()>,
    ignored_errors: Mutex<Vec<String>>,
    on_serve: Mutex<Vec<Arc<dyn Fn(TaskHost) + Send + Sync>>>,
    on_err: Mutex<Vec<Arc<dyn Fn(Arc<Error>) + Send + Sync>>>,
    on_shutdown: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("server", &self.server)
            .field("closed_manually", &self.closed_manually.load(Ordering::SeqCst))
            .field("should_wait", &self.should_wait.load(Ordering::SeqCst))
            .finish()
    }
}

impl Supervisor {
    /// Construct a supervisor around a server for `addr` and
    /// `service`.
    pub fn new(addr: &str, service: Arc<dyn HttpService>) -> Self {
        Self::from_server(Server::new(addr, service))
    }

    /// Construct a supervisor around an existing server.
    pub fn from_server(server: Server) -> Self {
        let (unblock_tx, unblock_rx) = async_channel::bounded(1);
        Self {
            server,
            closed_manually: AtomicI32::new(0),
            manually_tls: AtomicBool::new(false),
            should_wait: AtomicI32::new(0),
            unblock_tx,
            unblock_rx,
            ignored_errors: Mutex::new(Vec::new()),
            on_serve: Mutex::new(Vec::new()),
            on_err: Mutex::new(Vec::new()),
            on_shutdown: Mutex::new(Vec::new()),
        }
    }

    /// The supervised server.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Whether [`Supervisor::shutdown`] has been called.
    pub fn closed_manually(&self) -> bool {
        self.closed_manually.load(Ordering::SeqCst) != 0
    }

    /**
    Add an error string to ignore: errors whose rendered message
    matches an entry are filtered to success before reaching on-error
    hooks or the serve result.
    */
    pub fn ignore_error(&self, message: &str) {
        if let Ok(mut ignored) = self.ignored_errors.lock() {
            ignored.push(String::from(message));
        }
    }

    //  +------------------------------------------------------------+
    //  | Hooks                                                      |
    //  +------------------------------------------------------------+

    /// Register a callback to run when serving begins. Each callback
    /// is notified on its own task.
    pub fn register_on_serve(&self, cb: impl Fn(TaskHost) + Send + Sync + 'static) {
        if let Ok(mut on_serve) = self.on_serve.lock() {
            on_serve.push(Arc::new(cb));
        }
    }

    /// Register a callback for errors surfaced by the underlying
    /// server, after ignored-error filtering.
    pub fn register_on_error(&self, cb: impl Fn(Arc<Error>) + Send + Sync + 'static) {
        if let Ok(mut on_err) = self.on_err.lock() {
            on_err.push(Arc::new(cb));
        }
    }

    /// Register a callback to run on [`Supervisor::shutdown`]. It
    /// should start protocol-specific cleanup, not wait for it.
    pub fn register_on_shutdown(&self, cb: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut on_shutdown) = self.on_shutdown.lock() {
            on_shutdown.push(Arc::new(cb));
        }
    }

    fn notify_serve(&self) {
        let host = TaskHost {
            addr: self.server.addr(),
            stopper: self.server.stopper(),
        };

        if let Ok(on_serve) = self.on_serve.lock() {
            for cb in on_serve.iter() {
                let cb = cb.clone();
                let host = host.clone();
                smol::spawn(async move { cb(host) }).detach();
            }
        }
    }

    fn notify_err(&self, error: &Arc<Error>) {
        if self.validate_err(error).is_none() {
            return;
        }
        if let Ok(on_err) = self.on_err.lock() {
            for cb in on_err.iter() {
                let cb = cb.clone();
                let error = error.clone();
                smol::spawn(async move { cb(error) }).detach();
            }
        }
    }

    fn notify_shutdown(&self) {
        if let Ok(on_shutdown) = self.on_shutdown.lock() {
            for cb in on_shutdown.iter() {
                let cb = cb.clone();
                smol::spawn(async move { cb() }).detach();
            }
        }
    }

    fn validate_err<'e>(&self, error: &'e Arc<Error>) -> Option<&'e Arc<Error>> {
        let rendered = error.to_string();
        let ignored = self
            .ignored_errors
            .lock()
            .map(|ignored| ignored.iter().any(|entry| *entry == rendered))
            .unwrap_or_default();
        if ignored {
            None
        } else {
            Some(error)
        }
    }

    //  +------------------------------------------------------------+
    //  | Deferred flow                                              |
    //  +------------------------------------------------------------+

    /**
    Defer the flow of execution: after the inner serve returns, the
    supervised serve blocks until [`Supervisor::restore_flow`] instead
    of propagating its result, giving a task the chance to repair the
    host.
    */
    pub fn defer_flow(&self) {
        self.should_wait.store(1, Ordering::SeqCst);
    }

    /// Restore the flow of execution. Does nothing without a
    /// preceding [`Supervisor::defer_flow`].
    pub fn restore_flow(&self) {
        if self.is_waiting() {
            self.should_wait.store(0, Ordering::SeqCst);
            // size-one channel, never blocks
            let _ = self.unblock_tx.try_send(());
        }
    }

    fn is_waiting(&self) -> bool {
        self.should_wait.load(Ordering::SeqCst) != 0
    }

    //  +------------------------------------------------------------+
    //  | Serving                                                    |
    //  +------------------------------------------------------------+

    /**
    Run the provided serve future under supervision: notify on-serve
    hooks, run it, pass its error through the ignored filter and the
    on-error hooks, honor the deferred-flow gate, and return the
    filtered result.
    */
    pub async fn supervise<F>(&self, serve: F) -> Result<(), Arc<Error>>
    where
        F: Future<Output = Result<(), Error>>,
    {
        self.notify_serve();

        let error = serve.await.err().map(Arc::new);

        if let Some(error) = &error {
            self.notify_err(error);
        }

        if self.is_waiting() {
            let _ = self.unblock_rx.recv().await;
        }

        match error.as_ref().and_then(|error| self.validate_err(error)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Serve plaintext http on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Arc<Error>> {
        self.supervise(self.server.serve(listener, (), false)).await
    }

    /// Bind the configured address and serve plaintext http over it,
    /// with nodelay set on accepted connections.
    pub async fn listen_and_serve(&self) -> Result<(), Arc<Error>> {
        let listener = self.server.bind().await.map_err(wrap_io)?;
        self.serve(listener).await
    }

    /**
    Bind the configured address and serve https with the provided
    pem-encoded certificate chain and key files.
    */
    pub async fn listen_and_serve_tls(
        &self,
        cert_file: &str,
        key_file: &str,
    ) -> Result<(), Arc<Error>> {
        self.manually_tls.store(true, Ordering::SeqCst);

        let acceptor = RustlsAcceptor::from_pem_files(cert_file, key_file).map_err(wrap_io)?;
        let listener = self.server.bind().await.map_err(wrap_io)?;
        self.supervise(self.server.serve(listener, acceptor, true))
            .await
    }

    /**
    Bind the configured address and serve https with certificates
    obtained automatically through ACME (Let's Encrypt).

    `domains` is a whitespace-separated allow list; `email` is the
    registration contact (use a non-public one); `cache_dir`
    optionally persists obtained certificates across restarts.

    An auxiliary server is started on port 80 whose sole job is
    redirecting plain http to https; a shutdown hook winds it down
    with a five second grace period. Certificate validation itself
    happens in-band on the tls listener.
    */
    pub async fn listen_and_serve_auto_tls(
        &self,
        domains: &str,
        email: &str,
        cache_dir: &str,
    ) -> Result<(), Arc<Error>> {
        self.manually_tls.store(true, Ordering::SeqCst);

        let domains: Vec<String> = domains.split_whitespace().map(String::from).collect();

        let mut acme = AcmeConfig::new(domains).directory_lets_encrypt(true);
        if !email.is_empty() {
            acme = acme.contact([format!("mailto:{email}")]);
        }
        let acme = acme.cache_option(if cache_dir.is_empty() {
            None
        } else {
            Some(DirCache::new(String::from(cache_dir)))
        });

        let mut state = acme.state();
        let resolver = state.resolver();
        let acceptor = state.acceptor();

        smol::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => log::debug!("acme event: {:?}", event),
                    Some(Err(error)) => log::error!("acme error: {:?}", error),
                    None => break,
                }
            }
        })
        .detach();

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let tls_config = Arc::new(tls_config);

        self.spawn_auxiliary_redirect_server();

        let listener = self.server.bind().await.map_err(wrap_io)?;

        let serve = {
            let service = self.server.service();
            let stopper = self.server.stopper();
            let config = self.server.http_config();

            async move {
                log::info!("listening on {:?} (auto tls)", listener.local_addr());
                let mut incoming = stopper.stop_stream(listener.incoming());

                while let Some(Ok(stream)) = incoming.next().await {
                    let _ = stream.set_nodelay(true);
                    let peer = stream.peer_addr().ok();
                    let acceptor = acceptor.clone();
                    let tls_config = tls_config.clone();
                    let service = service.clone();
                    let stopper = stopper.clone();
                    let counter = self.server.counter().clone();

                    smol::spawn(async move {
                        match acceptor.accept(stream).await {
                            // a TLS-ALPN-01 validation connection,
                            // handled entirely by the acme machinery
                            Ok(None) => log::debug!("answered a tls-alpn-01 challenge"),
                            Ok(Some(handshake)) => {
                                match handshake.into_stream(tls_config).await {
                                    Ok(tls) => {
                                        serve_transport(
                                            tls, service, stopper, config, counter, peer, true,
                                        )
                                        .await
                                    }
                                    Err(error) => log::error!("tls handshake: {:?}", error),
                                }
                            }
                            Err(error) => log::error!("acme accept: {:?}", error),
                        }
                    })
                    .detach();
                }

                Err(server_closed())
            }
        };

        self.supervise(serve).await
    }

    /**
    Start the plain-http companion of the auto-tls listener: a `:80`
    server that redirects everything to its https counterpart, with
    conservative read/write timeouts. Registers the shutdown hook that
    winds it down with [`AUX_SHUTDOWN_GRACE`].
    */
    fn spawn_auxiliary_redirect_server(&self) {
        let aux = Arc::new(
            Server::new(":http", Arc::new(RedirectToHttps)).with_http_config(
                HttpConfig::new()
                    .with_read_timeout(Duration::from_secs(30))
                    .with_write_timeout(Duration::from_secs(60)),
            ),
        );

        let aux_stopper = aux.stopper();
        self.register_on_shutdown(move || {
            let stopper = aux_stopper.clone();
            smol::spawn(async move {
                stopper.stop();
                // some time to close itself
                Timer::after(AUX_SHUTDOWN_GRACE).await;
            })
            .detach();
        });

        smol::spawn(async move {
            match aux.bind().await {
                Ok(listener) => {
                    if let Err(error) = aux.serve(listener, (), false).await {
                        log::debug!("auxiliary redirect server: {:?}", error);
                    }
                }
                Err(error) => log::error!("could not bind the auxiliary redirect server: {error}"),
            }
        })
        .detach();
    }

    //  +------------------------------------------------------------+
    //  | Shutdown                                                   |
    //  +------------------------------------------------------------+

    /**
    Gracefully shut the server down: stop accepting, notify
    on-shutdown hooks (each on its own task), and wait for in-flight
    connections to drain, up to `timeout` when one is provided.
    */
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        self.closed_manually.fetch_add(1, Ordering::SeqCst);
        self.notify_shutdown();
        self.server.stopper().stop();

        let drained = self.server.counter();
        match timeout {
            None => drained.await,
            Some(timeout) => {
                let deadline = async {
                    Timer::after(timeout).await;
                };
                futures_lite::future::or(async { drained.await }, deadline).await;
            }
        }
    }
}

fn wrap_io(error: io::Error) -> Arc<Error> {
    Arc::new(Error::Io(error))
}

/// The service behind the auto-tls auxiliary server: permanent
/// redirect of any request to its https location.
#[derive(Clone, Copy, Debug)]
struct RedirectToHttps;

#[async_trait::async_trait]
impl HttpService for RedirectToHttps {
    async fn call(
        &self,
        transport: trellis_http::BoxedTransport,
        request: trellis_http::Request,
    ) -> Option<trellis_http::BoxedTransport> {
        use futures_lite::AsyncWriteExt;

        let location = format!("https://{}{}", request.host(), request.raw_path());
        let head = format!(
            "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );

        let mut transport = transport;
        match transport.write_all(head.as_bytes()).await {
            Ok(()) => Some(transport),
            Err(_) => None,
        }
    }
}
