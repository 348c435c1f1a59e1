use crate::Acceptor;
use async_trait::async_trait;
use futures_rustls::{rustls::ServerConfig, server::TlsStream, TlsAcceptor};
use std::{
    fmt::{Debug, Formatter},
    fs::File,
    io::{BufReader, Error, ErrorKind, Result},
    path::Path,
    sync::Arc,
};
use trellis_http::Transport;

/**
A tls [`Acceptor`] backed by rustls, for the manually-configured
certificate variant of [`Supervisor`](crate::Supervisor) serving.
*/
#[derive(Clone)]
pub struct RustlsAcceptor(TlsAcceptor);

impl Debug for RustlsAcceptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RustlsAcceptor").field(&"..").finish()
    }
}

impl RustlsAcceptor {
    /**
    Build an acceptor from pem-encoded certificate chain and private
    key files. The ALPN advertisement is `http/1.1`, which is what the
    server above speaks.
    */
    pub fn from_pem_files(
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
            .collect::<Result<Vec<_>>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "no private key found"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|error| Error::new(ErrorKind::InvalidData, error))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config.into())
    }
}

impl From<ServerConfig> for RustlsAcceptor {
    fn from(config: ServerConfig) -> Self {
        Self(TlsAcceptor::from(Arc::new(config)))
    }
}

impl From<TlsAcceptor> for RustlsAcceptor {
    fn from(acceptor: TlsAcceptor) -> Self {
        Self(acceptor)
    }
}

#[async_trait]
impl<Input> Acceptor<Input> for RustlsAcceptor
where
    Input: Transport,
{
    type Output = TlsStream<Input>;

    async fn accept(&self, input: Input) -> Result<Self::Output> {
        self.0.accept(input).await
    }
}
