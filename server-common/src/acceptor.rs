use async_trait::async_trait;
use std::io::Result;
use trellis_http::Transport;

/**
The seam between an accepted tcp stream and the http layer, normally a
tls handshake. The identity acceptor `()` serves plaintext.
*/
#[async_trait]
pub trait Acceptor<Input: Transport>: Clone + Send + Sync + 'static {
    /// the negotiated stream type
    type Output: Transport;

    /// Perform whatever handshake this acceptor represents.
    async fn accept(&self, input: Input) -> Result<Self::Output>;
}

#[async_trait]
impl<Input: Transport> Acceptor<Input> for () {
    type Output = Input;

    async fn accept(&self, input: Input) -> Result<Self::Output> {
        Ok(input)
    }
}
