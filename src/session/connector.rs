use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::SessionError;

/// Establishes the outbound connection to a passive router
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + Unpin + Send + 'static;

    /// Dial the router, returning the stream and a label for the remote end
    async fn connect(&self) -> Result<(Self::Stream, String), SessionError>;

    fn target(&self) -> &str;
}

/// Plain TCP dial with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: String, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<(TcpStream, String), SessionError> {
        let stream = timeout(self.timeout, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| {
                SessionError::Dial(
                    self.addr.clone(),
                    format!("timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|err| SessionError::Dial(self.addr.clone(), err.to_string()))?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.addr.clone());
        Ok((stream, peer))
    }

    fn target(&self) -> &str {
        &self.addr
    }
}
