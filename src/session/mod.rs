mod connector;
mod message_counts;
mod passive;
mod retry;
mod worker;

use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::bmp::FrameError;
pub use connector::{Connector, TcpConnector};
use message_counts::MessageCounts;
pub use passive::PassiveManager;
pub use retry::RetryState;
pub use worker::Worker;

/// Worker -> PassiveManager: the passive connection is gone, dial again
#[derive(Debug)]
pub struct RetryRequest {
    /// Passive connection this request belongs to
    pub id: u64,
    pub reason: String,
}

/// PassiveManager -> Worker: close the connection now
#[derive(Debug)]
pub struct Teardown;

pub type TeardownTx = oneshot::Sender<Teardown>;
pub type TeardownRx = oneshot::Receiver<Teardown>;

/// A passive connection's handle for reporting its own failure
#[derive(Debug)]
pub struct RetryNotifier {
    id: u64,
    tx: mpsc::Sender<RetryRequest>,
}

impl RetryNotifier {
    pub fn new(id: u64, tx: mpsc::Sender<RetryRequest>) -> Self {
        Self { id, tx }
    }

    /// Ask for a new connection (once, consuming the notifier)
    pub async fn notify(self, reason: String) {
        let request = RetryRequest {
            id: self.id,
            reason,
        };
        if self.tx.send(request).await.is_err() {
            debug!("Passive manager gone, dropping retry request");
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Listener failed to accept a client. [reason]
    Accept(String),
    /// Passive router unreachable. [address, reason]
    Dial(String, String),
    /// Destination collector unreachable. [address, reason]
    InterceptDial(SocketAddr, String),
    /// Stream closed or failed mid-message. [reason]
    ShortRead(String),
    /// Mirroring to the destination failed. [reason]
    Write(String),
    /// Connection closed on request of the passive manager
    TornDown,
    /// Pipeline stopped taking messages
    PipelineClosed,
}

impl SessionError {
    /// Should a passive connection ending with this error be re-dialed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::InterceptDial(..))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Accept(r) => write!(f, "Accept failed [{}]", r)?,
            Dial(a, r) => write!(f, "Failed to connect to {} [{}]", a, r)?,
            InterceptDial(a, r) => write!(f, "Failed to connect to destination {} [{}]", a, r)?,
            ShortRead(r) => write!(f, "Read failed [{}]", r)?,
            Write(r) => write!(f, "Write to destination failed [{}]", r)?,
            TornDown => write!(f, "Connection torn down")?,
            PipelineClosed => write!(f, "Pipeline closed")?,
        }
        Ok(())
    }
}

impl From<FrameError> for SessionError {
    fn from(error: FrameError) -> Self {
        SessionError::ShortRead(error.to_string())
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::ShortRead(error.to_string())
    }
}

impl error::Error for SessionError {}
