use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use txrelay_core::{serialize::to_hex, RelayProtocolError, TxHash};

use crate::protocol::Response;

/// Errors talking to the admission socket
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting, writing or reading failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The daemon did not answer in time
    #[error("No response within {0:?}")]
    Timeout(Duration),
    /// The response could not be parsed
    #[error(transparent)]
    Protocol(#[from] RelayProtocolError),
    /// The daemon refused the transaction
    #[error("Transaction rejected with code {0}")]
    Rejected(u32),
}

/// Client side of the admission socket. One connection per transaction.
#[derive(Debug, Clone)]
pub struct SocketClient {
    path: PathBuf,
    timeout: Duration,
}

impl SocketClient {
    /// A client for the daemon listening on `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Give up waiting for a response after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Submit one signed transaction and return the hash it was queued under.
    pub async fn submit(&self, raw: &[u8]) -> Result<TxHash, ClientError> {
        let mut stream = UnixStream::connect(&self.path).await?;
        let mut request = to_hex(raw).into_bytes();
        request.push(b'\n');
        stream.write_all(&request).await?;
        stream.shutdown().await?;

        let mut response = vec![];
        timeout(self.timeout, stream.read_to_end(&mut response))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        debug!(bytes = response.len(), "Received response");

        match Response::decode(&response)? {
            Response::Accepted(hash) => Ok(hash),
            Response::Rejected(code) => Err(ClientError::Rejected(code)),
        }
    }
}
