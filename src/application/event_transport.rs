// Transport trait for the live event channel
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

/// Every transport failure is treated as transient and retried with backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("connection to {0} timed out")]
    Timeout(String),
}

/// One open connection, exposed as a pair of text-frame queues.
///
/// Dropping `outbound` closes the connection. `inbound` yields `None` once the
/// peer has closed or the connection failed.
#[derive(Debug)]
pub struct TransportChannel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, endpoint: &Url) -> Result<TransportChannel, TransportError>;
}
