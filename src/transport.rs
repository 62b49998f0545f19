//! Remote transport contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::{record::Payload, types::Verb};

/// Failure reported by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No answer within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Network unreachable.
    #[error("offline")]
    Offline,
    /// The remote resource does not exist.
    #[error("not found")]
    NotFound,
    /// The server refused the request.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// Status code reported by the server.
        status: u16,
        /// Server message.
        message: String,
    },
    /// Any other network failure.
    #[error("network: {0}")]
    Network(String),
}

/// Performs one remote call per operation.
///
/// Authentication and headers belong to the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `payload` to `endpoint` with `verb` and returns the server's answer.
    async fn send(
        &self,
        verb: Verb,
        endpoint: &str,
        payload: Option<&Payload>,
    ) -> Result<Payload, TransportError>;
}

/// Runs a transport call under `timeout`.
pub async fn send_with_timeout(
    transport: &dyn Transport,
    timeout: Duration,
    verb: Verb,
    endpoint: &str,
    payload: Option<&Payload>,
) -> Result<Payload, TransportError> {
    match tokio::time::timeout(timeout, transport.send(verb, endpoint, payload)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}
