//! ZeroMQ REQ transport.

use super::{CommandEnvelope, DriverEndpoint, DriverTransport};
use crate::{AgentError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Opens a fresh REQ socket for every request.
///
/// A REQ socket that timed out is stuck waiting for its reply, so sockets
/// are never reused across requests.
#[derive(Debug, Clone, Default)]
pub struct ZmqTransport;

impl ZmqTransport {
    pub fn new() -> Self {
        Self
    }

    async fn round_trip(endpoint: &DriverEndpoint, payload: String) -> Result<Vec<u8>> {
        let address = endpoint.zmq_address();
        let mut socket = ReqSocket::new();
        socket
            .connect(&address)
            .await
            .map_err(|e| AgentError::DialFailed {
                address: address.clone(),
                message: e.to_string(),
            })?;

        socket
            .send(ZmqMessage::from(payload))
            .await
            .map_err(|e| AgentError::Rpc {
                message: format!("send to {} failed: {}", address, e),
            })?;

        let reply = socket.recv().await.map_err(|e| AgentError::Rpc {
            message: format!("receive from {} failed: {}", address, e),
        })?;

        Ok(reply
            .into_vec()
            .into_iter()
            .flat_map(|frame| frame.to_vec())
            .collect())
    }
}

#[async_trait]
impl DriverTransport for ZmqTransport {
    async fn request(
        &self,
        endpoint: &DriverEndpoint,
        envelope: &CommandEnvelope,
        timeout: Duration,
    ) -> Result<Value> {
        let payload = serde_json::to_string(envelope)?;
        debug!("{} -> {}", envelope.cmd, endpoint);

        let reply = tokio::time::timeout(timeout, Self::round_trip(endpoint, payload))
            .await
            .map_err(|_| AgentError::Timeout(timeout))??;

        serde_json::from_slice(&reply).map_err(|e| AgentError::Rpc {
            message: format!("invalid reply from {}: {}", endpoint, e),
        })
    }
}
