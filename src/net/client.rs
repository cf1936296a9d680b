//! Monitor Client
//!
//! TCP client used by the keeper (and one-shot tools) to call the monitor.
//! Every call is a single request-response exchange; retries are applied by
//! the caller's [`RetryPolicy`](crate::retry::RetryPolicy).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{recv_frame, send_frame};
use crate::error::{Error, Result};
use crate::protocol::{ErrorCode, Message};
use crate::retry::RetryPolicy;

/// Client for the monitor protocol
pub struct MonitorClient {
    /// Monitor address (host:port)
    address: String,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl MonitorClient {
    /// Create a new monitor client
    pub fn new(address: String) -> Self {
        Self {
            address,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Monitor address this client targets
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and wait for the single response
    pub async fn call(&self, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, self.call_inner(&message)).await;

        let response = match result {
            Ok(inner) => inner?,
            Err(_) => return Err(Error::ConnectionTimeout(self.address.clone())),
        };

        // Monitor-side errors come back as a protocol message
        if let Message::Error { code, message } = &response {
            return Err(map_protocol_error(*code, message));
        }

        Ok(response)
    }

    /// Send one request under a retry policy
    pub async fn call_with_retry(&self, policy: &RetryPolicy, message: Message) -> Result<Message> {
        policy.run(|| self.call(message.clone())).await
    }

    async fn call_inner(&self, message: &Message) -> Result<Message> {
        let stream = self.connect().await?;
        let (mut reader, mut writer) = stream.into_split();

        send_frame(&mut writer, message).await?;
        recv_frame(&mut reader).await
    }

    /// Connect to the monitor
    async fn connect(&self) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }
}

/// Turn a monitor protocol error into the matching crate error
fn map_protocol_error(code: ErrorCode, message: &str) -> Error {
    match code {
        ErrorCode::UnknownNode | ErrorCode::StaleGroup => Error::Monitor(message.to_string()),
        ErrorCode::NameCollision => Error::NameCollision(message.to_string()),
        ErrorCode::GroupFull => Error::Monitor(message.to_string()),
        ErrorCode::InvalidSetting => Error::InvalidSetting(message.to_string()),
        ErrorCode::FsmViolation => Error::Protocol(message.to_string()),
        ErrorCode::Internal => Error::Monitor(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_failure() {
        let mut client = MonitorClient::new("127.0.0.1:1".to_string());
        client.connect_timeout = Duration::from_millis(100);
        client.request_timeout = Duration::from_millis(500);

        let result = client.call(Message::Ack).await;
        assert!(result.is_err());
    }
}
