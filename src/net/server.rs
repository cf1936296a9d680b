//! Protocol Server
//!
//! TCP listener on the monitor side. Each connection carries a sequence of
//! request-response exchanges; the registered service produces exactly one
//! reply per request.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};

use super::{recv_frame, send_frame};
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Request handler: one request in, exactly one response out
pub type RequestHandler =
    Arc<dyn Fn(String, Message) -> BoxFuture<'static, Message> + Send + Sync>;

/// Protocol server for keeper and ctl connections
pub struct ProtocolServer {
    /// Bind address
    bind_address: String,
    /// Request handler
    handler: RequestHandler,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl ProtocolServer {
    /// Create a new protocol server
    pub fn new(bind_address: String, handler: RequestHandler) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Accept connections until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("monitor protocol ready on {}", self.bind_address);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let (socket, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("could not accept a connection: {}", e);
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                let peer = addr.to_string();
                if let Err(e) = serve_connection(socket, &peer, handler).await {
                    tracing::warn!("session with {} ended abnormally: {}", peer, e);
                }
            });
        }

        tracing::info!("monitor protocol listener closed");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve one connection until the client hangs up
async fn serve_connection(socket: TcpStream, peer: &str, handler: RequestHandler) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request = match recv_frame(&mut reader).await {
            Ok(request) => request,
            // A client closing between requests is the normal end of a session
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        tracing::trace!("{} asks {}", peer, request.type_name());
        let reply = handler(peer.to_string(), request).await;
        send_frame(&mut writer, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MonitorClient;

    #[tokio::test]
    async fn test_request_response_exchange() {
        let handler: RequestHandler = Arc::new(|_peer, msg| {
            Box::pin(async move {
                match msg {
                    Message::Ack => Message::Ack,
                    _ => Message::Error {
                        code: crate::protocol::ErrorCode::Internal,
                        message: "unexpected".into(),
                    },
                }
            })
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = Arc::new(ProtocolServer::new(addr.to_string(), handler));
        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };

        // Give the listener a moment to bind
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = MonitorClient::new(addr.to_string());
        let response = client.call(Message::Ack).await.unwrap();
        assert_eq!(response.type_name(), "Ack");

        server.stop();
        let _ = server_task.await;
    }
}
