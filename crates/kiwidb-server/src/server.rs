//! RESP listener.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;

use crate::error::Result;
use crate::handler::{error_frame, parse_command, RequestHandler};

/// Accepts client connections and serves each on its own task.
pub struct RespServer {
    listener: TcpListener,
    handler: Arc<RequestHandler>,
}

impl RespServer {
    /// Bind the client listener.
    pub async fn bind(addr: &str, handler: Arc<RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    ///
    /// Returns once every client connection has closed.
    pub async fn run_until_shutdown(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "accepting client connections");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received, stopping listener");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "client connected");
                    let handler = self.handler.clone();
                    let shutdown = shutdown.resubscribe();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(socket, handler, shutdown).await {
                            tracing::debug!(%peer, error = %e, "client connection closed");
                        }
                    });
                }
            }
        }

        drop(self.listener);
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(
    socket: TcpStream,
    handler: Arc<RequestHandler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, Resp2::default());

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            frame = framed.next() => match frame {
                Some(frame) => frame?,
                None => return Ok(()),
            },
        };

        let reply = match parse_command(frame) {
            Ok(Some(command)) => handler.handle(command).await,
            Ok(None) => continue,
            Err(e) => error_frame(e),
        };
        framed.send(reply).await?;
    }
}
