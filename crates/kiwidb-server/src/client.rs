//! Outbound RESP connection to another node's client port.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Prefix of the error a non-leader answers writes and control commands with.
pub const WRONG_LEADER_PREFIX: &str = "ERR wrong leader ";

/// A client connection to a peer, used for control handshakes.
pub struct PeerConnection {
    addr: String,
    framed: Framed<TcpStream, Resp2>,
}

impl PeerConnection {
    /// Connect to `addr`, failing after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
        socket.set_nodelay(true)?;
        Ok(Self {
            addr: addr.to_string(),
            framed: Framed::new(socket, Resp2::default()),
        })
    }

    /// Address this connection was opened to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command and wait for its reply.
    pub async fn command(&mut self, args: &[&[u8]]) -> io::Result<BytesFrame> {
        let request = BytesFrame::Array(
            args.iter()
                .map(|arg| BytesFrame::BulkString(Bytes::copy_from_slice(arg)))
                .collect(),
        );
        self.framed.send(request).await.map_err(to_io)?;

        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(to_io(e)),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection to {} closed", self.addr),
            )),
        }
    }
}

fn to_io(e: redis_protocol::error::RedisProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Text of a reply frame, for status, error and bulk replies.
pub fn frame_text(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::Integer(n) => Some(n.to_string()),
        other => other.as_str().map(str::to_string),
    }
}

/// Client address carried by a wrong-leader error reply.
pub fn wrong_leader_target(frame: &BytesFrame) -> Option<String> {
    let BytesFrame::Error(message) = frame else {
        return None;
    };
    let address = message.strip_prefix(WRONG_LEADER_PREFIX)?.trim();
    (!address.is_empty()).then(|| address.to_string())
}

/// Value of `field` in an INFO reply body.
pub fn info_field<'a>(body: &'a str, field: &str) -> Option<&'a str> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim() == field)
        .map(|(_, value)| value.trim())
}
