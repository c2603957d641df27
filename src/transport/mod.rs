//! # Transport Adapters
//!
//! Packet-level framing over any byte-duplex channel.
//!
//! The core never touches raw sockets directly: a [`Connection`] wraps an
//! `AsyncRead + AsyncWrite` channel in the packet codec and is the single
//! object the handshake and dispatcher drive. TCP and relay sockets connect
//! through [`connect_tcp`]; USB bulk endpoints and in-memory duplex pipes
//! (used by the tests) plug in through [`Connection::new`] with whatever
//! channel the embedder provides.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::config::TransportConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{BridgeError, Result};

/// A packet-framed duplex connection. Exclusively owned by one handshake,
/// then by one dispatcher, for its whole lifetime.
pub struct Connection<T> {
    framed: Framed<T, PacketCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Connection<T> {
    /// Frame an arbitrary byte-duplex channel.
    pub fn new(channel: T) -> Self {
        Self {
            framed: Framed::new(channel, PacketCodec::new()),
        }
    }

    /// Send one packet, flushing to the transport.
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        debug!(command = packet.command.mnemonic(), arg0 = packet.arg0,
               arg1 = packet.arg1, len = packet.payload.len(), "send");
        self.framed.send(packet).await
    }

    /// Receive the next packet. EOF maps to [`BridgeError::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<Packet> {
        match self.framed.next().await {
            Some(Ok(packet)) => {
                debug!(command = packet.command.mnemonic(), arg0 = packet.arg0,
                       arg1 = packet.arg1, len = packet.payload.len(), "recv");
                Ok(packet)
            }
            Some(Err(e)) => Err(e),
            None => Err(BridgeError::ConnectionClosed),
        }
    }

    /// Surrender the framed stream, e.g. to the dispatcher's split
    /// reader/writer halves.
    pub fn into_framed(self) -> Framed<T, PacketCodec> {
        self.framed
    }
}

/// Establish a TCP connection per the transport configuration.
#[instrument(skip(config), fields(address = %config.address))]
pub async fn connect_tcp(config: &TransportConfig) -> Result<Connection<TcpStream>> {
    let stream = timeout(config.connect_timeout, TcpStream::connect(&config.address))
        .await
        .map_err(|_| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;
    stream.set_nodelay(true)?;
    debug!("tcp transport established");
    Ok(Connection::new(stream))
}
