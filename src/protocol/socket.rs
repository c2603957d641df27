//! # Stream Handles
//!
//! The consumer-facing boundary of the multiplexer: one logical
//! bidirectional stream within a connection.
//!
//! A [`StreamHandle`] is a weak view into the dispatcher's routing table — a
//! pair of channels plus the stream's local id. Reads apply backpressure:
//! each consumed chunk sends a credit message back to the dispatcher, which
//! only then acknowledges the peer's write. Dropping a handle without
//! closing it is detected and the dispatcher emits the teardown packet, so
//! abandoned handles never leak table entries.
//!
//! Layered sub-protocols (shell multiplexing, file sync) consume exactly
//! this boundary: open-by-service-string, inbound chunks, outbound sink,
//! close, and a closed/failed notification.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{constants, BridgeError, DisconnectReason, Result};
use crate::protocol::dispatcher::Control;

/// Inbound notification on a stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// A chunk of stream payload, in arrival order.
    Data(Bytes),
    /// Orderly teardown; no further data will arrive.
    Closed,
    /// The shared connection failed; every stream receives this.
    Failed(DisconnectReason),
}

/// One logical stream within a connection.
pub struct StreamHandle {
    local_id: u32,
    max_payload: usize,
    events: mpsc::Receiver<StreamEvent>,
    control: mpsc::UnboundedSender<Control>,
    closed: bool,
}

impl StreamHandle {
    pub(crate) fn new(
        local_id: u32,
        max_payload: usize,
        events: mpsc::Receiver<StreamEvent>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            local_id,
            max_payload,
            events,
            control,
            closed: false,
        }
    }

    /// The id this side chose for the stream.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Receive the next inbound chunk.
    ///
    /// Returns `Ok(None)` once the stream has closed cleanly. Consuming a
    /// chunk credits flow control back to the peer, so a reader that stops
    /// calling this stalls the sender rather than buffering unboundedly.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        match self.events.recv().await {
            Some(StreamEvent::Data(chunk)) => {
                let _ = self.control.send(Control::Consumed { id: self.local_id });
                Ok(Some(chunk))
            }
            Some(StreamEvent::Closed) | None => {
                self.closed = true;
                Ok(None)
            }
            Some(StreamEvent::Failed(reason)) => {
                self.closed = true;
                Err(reason.into())
            }
        }
    }

    /// Send bytes on the stream.
    ///
    /// Data larger than the negotiated maximum payload is split into
    /// maximum-sized chunks. The future suspends while flow control leaves
    /// no room for the next chunk; dropping it cancels the not-yet-sent
    /// remainder without corrupting the stream (chunk boundaries are packet
    /// boundaries).
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        if self.closed {
            return Err(BridgeError::Stream(constants::ERR_STREAM_CLOSED));
        }
        let mut rest = data.into();
        while !rest.is_empty() {
            let take = rest.len().min(self.max_payload);
            let chunk = rest.split_to(take);
            let (done_tx, done_rx) = oneshot::channel();
            self.control
                .send(Control::Write {
                    id: self.local_id,
                    chunk,
                    done: done_tx,
                })
                .map_err(|_| BridgeError::Stream(constants::ERR_DISPATCHER_GONE))?;
            done_rx
                .await
                .map_err(|_| BridgeError::ConnectionClosed)??;
        }
        Ok(())
    }

    /// Close the stream. Sends the teardown packet and frees the local id
    /// immediately; the peer is not waited on.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.control.send(Control::Close { id: self.local_id });
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // Abandonment without close still tears the stream down.
        if !self.closed {
            let _ = self.control.send(Control::Close { id: self.local_id });
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("local_id", &self.local_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
