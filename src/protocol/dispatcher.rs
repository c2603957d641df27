//! # Stream Dispatcher
//!
//! The actor that owns the connection once the handshake completes.
//!
//! One task holds both halves of the framed connection and the routing table
//! `local_id -> entry`; nothing else reads or writes the transport. Consumers
//! talk to it exclusively through message passing: [`DispatcherHandle`] to
//! open streams, [`StreamHandle`] channels for data.
//!
//! ## Routing
//! Every packet carries the sender's stream id in `arg0` and what the sender
//! believes is the receiver's id in `arg1`. Routing therefore always keys
//! off `arg1` — the field holding *our* id — never `arg0`. Packets for ids
//! not in the table are ignored: the peer may legitimately send a trailing
//! acknowledgment racing with a local close.
//!
//! ## Flow control
//! Without the delayed-ack feature each stream has a one-packet window: a
//! second outbound chunk queues until the matching acknowledgment returns.
//! With delayed-ack the acknowledgments carry byte credits and multiple
//! chunks ride the window. Inbound, the crediting acknowledgment is deferred
//! until the consumer has absorbed the chunk, so a slow reader stalls the
//! peer instead of growing a buffer without bound.
//!
//! ## Failure
//! Errors intrinsic to the shared connection (framing, transport loss,
//! protocol violations) terminate the loop, fail every outstanding and
//! future operation, and leave the dispatcher terminally closed. It is not
//! restartable; callers construct a new connection and dispatcher.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::DELAYED_ACK_WINDOW;
use crate::core::codec::PacketCodec;
use crate::core::packet::{Command, Packet};
use crate::error::{constants, BridgeError, DisconnectReason, Result};
use crate::protocol::handshake::SessionInfo;
use crate::protocol::socket::{StreamEvent, StreamHandle};
use crate::transport::Connection;

/// Capacity of each stream's consumer-facing event channel. Chunks beyond
/// this sit in the entry's backlog with their acknowledgment withheld.
const INBOUND_BUFFER: usize = 8;

/// How often pending opens are checked for callers that dropped the open
/// future before the peer answered.
const CANCEL_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

type PacketSink<T> = SplitSink<Framed<T, PacketCodec>, Packet>;
type PacketStream<T> = SplitStream<Framed<T, PacketCodec>>;

/// Control messages from handles to the dispatcher task.
#[derive(Debug)]
pub(crate) enum Control {
    Open {
        service: String,
        reply: oneshot::Sender<Result<StreamHandle>>,
    },
    Write {
        id: u32,
        chunk: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    /// The consumer drained one inbound chunk; release withheld credit.
    Consumed { id: u32 },
    Close { id: u32 },
    Shutdown,
}

/// Cloneable handle to a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    control: mpsc::UnboundedSender<Control>,
    session: Arc<SessionInfo>,
}

impl DispatcherHandle {
    /// Open a logical stream for a service request string such as
    /// `"shell:ls"` or `"sync:"`.
    ///
    /// Resolves once the peer accepts or refuses the stream. Dropping the
    /// returned future cancels the open; the allocated id is still torn down
    /// with a close packet so neither side leaks it.
    pub async fn open(&self, service: impl Into<String>) -> Result<StreamHandle> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(Control::Open {
                service: service.into(),
                reply,
            })
            .map_err(|_| BridgeError::Stream(constants::ERR_DISPATCHER_GONE))?;
        response.await.map_err(|_| BridgeError::ConnectionClosed)?
    }

    /// Parameters pinned at handshake completion.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Tear down the connection. Every open stream fails with
    /// `ConnectionClosed`.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Whether the dispatcher task has terminated.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

/// Take ownership of an established connection and run the multiplexer.
pub fn start<T>(conn: Connection<T>, session: SessionInfo) -> DispatcherHandle
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let session = Arc::new(session);
    let (sink, stream) = conn.into_framed().split();

    let actor = Actor {
        sink,
        table: HashMap::new(),
        next_id: 1,
        control_tx: control_tx.clone(),
        max_payload: session.max_payload,
        delayed_ack: session.features.delayed_ack(),
        validate_checksum: session.validate_checksum(),
    };
    tokio::spawn(run(actor, stream, control_rx));

    DispatcherHandle {
        control: control_tx,
        session,
    }
}

enum EntryState {
    /// Open sent, waiting for the peer's verdict.
    Opening {
        reply: oneshot::Sender<Result<StreamHandle>>,
        events_rx: mpsc::Receiver<StreamEvent>,
    },
    Open,
    /// Peer closed, but backlog chunks the consumer has not absorbed yet
    /// remain. The entry lives until the drain completes so nothing the
    /// peer sent before closing is lost.
    Closing,
}

/// One routing-table slot.
struct Entry {
    state: EntryState,
    remote_id: u32,
    service: String,
    events: mpsc::Sender<StreamEvent>,
    /// Inbound chunks the consumer channel could not yet absorb. Their
    /// acknowledgments are withheld until drained.
    backlog: VecDeque<Bytes>,
    /// Outbound chunks waiting for flow-control room.
    pending_writes: VecDeque<(Bytes, oneshot::Sender<Result<()>>)>,
    /// One-packet window: a write is on the wire without its acknowledgment.
    unacked: bool,
    /// Delayed-ack window: remaining byte credit.
    credit: u64,
}

struct Actor<T> {
    sink: PacketSink<T>,
    table: HashMap<u32, Entry>,
    next_id: u32,
    control_tx: mpsc::UnboundedSender<Control>,
    max_payload: usize,
    delayed_ack: bool,
    validate_checksum: bool,
}

/// Loop outcome; `Err` carries the terminal reason.
type Step = std::result::Result<(), DisconnectReason>;

async fn run<T>(
    mut actor: Actor<T>,
    mut stream: PacketStream<T>,
    mut control: mpsc::UnboundedReceiver<Control>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut sweep = tokio::time::interval(CANCEL_SWEEP_INTERVAL);
    let reason = loop {
        tokio::select! {
            packet = stream.next() => match packet {
                Some(Ok(packet)) => {
                    if let Err(reason) = actor.handle_packet(packet).await {
                        break reason;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "read loop terminated");
                    break match e {
                        BridgeError::Framing(msg) => DisconnectReason::Framing(msg),
                        _ => DisconnectReason::ConnectionClosed,
                    };
                }
                None => break DisconnectReason::ConnectionClosed,
            },
            ctrl = control.recv() => match ctrl {
                Some(Control::Shutdown) | None => {
                    actor.announce_shutdown().await;
                    break DisconnectReason::ConnectionClosed;
                }
                Some(ctrl) => {
                    if let Err(reason) = actor.handle_control(ctrl).await {
                        break reason;
                    }
                }
            },
            _ = sweep.tick() => {
                if let Err(reason) = actor.reap_cancelled_opens().await {
                    break reason;
                }
            }
        }
    };
    actor.fail_all(reason);
}

impl<T> Actor<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn handle_packet(&mut self, packet: Packet) -> Step {
        // Legacy-protocol policy: checksum mismatches are framing failures.
        if self.validate_checksum && !packet.checksum_matches() {
            warn!("{}", constants::ERR_BAD_CHECKSUM);
            return Err(DisconnectReason::Framing(constants::ERR_BAD_CHECKSUM));
        }

        match packet.command {
            Command::Connect | Command::Auth => {
                // Handshake traffic after the session is established.
                warn!(command = packet.command.mnemonic(), "protocol violation in steady state");
                Err(DisconnectReason::ProtocolViolation)
            }
            Command::Open => {
                // Client role: we never accept peer-initiated streams.
                warn!(arg0 = packet.arg0, "ignoring peer open request");
                Ok(())
            }
            Command::Okay => self.on_okay(packet).await,
            Command::Write => self.on_write(packet).await,
            Command::Close => self.on_close(packet).await,
        }
    }

    async fn on_okay(&mut self, packet: Packet) -> Step {
        let id = packet.arg1;
        let Some(entry) = self.table.get_mut(&id) else {
            debug!(id, "okay for unknown stream ignored");
            return Ok(());
        };

        match std::mem::replace(&mut entry.state, EntryState::Open) {
            EntryState::Opening { reply, events_rx } => {
                entry.remote_id = packet.arg0;
                if self.delayed_ack {
                    // The acknowledgment answering an open advertises the
                    // initial window; peers that omit it assume the
                    // protocol's standard initial window.
                    entry.credit = credit_in(&packet.payload)
                        .unwrap_or(u64::from(DELAYED_ACK_WINDOW));
                }
                let remote_id = entry.remote_id;
                let handle = StreamHandle::new(
                    id,
                    self.max_payload,
                    events_rx,
                    self.control_tx.clone(),
                );
                if reply.send(Ok(handle)).is_err() {
                    // Caller cancelled the open; free the id and tell the
                    // peer so neither side leaks it.
                    debug!(id, "open cancelled by caller, closing stream");
                    self.table.remove(&id);
                    return self
                        .send(Packet::bare(Command::Close, id, remote_id))
                        .await;
                }
                debug!(id, remote_id, "stream open");
                Ok(())
            }
            EntryState::Open => {
                if self.delayed_ack {
                    entry.credit =
                        entry.credit.saturating_add(credit_in(&packet.payload).unwrap_or(0));
                } else {
                    entry.unacked = false;
                }
                self.flush_writes(id).await
            }
            EntryState::Closing => {
                entry.state = EntryState::Closing;
                debug!(id, "okay for draining stream ignored");
                Ok(())
            }
        }
    }

    async fn on_write(&mut self, packet: Packet) -> Step {
        let id = packet.arg1;
        let Some(entry) = self.table.get_mut(&id) else {
            debug!(id, "write for unknown stream ignored");
            return Ok(());
        };
        if !matches!(entry.state, EntryState::Open) {
            warn!(id, "write for non-open stream ignored");
            return Ok(());
        }

        let chunk = packet.payload;
        let len = chunk.len();
        let remote_id = entry.remote_id;

        if entry.backlog.is_empty() {
            match entry.events.try_send(StreamEvent::Data(chunk)) {
                Ok(()) => return self.acknowledge(id, remote_id, len).await,
                Err(TrySendError::Full(StreamEvent::Data(chunk))) => {
                    entry.backlog.push_back(chunk);
                }
                Err(_) => {
                    // Consumer vanished; the handle's close control message
                    // will reap the entry.
                    debug!(id, "dropping inbound chunk for abandoned stream");
                }
            }
        } else {
            entry.backlog.push_back(chunk);
        }
        Ok(())
    }

    async fn on_close(&mut self, packet: Packet) -> Step {
        let id = packet.arg1;
        let Some(mut entry) = self.table.remove(&id) else {
            debug!(id, "close for unknown stream ignored");
            return Ok(());
        };

        match entry.state {
            EntryState::Opening { reply, .. } => {
                debug!(id, service = %entry.service, "stream refused by peer");
                let _ = reply.send(Err(BridgeError::ConnectionRefused(entry.service)));
                Ok(())
            }
            EntryState::Closing => {
                // Duplicate close from the peer while the backlog drains.
                self.table.insert(id, entry);
                Ok(())
            }
            EntryState::Open => {
                debug!(id, "stream closed by peer");
                fail_writes(&mut entry.pending_writes, || {
                    BridgeError::Stream(constants::ERR_STREAM_CLOSED)
                });
                // Hand over what the consumer has room for. Chunks that do
                // not fit keep the entry alive in a draining state; the
                // clean-end signal is withheld until they are delivered.
                while let Some(chunk) = entry.backlog.pop_front() {
                    if let Err(TrySendError::Full(StreamEvent::Data(chunk))) =
                        entry.events.try_send(StreamEvent::Data(chunk))
                    {
                        entry.backlog.push_front(chunk);
                        break;
                    }
                }
                let remote_id = entry.remote_id;
                if entry.backlog.is_empty() {
                    let _ = entry.events.try_send(StreamEvent::Closed);
                } else {
                    entry.state = EntryState::Closing;
                    self.table.insert(id, entry);
                }
                self.send(Packet::bare(Command::Close, id, remote_id)).await
            }
        }
    }

    async fn handle_control(&mut self, ctrl: Control) -> Step {
        match ctrl {
            Control::Open { service, reply } => self.open_stream(service, reply).await,
            Control::Write { id, chunk, done } => {
                match self.table.get_mut(&id) {
                    Some(entry) if !matches!(entry.state, EntryState::Closing) => {
                        entry.pending_writes.push_back((chunk, done));
                    }
                    _ => {
                        let _ =
                            done.send(Err(BridgeError::Stream(constants::ERR_STREAM_CLOSED)));
                        return Ok(());
                    }
                }
                self.flush_writes(id).await
            }
            Control::Consumed { id } => self.release_backlog(id).await,
            Control::Close { id } => {
                let Some(mut entry) = self.table.remove(&id) else {
                    return Ok(());
                };
                debug!(id, "stream closed locally");
                fail_writes(&mut entry.pending_writes, || {
                    BridgeError::Stream(constants::ERR_STREAM_CLOSED)
                });
                if matches!(entry.state, EntryState::Closing) {
                    // Teardown already went on the wire when the peer closed.
                    return Ok(());
                }
                // Local id is eligible for reuse immediately; the peer is
                // not waited on for a reciprocal close.
                self.send(Packet::bare(Command::Close, id, entry.remote_id))
                    .await
            }
            Control::Shutdown => Ok(()), // handled by the run loop
        }
    }

    async fn open_stream(
        &mut self,
        service: String,
        reply: oneshot::Sender<Result<StreamHandle>>,
    ) -> Step {
        let id = self.allocate_id();
        let (events, events_rx) = mpsc::channel(INBOUND_BUFFER);

        let mut request = service.clone().into_bytes();
        request.push(0);

        self.table.insert(
            id,
            Entry {
                state: EntryState::Opening { reply, events_rx },
                remote_id: 0,
                service: service.clone(),
                events,
                backlog: VecDeque::new(),
                pending_writes: VecDeque::new(),
                unacked: false,
                credit: 0,
            },
        );
        debug!(id, service = %service, "opening stream");
        self.send(Packet::new(Command::Open, id, 0, request)).await
    }

    /// Send queued outbound chunks while flow control allows.
    async fn flush_writes(&mut self, id: u32) -> Step {
        loop {
            let Some(entry) = self.table.get_mut(&id) else {
                return Ok(());
            };
            if !matches!(entry.state, EntryState::Open) {
                return Ok(());
            }
            let room = match entry.pending_writes.front() {
                None => return Ok(()),
                Some((chunk, _)) if self.delayed_ack => {
                    entry.credit >= chunk.len() as u64
                }
                Some(_) => !entry.unacked,
            };
            if !room {
                return Ok(());
            }

            // Window checked above; the queue is non-empty.
            let Some((chunk, done)) = entry.pending_writes.pop_front() else {
                return Ok(());
            };
            if self.delayed_ack {
                entry.credit -= chunk.len() as u64;
            } else {
                entry.unacked = true;
            }
            let remote_id = entry.remote_id;
            self.send(Packet::new(Command::Write, id, remote_id, chunk))
                .await?;
            let _ = done.send(Ok(()));
        }
    }

    /// The consumer drained a chunk: deliver backlog and release withheld
    /// acknowledgments. For a stream the peer already closed, delivering the
    /// final backlog chunk completes the drain and reaps the entry.
    async fn release_backlog(&mut self, id: u32) -> Step {
        let Some(entry) = self.table.get_mut(&id) else {
            return Ok(());
        };
        let Some(chunk) = entry.backlog.pop_front() else {
            return Ok(());
        };
        let len = chunk.len();
        let remote_id = entry.remote_id;
        let draining = matches!(entry.state, EntryState::Closing);
        match entry.events.try_send(StreamEvent::Data(chunk)) {
            Ok(()) => {
                if draining {
                    // No acknowledgment: the peer is gone from this stream.
                    if entry.backlog.is_empty() {
                        let _ = entry.events.try_send(StreamEvent::Closed);
                        self.table.remove(&id);
                    }
                    Ok(())
                } else {
                    self.acknowledge(id, remote_id, len).await
                }
            }
            Err(TrySendError::Full(StreamEvent::Data(chunk))) => {
                entry.backlog.push_front(chunk);
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Credit one absorbed chunk back to the sender.
    async fn acknowledge(&mut self, id: u32, remote_id: u32, len: usize) -> Step {
        let packet = if self.delayed_ack {
            Packet::new(
                Command::Okay,
                id,
                remote_id,
                (len as u32).to_le_bytes().to_vec(),
            )
        } else {
            Packet::bare(Command::Okay, id, remote_id)
        };
        self.send(packet).await
    }

    /// Tear down pending opens whose caller dropped the open future. Without
    /// this the entry (and its id) would leak until the peer happened to
    /// answer.
    async fn reap_cancelled_opens(&mut self) -> Step {
        let cancelled: Vec<u32> = self
            .table
            .iter()
            .filter_map(|(id, entry)| match &entry.state {
                EntryState::Opening { reply, .. } if reply.is_closed() => Some(*id),
                _ => None,
            })
            .collect();
        for id in cancelled {
            debug!(id, "open abandoned by caller, closing stream");
            self.table.remove(&id);
            // The peer never assigned its id; zero in the remote-id field.
            self.send(Packet::bare(Command::Close, id, 0)).await?;
        }
        Ok(())
    }

    /// Courtesy teardown packets before an orderly shutdown.
    async fn announce_shutdown(&mut self) {
        info!(streams = self.table.len(), "dispatcher shutting down");
        let ids: Vec<(u32, u32)> = self
            .table
            .iter()
            .map(|(id, entry)| (*id, entry.remote_id))
            .collect();
        for (id, remote_id) in ids {
            if self
                .send(Packet::bare(Command::Close, id, remote_id))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Terminal fan-out: every entry and every queued operation fails with
    /// the connection's reason.
    fn fail_all(&mut self, reason: DisconnectReason) {
        info!(?reason, streams = self.table.len(), "dispatcher terminated");
        for (_, mut entry) in self.table.drain() {
            fail_writes(&mut entry.pending_writes, || reason.into());
            match entry.state {
                EntryState::Opening { reply, .. } => {
                    let _ = reply.send(Err(reason.into()));
                }
                EntryState::Open | EntryState::Closing => {
                    let _ = entry.events.try_send(StreamEvent::Failed(reason));
                }
            }
        }
    }

    /// Monotonically increasing id, skipping live ids and zero, wrapping
    /// mod 2^32. An id is eligible for reuse as soon as its entry is gone;
    /// stale inbound packets are screened by the table lookup.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if id != 0 && !self.table.contains_key(&id) {
                return id;
            }
        }
    }

    async fn send(&mut self, packet: Packet) -> Step {
        self.sink.send(packet).await.map_err(|e| {
            warn!(error = %e, "transport write failed");
            DisconnectReason::ConnectionClosed
        })
    }
}

/// Delayed-ack byte credit carried in an acknowledgment payload.
fn credit_in(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u64::from(u32::from_le_bytes(bytes)))
}

fn fail_writes<F>(writes: &mut VecDeque<(Bytes, oneshot::Sender<Result<()>>)>, mut err: F)
where
    F: FnMut() -> BridgeError,
{
    for (_, done) in writes.drain(..) {
        let _ = done.send(Err(err()));
    }
}
