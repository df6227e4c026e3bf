//! The place where all parts of the protocol come together: a [`Transport`]
//!  owns a [`Sender`], a [`Receiver`] and the packet driver, demultiplexes
//!  ingress packets, and exposes the message API to the application.
//!
//! Packet routing is by message identity: every packet carries the id of the
//!  message it is about, and that id embeds the *sending* transport's unique
//!  id. A packet whose id bears our transport id concerns a message we are
//!  sending (GRANT, RESEND, DONE, and their relatives go to the Sender); any
//!  other id concerns a message we are receiving (DATA, PING go to the
//!  Receiver).

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::bail;
use tracing::{debug, info, trace};

use crate::buffers::PacketBuf;
use crate::config::HomaConfig;
use crate::driver::PacketDriver;
use crate::message_buffer::MessageBuffer;
use crate::receiver::{DataOutcome, InboundMessage, Receiver};
use crate::sender::{Sender, StatusCell};
pub use crate::sender::OutStatus;
use crate::wire::{flags, MessageId, PacketHeader, PacketKind};

/// transport ids in use by live instances of this process. A collision
///  would make two transports claim each other's messages, so creating a
///  transport with a taken id is refused outright.
static LIVE_TRANSPORT_IDS: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// process-wide source of fresh transport ids
pub fn next_transport_id() -> u64 {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Options for [`OutMessage::send`].
#[derive(Copy, Clone, Default, Debug)]
pub struct SendFlags {
    /// complete the message once its last byte is transmitted instead of
    ///  waiting for the receiver's DONE
    pub no_ack: bool,
    /// hand lifetime management to the transport: the message keeps being
    ///  retried after the handle is dropped and frees itself when terminal
    pub detached: bool,
    /// this message is expected to trigger a response; the local receiver
    ///  holds a grant slot for it
    pub expect_response: bool,
}

impl SendFlags {
    fn wire_bits(self) -> u8 {
        let mut bits = 0;
        if self.no_ack {
            bits |= flags::NO_ACK;
        }
        if self.expect_response {
            bits |= flags::EXPECT_RESPONSE;
        }
        bits
    }
}

#[derive(Default)]
struct TransportStats {
    ingress_packets: AtomicU64,
    malformed_packets: AtomicU64,
    duplicate_packets: AtomicU64,
    stale_packets: AtomicU64,
}

/// Point-in-time copy of the transport's telemetry counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ingress_packets: u64,
    pub malformed_packets: u64,
    pub duplicate_packets: u64,
    pub stale_packets: u64,
}

struct Shared {
    config: Arc<HomaConfig>,
    driver: Arc<dyn PacketDriver>,
    sender: Sender,
    receiver: Receiver,
    transport_id: u64,
    next_sequence: AtomicU64,
    stats: TransportStats,
}

/// A transport endpoint. All methods are callable from any thread, but
///  progress only happens inside [`Transport::poll`], which the embedder
///  must call frequently from a single driving thread.
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn new(driver: Arc<dyn PacketDriver>, transport_id: u64, config: HomaConfig) -> anyhow::Result<Transport> {
        config.validate()?;
        if driver.max_payload() < config.mtu {
            bail!("driver carries at most {} bytes per packet, configured mtu is {}",
                  driver.max_payload(), config.mtu);
        }

        {
            let mut live = LIVE_TRANSPORT_IDS.lock().unwrap();
            if !live.insert(transport_id) {
                bail!("transport id {} is already in use in this process", transport_id);
            }
        }

        info!("transport {} on {:?}", transport_id, driver.local_address());
        let config = Arc::new(config);
        Ok(Transport {
            shared: Arc::new(Shared {
                sender: Sender::new(config.clone(), driver.clone()),
                receiver: Receiver::new(config.clone(), driver.clone()),
                config,
                driver,
                transport_id,
                next_sequence: AtomicU64::new(0),
                stats: TransportStats::default(),
            }),
        })
    }

    pub fn transport_id(&self) -> u64 {
        self.shared.transport_id
    }

    pub fn local_address(&self) -> SocketAddr {
        self.shared.driver.local_address()
    }

    pub fn parse_address(&self, raw: &str) -> anyhow::Result<SocketAddr> {
        self.shared.driver.parse_address(raw)
    }

    pub fn format_address(&self, addr: SocketAddr) -> String {
        self.shared.driver.format_address(addr)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.shared.stats;
        StatsSnapshot {
            ingress_packets: stats.ingress_packets.load(Ordering::Relaxed),
            malformed_packets: stats.malformed_packets.load(Ordering::Relaxed),
            duplicate_packets: stats.duplicate_packets.load(Ordering::Relaxed),
            stale_packets: stats.stale_packets.load(Ordering::Relaxed),
        }
    }

    /// create an empty outbound message
    pub fn alloc(&self) -> OutMessage {
        OutMessage {
            shared: self.shared.clone(),
            state: OutState::Building {
                buffer: MessageBuffer::new_outbound(
                    self.shared.driver.clone(), self.shared.config.chunk_payload()),
            },
        }
    }

    /// pop the next fully received message, if any
    pub fn receive(&self) -> Option<InMessage> {
        self.shared.receiver.receive().map(|message| InMessage {
            shared: self.shared.clone(),
            message,
            released: false,
        })
    }

    /// make incremental progress: drain ingress, issue grants, emit data,
    ///  run timers. Never blocks; returns when the per-tick budgets are
    ///  exhausted or no work is pending.
    pub fn poll(&self) {
        let now = Instant::now();

        let mut batch = Vec::with_capacity(self.shared.config.poll_ingress_budget);
        self.shared.driver.receive_packets(self.shared.config.poll_ingress_budget, &mut batch);
        for (source, packet) in batch {
            self.dispatch(source, packet, now);
        }

        self.shared.receiver.poll_grants(now);
        self.shared.sender.poll(now);

        self.shared.sender.timer_tick(now);
        self.shared.receiver.timer_tick(now);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn dispatch(&self, source: SocketAddr, packet: PacketBuf, now: Instant) {
        let shared = self.shared.as_ref();
        Self::bump(&shared.stats.ingress_packets);

        let header = {
            let mut buf: &[u8] = packet.as_ref();
            match PacketHeader::deser(&mut buf) {
                Ok(header) => header,
                Err(e) => {
                    debug!("unparsable packet from {:?}: {:#} - dropping", source, e);
                    Self::bump(&shared.stats.malformed_packets);
                    shared.driver.release_packet(packet);
                    return;
                }
            }
        };

        let id = header.message_id;
        // our id on the packet = about a message we send; anything else =
        //  about a message we receive
        let ours = id.transport_id == shared.transport_id;
        trace!("ingress {:?} {} from {:?}", header.kind, id, source);

        if let PacketKind::Data { .. } = header.kind {
            if ours {
                debug!("DATA carrying our own transport id from {:?} - dropping", source);
                Self::bump(&shared.stats.malformed_packets);
                shared.driver.release_packet(packet);
                return;
            }
            match shared.receiver.on_data(source, &header, packet, now) {
                DataOutcome::Absorbed | DataOutcome::Completed => {}
                DataOutcome::Duplicate => Self::bump(&shared.stats.duplicate_packets),
                DataOutcome::Stale => Self::bump(&shared.stats.stale_packets),
                DataOutcome::Malformed => Self::bump(&shared.stats.malformed_packets),
            }
            return;
        }

        shared.driver.release_packet(packet);

        match (header.kind, ours) {
            (PacketKind::Grant { grant_offset, priority }, true) => {
                shared.sender.on_grant(id, grant_offset, priority, now);
            }
            (PacketKind::Resend { offset, length, priority }, true) => {
                shared.sender.on_resend(source, id, offset, length, priority, now);
            }
            (PacketKind::Done, true) => shared.sender.on_done(id),
            (PacketKind::Busy, true) => shared.sender.on_busy(id, now),
            (PacketKind::Error { reason }, true) => shared.sender.on_error(id, reason),

            (PacketKind::Ping, false) => shared.receiver.on_ping(source, id, now),
            (PacketKind::Busy, false) => shared.receiver.on_busy(source, id, now),
            (PacketKind::Error { .. }, false) => shared.receiver.on_error(source, id, now),

            (kind, _) => {
                debug!("{:?} with mismatched transport id from {:?} - dropping", kind, source);
                Self::bump(&shared.stats.malformed_packets);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        LIVE_TRANSPORT_IDS.lock().unwrap().remove(&self.shared.transport_id);
    }
}

enum OutState {
    Building { buffer: MessageBuffer },
    Sent { id: MessageId, status: Arc<StatusCell>, detached: bool },
}

/// Handle to an outbound message.
///
/// Build it with [`OutMessage::append`] / [`OutMessage::prepend`], then
///  [`OutMessage::send`] it. Dropping the handle of a non-detached message
///  releases the transport-side state (canceling it first if it has not
///  reached a terminal status).
pub struct OutMessage {
    shared: Arc<Shared>,
    state: OutState,
}

impl OutMessage {
    /// copy bytes to the end of the message. Only valid before `send`.
    pub fn append(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        match &mut self.state {
            OutState::Building { buffer } => buffer.append(bytes),
            OutState::Sent { .. } => bail!("message already sent"),
        }
    }

    /// copy bytes in front of the message, e.g. an RPC header written after
    ///  the payload. Only valid before `send`.
    pub fn prepend(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        match &mut self.state {
            OutState::Building { buffer } => buffer.prepend(bytes),
            OutState::Sent { .. } => bail!("message already sent"),
        }
    }

    /// number of bytes appended so far
    pub fn len(&self) -> usize {
        match &self.state {
            OutState::Building { buffer } => buffer.len(),
            OutState::Sent { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// hand the message to the transport for (at-least-once) delivery
    pub fn send(&mut self, destination: SocketAddr, send_flags: SendFlags) -> anyhow::Result<MessageId> {
        let OutState::Building { buffer } = &mut self.state else {
            bail!("message already sent");
        };
        if buffer.is_empty() {
            bail!("cannot send an empty message");
        }

        let now = Instant::now();
        let shared = self.shared.clone();
        let id = MessageId::new(
            shared.transport_id,
            shared.next_sequence.fetch_add(1, Ordering::Relaxed),
        );
        let status = Arc::new(StatusCell::new(OutStatus::InProgress));

        let buffer = {
            let empty = MessageBuffer::new_outbound(shared.driver.clone(), shared.config.chunk_payload());
            std::mem::replace(buffer, empty)
        };

        if send_flags.expect_response {
            shared.receiver.reserve_response_slot(destination, now);
        }
        shared.sender.queue(
            id, destination, send_flags.wire_bits(), send_flags.detached, buffer, status.clone(), now);

        self.state = OutState::Sent { id, status, detached: send_flags.detached };
        Ok(id)
    }

    /// current delivery status; an atomic load, safe from any thread
    pub fn status(&self) -> OutStatus {
        match &self.state {
            OutState::Building { .. } => OutStatus::InProgress,
            OutState::Sent { status, .. } => status.load(),
        }
    }

    /// the message's id, once sent
    pub fn id(&self) -> Option<MessageId> {
        match &self.state {
            OutState::Building { .. } => None,
            OutState::Sent { id, .. } => Some(*id),
        }
    }

    /// best-effort cancellation; packets already handed to the fabric may
    ///  still reach the peer
    pub fn cancel(&self) {
        if let OutState::Sent { id, .. } = &self.state {
            self.shared.sender.cancel(*id);
        }
    }
}

impl Drop for OutMessage {
    fn drop(&mut self) {
        if let OutState::Sent { id, detached: false, .. } = &self.state {
            self.shared.sender.release(*id);
        }
    }
}

/// Handle to a fully received message.
///
/// Dropping the handle acknowledges the message (emitting DONE to the
///  sender) unless [`InMessage::discard`] was called.
pub struct InMessage {
    shared: Arc<Shared>,
    message: InboundMessage,
    released: bool,
}

impl InMessage {
    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    /// the peer that sent this message
    pub fn address(&self) -> SocketAddr {
        self.message.source()
    }

    pub fn len(&self) -> usize {
        self.message.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// copy out bytes starting at `offset`; returns the number of bytes
    ///  copied, short if the range exceeds the message
    pub fn get(&self, offset: usize, dst: &mut [u8]) -> usize {
        self.message.get(offset, dst)
    }

    /// tell the sender the message has been fully processed
    pub fn acknowledge(&mut self) {
        if !self.released {
            self.shared.receiver.acknowledge(&self.message, Instant::now());
            self.released = true;
        }
    }

    /// release without acknowledging; the sender will run into its timeout
    ///  and decide on its own
    pub fn discard(mut self) {
        if !self.released {
            self.shared.receiver.discard(&self.message, Instant::now());
            self.released = true;
        }
    }
}

impl Drop for InMessage {
    fn drop(&mut self) {
        if !self.released {
            self.shared.receiver.acknowledge(&self.message, Instant::now());
        }
    }
}
