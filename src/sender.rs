//! Outbound side of the transport: per-message send state and the pacing
//!  logic that decides which message's next chunk goes on the wire.
//!
//! All outbound messages live in an arena owned by the [`Sender`];
//!  application handles refer to them by [`MessageId`] and observe status
//!  through a shared atomic cell. The ready queue orders sendable messages
//!  by SRPT tier (fewest remaining bytes first), FIFO within a tier.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::HomaConfig;
use crate::driver::PacketDriver;
use crate::message_buffer::MessageBuffer;
use crate::policy;
use crate::wire::{flags, send_control, ErrorReason, MessageId, PacketHeader, PacketKind};

/// Application-visible state of an outbound message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum OutStatus {
    /// bytes remain to be transmitted (or retransmitted)
    InProgress = 0,
    /// every byte has been handed to the driver; awaiting DONE
    Sent = 1,
    Completed = 2,
    Canceled = 3,
    Failed = 4,
}

impl OutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OutStatus::Completed | OutStatus::Canceled | OutStatus::Failed)
    }

    fn from_raw(raw: u8) -> OutStatus {
        match raw {
            0 => OutStatus::InProgress,
            1 => OutStatus::Sent,
            2 => OutStatus::Completed,
            3 => OutStatus::Canceled,
            _ => OutStatus::Failed,
        }
    }
}

/// Shared status word: written under the sender's lock, readable from any
///  thread without taking it.
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: OutStatus) -> StatusCell {
        StatusCell(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> OutStatus {
        OutStatus::from_raw(self.0.load(Ordering::Acquire))
    }

    /// terminal states are sticky; everything else may be overwritten
    fn advance_to(&self, status: OutStatus) {
        if !self.load().is_terminal() {
            self.0.store(status as u8, Ordering::Release);
        }
    }
}

type ReadyKey = (u8, u64, MessageId);

struct OutboundMessage {
    id: MessageId,
    destination: SocketAddr,
    /// NO_ACK / EXPECT_RESPONSE bits, mirrored into every DATA header
    wire_flags: u8,
    buffer: MessageBuffer,
    length: u32,
    /// initial grant per policy; DATA below this offset carries the
    ///  sender-side SRPT priority, everything above the receiver-steered one
    unscheduled: u32,
    granted: u32,
    sent: u32,
    acked: u32,
    /// priority advertised by the receiver for scheduled bytes
    priority: u8,
    status: Arc<StatusCell>,
    detached: bool,
    enqueue_seq: u64,
    ready_key: Option<ReadyKey>,
    pings_in_flight: u32,
    backoff: ExponentialBackoff,
    probe_deadline: Instant,
}

impl OutboundMessage {
    fn remaining(&self) -> u32 {
        self.length - self.sent
    }

    fn note_peer_activity(&mut self, now: Instant, config: &HomaConfig) {
        self.pings_in_flight = 0;
        self.backoff.reset();
        self.probe_deadline = now + config.ping_timeout;
    }

    fn assert_invariants(&self) {
        debug_assert!(self.acked <= self.sent);
        debug_assert!(self.sent <= self.granted);
        debug_assert!(self.granted <= self.length);
    }
}

struct SenderInner {
    messages: FxHashMap<MessageId, OutboundMessage>,
    by_destination: FxHashMap<SocketAddr, BTreeSet<MessageId>>,
    ready: BTreeSet<ReadyKey>,
    next_enqueue_seq: u64,
}

/// Owns all outbound messages and paces their transmission.
pub struct Sender {
    config: Arc<HomaConfig>,
    driver: Arc<dyn PacketDriver>,
    inner: Mutex<SenderInner>,
}

impl Sender {
    pub fn new(config: Arc<HomaConfig>, driver: Arc<dyn PacketDriver>) -> Sender {
        Sender {
            config,
            driver,
            inner: Mutex::new(SenderInner {
                messages: FxHashMap::default(),
                by_destination: FxHashMap::default(),
                ready: BTreeSet::new(),
                next_enqueue_seq: 0,
            }),
        }
    }

    fn chunk_payload(&self) -> u32 {
        self.config.chunk_payload() as u32
    }

    /// round a byte count up to a whole number of chunks, capped at `length`
    fn chunk_align(&self, bytes: u32, length: u32) -> u32 {
        let chunk = self.chunk_payload() as u64;
        let aligned = (bytes as u64).div_ceil(chunk) * chunk;
        aligned.min(length as u64) as u32
    }

    /// round a byte count down to a chunk boundary. The send and ack cursors
    ///  only ever rest on chunk boundaries (or the end of the message), so
    ///  byte counts derived from peer packets are floored before use.
    fn chunk_floor(&self, bytes: u32) -> u32 {
        bytes / self.chunk_payload() * self.chunk_payload()
    }

    /// register a message for sending. The initial transmission window is
    ///  the policy's unscheduled limit.
    pub fn queue(
        &self,
        id: MessageId,
        destination: SocketAddr,
        wire_flags: u8,
        detached: bool,
        buffer: MessageBuffer,
        status: Arc<StatusCell>,
        now: Instant,
    ) {
        let length: u32 = buffer.len().try_into()
            .expect("message length exceeds the wire format's u32 range");
        let unscheduled = self.chunk_align(policy::unscheduled_limit(&self.config, length), length);

        debug!("queueing message {} of length {} for {:?}", id, length, destination);

        let mut message = OutboundMessage {
            id,
            destination,
            wire_flags,
            buffer,
            length,
            unscheduled,
            granted: unscheduled,
            sent: 0,
            acked: 0,
            priority: policy::priority(&self.config, length),
            status,
            detached,
            enqueue_seq: 0,
            ready_key: None,
            pings_in_flight: 0,
            backoff: ExponentialBackoff::new(8, 16),
            probe_deadline: now + self.config.ping_timeout,
        };
        message.assert_invariants();

        let mut inner = self.inner.lock().unwrap();
        message.enqueue_seq = inner.next_enqueue_seq;
        inner.next_enqueue_seq += 1;

        inner.by_destination.entry(destination).or_default().insert(id);
        let previous = inner.messages.insert(id, message);
        assert!(previous.is_none(), "message id {} queued twice", id);

        Self::enqueue_ready(&self.config, &mut inner, id);
    }

    fn enqueue_ready(config: &HomaConfig, inner: &mut SenderInner, id: MessageId) {
        let Some(message) = inner.messages.get_mut(&id) else { return };
        if message.ready_key.is_some() {
            return;
        }
        if message.status.load() != OutStatus::InProgress || message.sent >= message.granted {
            return;
        }

        // rank 0 is the most urgent, so the BTreeSet iterates urgent-first
        let rank = (config.priority_levels - 1) - policy::priority(config, message.remaining());
        let key = (rank, message.enqueue_seq, id);
        message.ready_key = Some(key);
        inner.ready.insert(key);
    }

    fn dequeue_ready(inner: &mut SenderInner, id: MessageId) {
        if let Some(message) = inner.messages.get_mut(&id) {
            if let Some(key) = message.ready_key.take() {
                inner.ready.remove(&key);
            }
        }
    }

    fn remove_message(inner: &mut SenderInner, id: MessageId) {
        Self::dequeue_ready(inner, id);
        if let Some(message) = inner.messages.remove(&id) {
            if let Some(peers) = inner.by_destination.get_mut(&message.destination) {
                peers.remove(&id);
                if peers.is_empty() {
                    inner.by_destination.remove(&message.destination);
                }
            }
        }
    }

    /// transition to a terminal state; detached messages free themselves
    fn finish(inner: &mut SenderInner, id: MessageId, status: OutStatus) {
        Self::dequeue_ready(inner, id);
        let Some(message) = inner.messages.get_mut(&id) else { return };
        message.status.advance_to(status);
        if message.detached {
            Self::remove_message(inner, id);
        }
    }

    /// emit DATA packets for the most urgent ready messages, up to the
    ///  per-tick budget. Returns the number of packets emitted.
    pub fn poll(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut emitted = 0;

        while emitted < self.config.poll_send_budget {
            let Some(&(_, _, id)) = inner.ready.iter().next() else { break };
            Self::dequeue_ready(&mut inner, id);

            let chunk_payload = self.chunk_payload();
            let message = inner.messages.get_mut(&id).expect("ready key without message");

            let chunk_idx = (message.sent / chunk_payload) as usize;
            let offset = message.sent;
            // a chunk's payload never exceeds the MTU, so this cannot truncate
            let payload_len = message.buffer.chunk_payload_len(chunk_idx) as u32;

            let mut header_flags = message.wire_flags;
            if offset + payload_len == message.length {
                header_flags |= flags::LAST;
            }
            let priority = if offset < message.unscheduled {
                policy::priority(&self.config, message.remaining())
            }
            else {
                message.priority
            };

            let header = PacketHeader::new(id, header_flags, PacketKind::Data {
                total_length: message.length,
                offset,
                payload_len,
                priority,
            });

            trace!("sending DATA {} offset {} len {} prio {} to {:?}",
                   id, offset, payload_len, priority, message.destination);
            let packet = message.buffer.fill_data_packet(chunk_idx, &header);
            self.driver.send_packet(message.destination, packet);

            message.sent += payload_len;
            message.probe_deadline = now + self.config.ping_timeout;
            message.assert_invariants();
            emitted += 1;

            if message.sent == message.length {
                if message.wire_flags & flags::NO_ACK != 0 {
                    // no transport-level acknowledgment: complete on the
                    //  final byte leaving the sender
                    debug!("message {} fully sent, NO_ACK - completing", id);
                    Self::finish(&mut inner, id, OutStatus::Completed);
                }
                else {
                    message.status.advance_to(OutStatus::Sent);
                }
            }
            else {
                Self::enqueue_ready(&self.config, &mut inner, id);
            }
        }

        emitted
    }

    /// GRANT ingress: the receiver extended the transmission window
    pub fn on_grant(&self, id: MessageId, grant_offset: u32, priority: u8, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let Some(message) = inner.messages.get_mut(&id) else {
            debug!("GRANT for unknown message {} - ignoring", id);
            return;
        };
        if message.status.load().is_terminal() {
            return;
        }

        trace!("GRANT {}: offset {} prio {}", id, grant_offset, priority);
        message.note_peer_activity(now, &self.config);
        message.priority = priority;

        let new_granted = self.chunk_align(grant_offset, message.length);
        if new_granted > message.granted {
            message.granted = new_granted;
        }

        // a grant implies the receiver got everything more than one grant
        //  window below it
        let window = self.chunk_align(self.config.rtt_bytes(), message.length);
        let implied_acked = self.chunk_floor(grant_offset.saturating_sub(window)).min(message.sent);
        message.acked = message.acked.max(implied_acked);
        message.assert_invariants();

        Self::enqueue_ready(&self.config, &mut inner, id);
    }

    /// RESEND ingress: rewind the send cursor and retransmit. A RESEND also
    ///  implicitly re-grants through the end of the requested range, so a
    ///  lost GRANT cannot wedge the exchange.
    pub fn on_resend(&self, source: SocketAddr, id: MessageId, offset: u32, length: u32, priority: u8, now: Instant) {
        let mut inner = self.inner.lock().unwrap();

        let Some(message) = inner.messages.get_mut(&id) else {
            debug!("RESEND for unknown message {} - replying ERROR", id);
            let header = PacketHeader::new(id, 0, PacketKind::Error { reason: ErrorReason::UnknownMessage });
            send_control(self.driver.as_ref(), source, &header);
            return;
        };

        match message.status.load() {
            OutStatus::Completed => return, // stale request, the exchange is over
            OutStatus::Canceled => {
                let header = PacketHeader::new(id, 0, PacketKind::Error { reason: ErrorReason::Canceled });
                send_control(self.driver.as_ref(), source, &header);
                return;
            }
            OutStatus::Failed => {
                let header = PacketHeader::new(id, 0, PacketKind::Error { reason: ErrorReason::Internal });
                send_control(self.driver.as_ref(), source, &header);
                return;
            }
            OutStatus::InProgress | OutStatus::Sent => {}
        }

        debug!("RESEND {}: offset {} length {} prio {}", id, offset, length, priority);
        message.note_peer_activity(now, &self.config);
        message.priority = priority;

        // bytes below the requested range have arrived
        message.acked = message.acked.max(self.chunk_floor(offset).min(message.sent));

        let end = offset.saturating_add(length);
        let new_granted = self.chunk_align(end, message.length);
        if new_granted > message.granted {
            message.granted = new_granted;
        }

        // rewind to the start of the chunk containing `offset`, but never
        //  below what the receiver already acknowledged
        let rewind = self.chunk_floor(offset).max(message.acked);
        if rewind < message.sent {
            message.sent = rewind;
            message.status.advance_to(OutStatus::InProgress);
        }
        message.assert_invariants();

        if message.sent < message.granted {
            Self::enqueue_ready(&self.config, &mut inner, id);
        }
        else {
            // nothing sendable: tell the peer we are alive so it keeps waiting
            let header = PacketHeader::new(id, 0, PacketKind::Busy);
            send_control(self.driver.as_ref(), message.destination, &header);
        }
    }

    /// DONE ingress: the receiving application acknowledged the message
    pub fn on_done(&self, id: MessageId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(message) = inner.messages.get_mut(&id) else {
            trace!("DONE for unknown message {} - ignoring", id);
            return;
        };
        if message.status.load().is_terminal() {
            return;
        }
        if message.sent != message.length {
            warn!("DONE for message {} before it was fully sent - completing anyway", id);
        }

        debug!("message {} completed", id);
        message.granted = message.length;
        message.sent = message.length;
        message.acked = message.length;
        message.assert_invariants();
        Self::finish(&mut inner, id, OutStatus::Completed);
    }

    /// ERROR ingress: the peer declared the message failed
    pub fn on_error(&self, id: MessageId, reason: ErrorReason) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.messages.contains_key(&id) {
            trace!("ERROR for unknown message {} - ignoring", id);
            return;
        }

        warn!("message {} failed: peer reported {:?}", id, reason);
        Self::finish(&mut inner, id, OutStatus::Failed);
    }

    /// BUSY ingress: the peer is alive but cannot make progress yet
    pub fn on_busy(&self, id: MessageId, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.get_mut(&id) {
            trace!("BUSY {}: resetting probe state", id);
            message.note_peer_activity(now, &self.config);
        }
    }

    /// probe in-flight messages whose peers have gone quiet; fail them after
    ///  `ping_limit` unanswered probes
    pub fn timer_tick(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.messages.keys().cloned().collect::<Vec<_>>();

        for id in ids {
            let message = inner.messages.get_mut(&id).expect("no concurrent removal");
            if message.status.load().is_terminal() {
                continue;
            }
            if now < message.probe_deadline {
                continue;
            }

            if message.pings_in_flight >= self.config.ping_limit {
                warn!("message {}: peer silent after {} pings - failing", id, message.pings_in_flight);
                Self::finish(&mut inner, id, OutStatus::Failed);
                continue;
            }

            trace!("pinging {} (probe #{})", id, message.pings_in_flight + 1);
            let header = PacketHeader::new(id, 0, PacketKind::Ping);
            send_control(self.driver.as_ref(), message.destination, &header);
            message.pings_in_flight += 1;
            message.probe_deadline = now + self.config.ping_timeout * message.backoff.advance();
        }
    }

    /// application-requested cancellation; best-effort, packets already on
    ///  the wire may still arrive at the peer
    pub fn cancel(&self, id: MessageId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.messages.contains_key(&id) {
            debug!("canceling message {}", id);
            Self::finish(&mut inner, id, OutStatus::Canceled);
        }
    }

    /// cancel every non-terminal message to the given peer, e.g. when the
    ///  embedder learns out-of-band that the peer is gone
    pub fn cancel_peer(&self, destination: SocketAddr) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.by_destination.get(&destination)
            .map(|peers| peers.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        let mut canceled = 0;
        for id in ids {
            let message = inner.messages.get(&id).expect("index entry without message");
            if !message.status.load().is_terminal() {
                Self::finish(&mut inner, id, OutStatus::Canceled);
                canceled += 1;
            }
        }
        canceled
    }

    /// drop the arena entry for a message whose application handle is gone.
    ///  A still-active message is canceled first.
    pub fn release(&self, id: MessageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.get(&id) {
            if !message.status.load().is_terminal() {
                debug!("handle for active message {} dropped - canceling", id);
                message.status.advance_to(OutStatus::Canceled);
            }
            Self::remove_message(&mut inner, id);
        }
    }

    #[cfg(test)]
    fn with_message<R>(&self, id: MessageId, f: impl FnOnce(&OutboundMessage) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.messages.get(&id).map(f)
    }

    #[cfg(test)]
    fn contains(&self, id: MessageId) -> bool {
        self.inner.lock().unwrap().messages.contains_key(&id)
    }
}
