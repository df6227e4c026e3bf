//! Inbound side of the transport: reassembly of arriving DATA packets,
//!  receiver-driven grant scheduling, and the completion queue feeding the
//!  application.
//!
//! The grant scheduler is where Homa's defining idea lives: at most
//!  `active_grant_slots` distinct senders are granted scheduled bytes at any
//!  time, picked by SRPT over all in-progress inbound messages, and each
//!  active message is kept one RTT-bandwidth window ahead of what has
//!  arrived.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::buffers::PacketBuf;
use crate::chunk_bitmap::ChunkBitmap;
use crate::config::HomaConfig;
use crate::driver::PacketDriver;
use crate::message_buffer::MessageBuffer;
use crate::policy;
use crate::wire::{flags, send_control, ErrorReason, MessageId, PacketHeader, PacketKind};

/// What happened to an ingress DATA packet; the transport aggregates these
///  into its telemetry counters.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DataOutcome {
    /// new payload absorbed into an in-progress message
    Absorbed,
    /// new payload absorbed and the message is now complete
    Completed,
    /// the chunk was already present; packet dropped
    Duplicate,
    /// retransmit for a message that already reached a terminal state here
    Stale,
    /// offset / length fields are inconsistent; packet dropped
    Malformed,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum InStatus {
    InProgress,
    Completed,
}

/// Terminal memory of a message after its live state is gone. Keeps the
///  protocol's answers to late retransmits and pings consistent until the
///  peer must have moved on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Tombstone {
    /// application acknowledged; late probes get a repeated DONE
    Acknowledged,
    /// application released without acknowledging; the peer gets silence
    ///  and decides on its own timeout
    Discarded,
    /// reassembly gave up; late probes get an ERROR
    Failed,
}

type MessageKey = (SocketAddr, MessageId);
type SrptKey = (u32, SocketAddr, MessageId);

/// A message being received, or received and waiting for the application.
pub struct InboundMessage {
    id: MessageId,
    source: SocketAddr,
    length: u32,
    /// flag bits observed on this message's DATA packets
    wire_flags: u8,
    buffer: MessageBuffer,
    bitmap: ChunkBitmap,
    received_bytes: u32,
    grant_offset: u32,
    grant_priority: u8,
    status: InStatus,
    srpt_key: Option<SrptKey>,
    resend_deadline: Instant,
    resends_in_flight: u32,
}

impl InboundMessage {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn no_ack(&self) -> bool {
        self.wire_flags & flags::NO_ACK != 0
    }

    /// copy out received bytes; short reads only occur on incomplete
    ///  messages
    pub fn get(&self, offset: usize, dst: &mut [u8]) -> usize {
        self.buffer.get(offset, dst)
    }

    fn remaining(&self) -> u32 {
        self.length - self.received_bytes
    }

    fn note_activity(&mut self, now: Instant, config: &HomaConfig) {
        self.resends_in_flight = 0;
        self.resend_deadline = now + config.resend_timeout;
    }

    fn assert_invariants(&self) {
        debug_assert!(self.received_bytes <= self.length);
        debug_assert!(self.grant_offset <= self.length);
        debug_assert_eq!(self.bitmap.is_full(), self.received_bytes == self.length);
    }
}

struct ReceiverInner {
    messages: FxHashMap<MessageKey, InboundMessage>,
    /// in-progress messages that still need grants, SRPT order
    srpt: BTreeSet<SrptKey>,
    completed: VecDeque<InboundMessage>,
    /// completed messages not yet acknowledged by the application
    pending_ack: FxHashSet<MessageKey>,
    tombstones: FxHashMap<MessageKey, (Tombstone, Instant)>,
    /// peers expected to send a response shortly; each holds a grant slot
    reserved_peers: FxHashMap<SocketAddr, Instant>,
}

impl ReceiverInner {
    fn bury(&mut self, key: MessageKey, tombstone: Tombstone, now: Instant) {
        self.tombstones.insert(key, (tombstone, now));
    }
}

/// Owns all inbound messages and issues grants.
pub struct Receiver {
    config: Arc<HomaConfig>,
    driver: Arc<dyn PacketDriver>,
    inner: Mutex<ReceiverInner>,
}

impl Receiver {
    pub fn new(config: Arc<HomaConfig>, driver: Arc<dyn PacketDriver>) -> Receiver {
        Receiver {
            config,
            driver,
            inner: Mutex::new(ReceiverInner {
                messages: FxHashMap::default(),
                srpt: BTreeSet::new(),
                completed: VecDeque::new(),
                pending_ack: FxHashSet::default(),
                tombstones: FxHashMap::default(),
                reserved_peers: FxHashMap::default(),
            }),
        }
    }

    fn chunk_payload(&self) -> u32 {
        self.config.chunk_payload() as u32
    }

    /// one grant window: the bytes the link carries in one RTT, in whole
    ///  chunks
    fn grant_window(&self) -> u32 {
        let chunk = self.chunk_payload() as u64;
        let window = (self.config.rtt_bytes() as u64).div_ceil(chunk) * chunk;
        window.min(u32::MAX as u64) as u32
    }

    /// how long a terminal message's identity is remembered. The peer gives
    ///  up pinging after `ping_limit` probes with up-to-8x backoff, so
    ///  anything older cannot be asked about again.
    fn tombstone_linger(&self) -> Duration {
        self.config.ping_timeout * (self.config.ping_limit * 8)
    }

    fn update_srpt(inner: &mut ReceiverInner, key: MessageKey) {
        let Some(message) = inner.messages.get_mut(&key) else { return };

        let desired = (message.status == InStatus::InProgress && message.grant_offset < message.length)
            .then_some((message.remaining(), key.0, key.1));

        if message.srpt_key != desired {
            if let Some(old) = message.srpt_key.take() {
                inner.srpt.remove(&old);
            }
            if let Some(new) = desired {
                inner.srpt.insert(new);
                message.srpt_key = Some(new);
            }
        }
    }

    fn remove_message(inner: &mut ReceiverInner, key: MessageKey) -> Option<InboundMessage> {
        let mut message = inner.messages.remove(&key)?;
        if let Some(srpt_key) = message.srpt_key.take() {
            inner.srpt.remove(&srpt_key);
        }
        Some(message)
    }

    /// answer a probe (or stray DATA) for a message that has a tombstone
    fn answer_tombstone(&self, source: SocketAddr, id: MessageId, tombstone: Tombstone) {
        match tombstone {
            Tombstone::Acknowledged => {
                trace!("probe for acknowledged message {} - repeating DONE", id);
                send_control(self.driver.as_ref(), source,
                             &PacketHeader::new(id, 0, PacketKind::Done));
            }
            Tombstone::Discarded => {
                trace!("probe for discarded message {} - staying silent", id);
            }
            Tombstone::Failed => {
                trace!("probe for failed message {} - repeating ERROR", id);
                send_control(self.driver.as_ref(), source,
                             &PacketHeader::new(id, 0, PacketKind::Error { reason: ErrorReason::Internal }));
            }
        }
    }

    /// DATA ingress. Takes ownership of the packet buffer: it is either
    ///  absorbed into message storage or released back to the driver.
    pub fn on_data(&self, source: SocketAddr, header: &PacketHeader, packet: PacketBuf, now: Instant) -> DataOutcome {
        let PacketKind::Data { total_length, offset, payload_len, priority: _ } = header.kind else {
            self.driver.release_packet(packet);
            return DataOutcome::Malformed;
        };
        let id = header.message_id;
        let key = (source, id);
        let chunk_payload = self.chunk_payload();

        // structural validation before any state is touched
        let valid = offset % chunk_payload == 0
            && offset < total_length
            && payload_len == (total_length - offset).min(chunk_payload)
            && packet.len() >= PacketHeader::DATA_HEADER_LEN + payload_len as usize;
        if !valid {
            debug!("malformed DATA {} from {:?}: offset {} payload_len {} total {}",
                   id, source, offset, payload_len, total_length);
            self.driver.release_packet(packet);
            return DataOutcome::Malformed;
        }
        let chunk_idx = (offset / chunk_payload) as usize;

        let mut inner = self.inner.lock().unwrap();

        if !inner.messages.contains_key(&key) {
            if let Some(&(tombstone, _)) = inner.tombstones.get(&key) {
                self.driver.release_packet(packet);
                self.answer_tombstone(source, id, tombstone);
                return DataOutcome::Stale;
            }
            if inner.pending_ack.contains(&key) {
                // complete but the application has not acknowledged it yet
                trace!("DATA for completed message {} - replying BUSY", id);
                self.driver.release_packet(packet);
                send_control(self.driver.as_ref(), source,
                             &PacketHeader::new(id, 0, PacketKind::Busy));
                return DataOutcome::Stale;
            }

            debug!("new inbound message {} from {:?}, length {}", id, source, total_length);
            let chunk_payload_usize = chunk_payload as usize;
            let total_length_usize = total_length as usize;
            let unscheduled = policy::unscheduled_limit(&self.config, total_length);
            let grant_offset = {
                let chunk = chunk_payload as u64;
                let aligned = (unscheduled as u64).div_ceil(chunk) * chunk;
                aligned.min(total_length as u64) as u32
            };
            let message = InboundMessage {
                id,
                source,
                length: total_length,
                wire_flags: 0,
                buffer: MessageBuffer::new_inbound(self.driver.clone(), chunk_payload_usize, total_length_usize),
                bitmap: ChunkBitmap::new(total_length_usize.div_ceil(chunk_payload_usize)),
                received_bytes: 0,
                grant_offset,
                grant_priority: policy::priority(&self.config, total_length),
                status: InStatus::InProgress,
                srpt_key: None,
                resend_deadline: now + self.config.resend_timeout,
                resends_in_flight: 0,
            };
            inner.messages.insert(key, message);
            Self::update_srpt(&mut inner, key);

            // the anticipated response from this peer has arrived
            inner.reserved_peers.remove(&source);
        }

        let message = inner.messages.get_mut(&key).expect("inserted above");

        if message.length != total_length {
            warn!("DATA for message {} declares length {} but {} was established - dropping",
                  id, total_length, message.length);
            self.driver.release_packet(packet);
            return DataOutcome::Malformed;
        }

        message.wire_flags |= header.flags & (flags::NO_ACK | flags::EXPECT_RESPONSE);
        message.note_activity(now, &self.config);

        if !message.bitmap.set(chunk_idx) {
            trace!("duplicate DATA {} chunk {}", id, chunk_idx);
            self.driver.release_packet(packet);
            return DataOutcome::Duplicate;
        }

        message.buffer.absorb(chunk_idx, packet, PacketHeader::DATA_HEADER_LEN);
        message.received_bytes += payload_len;
        message.assert_invariants();
        trace!("absorbed DATA {} chunk {}, {}/{} bytes",
               id, chunk_idx, message.received_bytes, message.length);

        if message.received_bytes == message.length {
            debug!("message {} from {:?} complete", id, source);
            let mut message = Self::remove_message(&mut inner, key).expect("present");
            message.status = InStatus::Completed;
            inner.pending_ack.insert(key);
            inner.completed.push_back(message);
            return DataOutcome::Completed;
        }

        Self::update_srpt(&mut inner, key);
        DataOutcome::Absorbed
    }

    /// BUSY ingress: the sender is alive but cannot serve our RESEND yet
    pub fn on_busy(&self, source: SocketAddr, id: MessageId, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.get_mut(&(source, id)) {
            trace!("BUSY {}: peer alive, backing off resends", id);
            message.note_activity(now, &self.config);
        }
    }

    /// PING ingress: report this message's state back to the sender
    pub fn on_ping(&self, source: SocketAddr, id: MessageId, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let key = (source, id);

        if let Some(message) = inner.messages.get_mut(&key) {
            trace!("PING {}: repeating grant state", id);
            message.note_activity(now, &self.config);
            let header = PacketHeader::new(id, 0, PacketKind::Grant {
                grant_offset: message.grant_offset,
                priority: message.grant_priority,
            });
            send_control(self.driver.as_ref(), source, &header);
        }
        else if inner.pending_ack.contains(&key) {
            trace!("PING {}: complete, awaiting application acknowledgment", id);
            send_control(self.driver.as_ref(), source,
                         &PacketHeader::new(id, 0, PacketKind::Busy));
        }
        else if let Some(&(tombstone, _)) = inner.tombstones.get(&key) {
            self.answer_tombstone(source, id, tombstone);
        }
        else {
            // no state at all: ask the sender to start over
            debug!("PING for unknown message {} - requesting restart", id);
            let header = PacketHeader::new(id, 0, PacketKind::Resend {
                offset: 0,
                length: self.chunk_payload(),
                priority: self.config.priority_levels - 1,
            });
            send_control(self.driver.as_ref(), source, &header);
        }
    }

    /// ERROR ingress: the sender declared the message dead
    pub fn on_error(&self, source: SocketAddr, id: MessageId, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let key = (source, id);
        if Self::remove_message(&mut inner, key).is_some() {
            warn!("inbound message {} from {:?} failed: peer reported an error", id, source);
            inner.bury(key, Tombstone::Failed, now);
        }
    }

    /// issue grants to the active senders. Called once per poll tick; each
    ///  active message's window is extended by at most one chunk per call.
    pub fn poll_grants(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap();

        // reservations are consumed by arriving traffic (in `on_data`) and
        //  expire if the anticipated response never comes
        inner.reserved_peers.retain(|_, expiry| *expiry > now);

        let available_slots = self.config.active_grant_slots
            .saturating_sub(inner.reserved_peers.len());

        // active set: best message per source, SRPT order, bounded slots
        let mut active = Vec::new();
        let mut admitted_sources = FxHashSet::default();
        for &(_, source, id) in inner.srpt.iter() {
            if active.len() == available_slots {
                break;
            }
            if admitted_sources.insert(source) {
                active.push((source, id));
            }
        }

        let window = self.grant_window();
        let chunk_payload = self.chunk_payload();
        let mut granted = 0;

        for key in active {
            let message = inner.messages.get_mut(&key).expect("srpt key without message");

            if message.grant_offset.saturating_sub(message.received_bytes) >= window {
                continue; // already a full window ahead
            }
            let extended = message.grant_offset
                .saturating_add(chunk_payload)
                .min(message.length);
            if extended == message.grant_offset {
                continue;
            }

            message.grant_offset = extended;
            message.grant_priority = policy::priority(&self.config, message.remaining());
            message.assert_invariants();

            trace!("granting {} through {} at priority {}",
                   message.id, message.grant_offset, message.grant_priority);
            let header = PacketHeader::new(message.id, 0, PacketKind::Grant {
                grant_offset: message.grant_offset,
                priority: message.grant_priority,
            });
            send_control(self.driver.as_ref(), key.0, &header);
            granted += 1;

            Self::update_srpt(&mut inner, key);
        }

        granted
    }

    /// request retransmission of missing bytes for messages whose senders
    ///  have gone quiet; fail them after `resend_limit` unanswered requests
    pub fn timer_tick(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();

        let keys = inner.messages.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            let message = inner.messages.get_mut(&key).expect("no concurrent removal");
            if now < message.resend_deadline {
                continue;
            }

            if message.resends_in_flight >= self.config.resend_limit {
                warn!("inbound message {} from {:?}: sender silent after {} resend requests - dropping",
                      message.id, key.0, message.resends_in_flight);
                Self::remove_message(&mut inner, key);
                inner.bury(key, Tombstone::Failed, now);
                continue;
            }

            let first_clear = message.bitmap.first_clear()
                .expect("an in-progress message has missing chunks");
            // chunk counts are bounded by the u32 message length, so these
            //  narrowing casts cannot truncate
            let first_chunk = first_clear as u32;
            let run = message.bitmap.clear_run_len(first_clear) as u32;

            let offset = first_chunk * self.chunk_payload();
            let length = (run.saturating_mul(self.chunk_payload()))
                .min(message.length - offset)
                .min(self.grant_window());

            debug!("requesting resend of {} bytes at offset {} for message {}",
                   length, offset, message.id);
            let header = PacketHeader::new(message.id, 0, PacketKind::Resend {
                offset,
                length,
                priority: message.grant_priority,
            });
            send_control(self.driver.as_ref(), key.0, &header);

            message.resends_in_flight += 1;
            message.resend_deadline = now + self.config.resend_timeout;
        }

        let linger = self.tombstone_linger();
        inner.tombstones.retain(|_, (_, buried_at)| now.duration_since(*buried_at) < linger);
    }

    /// pop the next completed message, transferring ownership to the caller
    pub fn receive(&self) -> Option<InboundMessage> {
        self.inner.lock().unwrap().completed.pop_front()
    }

    /// the application consumed the message: emit DONE (unless the sender
    ///  opted out) and remember the acknowledgment
    pub fn acknowledge(&self, message: &InboundMessage, now: Instant) {
        let key = (message.source, message.id);
        let mut inner = self.inner.lock().unwrap();
        if !inner.pending_ack.remove(&key) {
            return; // already acknowledged or discarded
        }
        inner.bury(key, Tombstone::Acknowledged, now);
        drop(inner);

        if !message.no_ack() {
            trace!("acknowledging {} to {:?}", message.id, message.source);
            send_control(self.driver.as_ref(), message.source,
                         &PacketHeader::new(message.id, 0, PacketKind::Done));
        }
    }

    /// the application released the message without acknowledging it; no
    ///  DONE is sent and the sender decides what to do when it times out
    pub fn discard(&self, message: &InboundMessage, now: Instant) {
        let key = (message.source, message.id);
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_ack.remove(&key) {
            debug!("discarding {} without acknowledgment", message.id);
            inner.bury(key, Tombstone::Discarded, now);
        }
    }

    /// hold a grant slot for an anticipated response from `peer`, so an
    ///  incast of responses does not swamp the scheduled senders
    pub fn reserve_response_slot(&self, peer: SocketAddr, now: Instant) {
        let expiry = now + self.config.ping_timeout;
        self.inner.lock().unwrap().reserved_peers.insert(peer, expiry);
    }

    #[cfg(test)]
    fn with_message<R>(&self, key: MessageKey, f: impl FnOnce(&InboundMessage) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.messages.get(&key).map(f)
    }

    #[cfg(test)]
    fn contains(&self, key: MessageKey) -> bool {
        self.inner.lock().unwrap().messages.contains_key(&key)
    }
}
