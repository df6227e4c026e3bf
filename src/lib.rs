//! Message-oriented transport for datacenter networks, modeled on the Homa
//!  protocol: applications exchange variable-length *messages* (as opposed to
//!  byte streams), and the receiver drives the flow of long messages through
//!  explicit grants so that short messages win the network.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, i.e. defined-length
//!   chunks of data as opposed to streams of bytes
//!   * no ordering guarantees *between* messages, even between the same pair
//!     of endpoints - applications that need ordering sequence their own
//!     messages
//!   * delivery is at-least-once; duplicate suppression across retries of a
//!     whole message is the application's job
//! * Minimise tail latency for short messages on fast datacenter networks
//!   * a sender may transmit a configured number of *unscheduled* bytes
//!     immediately, so short messages complete in a single RTT without any
//!     handshake
//!   * everything beyond the unscheduled window is paced by the receiver
//!     through GRANT packets - the receiver is the one place that sees all
//!     incoming traffic, so it is the natural arbiter
//!   * both sides schedule by SRPT (shortest remaining processing time):
//!     the message with the fewest remaining bytes gets the highest
//!     priority, so a short message preempts a long one mid-flight
//! * The transport is driven by a single non-blocking [`Transport::poll`]
//!   loop; nothing inside the core ever blocks or sleeps
//!   * application threads may concurrently allocate, send, receive and
//!     observe status - those entry points are thread-safe
//! * Packet I/O is behind the [`driver::PacketDriver`] trait so the same
//!   core runs over UDP sockets, kernel-bypass NICs, or an in-memory fabric
//!   in tests
//!
//! ## Wire format
//!
//! Every packet starts with a 20-byte common header, all numbers big-endian:
//!
//! ```ascii
//!  0: opcode (u8): DATA / GRANT / RESEND / BUSY / PING / DONE / ERROR
//!  1: flags (u8): bit 0 NO_ACK, bit 1 EXPECT_RESPONSE, bit 2 LAST (DATA only)
//!  2: message id: sender transport id (u64) + per-sender sequence (u64)
//! 18: reserved (u16), zero on send, ignored on receive
//! ```
//!
//! Opcode-specific tails follow the common header:
//!
//! ```ascii
//! DATA:   total_length (u32), offset (u32), payload_len (u32), priority (u8),
//!          payload bytes
//! GRANT:  grant_offset (u32), priority (u8)
//! RESEND: offset (u32), length (u32), priority (u8)
//! BUSY:   [no tail]
//! PING:   [no tail]
//! DONE:   [no tail]
//! ERROR:  reason (u8)
//! ```
//!
//! ## Protocol sketch
//!
//! A sender transmits DATA packets for the unscheduled prefix of a message
//!  without waiting. The receiver reassembles chunks into a bitmap-tracked
//!  buffer and, for messages longer than the unscheduled window, extends the
//!  sender's transmission window with GRANT packets - at most a configured
//!  number of senders receive grants concurrently, picked by SRPT. Losses
//!  are repaired by receiver-issued RESENDs; prolonged silence is probed by
//!  sender-issued PINGs. When the receiving application has consumed a
//!  message it acknowledges it, which emits DONE and completes the sender's
//!  state machine.

pub mod backoff;
pub mod buffers;
pub mod chunk_bitmap;
pub mod config;
pub mod driver;
pub mod message_buffer;
pub mod policy;
pub mod receiver;
pub mod sender;
pub mod test_util;
pub mod transport;
pub mod wire;

pub use config::HomaConfig;
pub use driver::PacketDriver;
pub use transport::{InMessage, OutMessage, OutStatus, SendFlags, Transport};
pub use wire::MessageId;
