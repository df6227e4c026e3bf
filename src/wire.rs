//! Wire codec: the common packet header and the opcode-specific tails.
//!
//! All numbers are transmitted in network byte order (BE). The codec is
//!  deliberately fixed-width - every field has a known size, so header
//!  lengths are compile-time constants and the receive path can bounds-check
//!  before parsing.

use std::fmt::{Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};

/// Globally unique identity of a message: the sending transport's
///  process-lifetime unique id plus a per-sender monotonic sequence.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageId {
    pub transport_id: u64,
    pub sequence: u64,
}

impl MessageId {
    pub fn new(transport_id: u64, sequence: u64) -> MessageId {
        MessageId { transport_id, sequence }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.transport_id);
        buf.put_u64(self.sequence);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        let transport_id = buf.try_get_u64()?;
        let sequence = buf.try_get_u64()?;
        Ok(MessageId { transport_id, sequence })
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.sequence)
    }
}

/// Flags byte in the common header.
pub mod flags {
    /// the sender does not require a transport-level DONE acknowledgment
    pub const NO_ACK: u8 = 1 << 0;
    /// the message is expected to trigger a response message, so the
    ///  receiving side should anticipate return traffic
    pub const EXPECT_RESPONSE: u8 = 1 << 1;
    /// set on the DATA packet that carries the final byte of a message
    pub const LAST: u8 = 1 << 2;

    pub const ALL: u8 = NO_ACK | EXPECT_RESPONSE | LAST;
}

/// Reason byte of an ERROR packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorReason {
    /// the peer has no state for the referenced message id
    UnknownMessage,
    /// the peer canceled the message
    Canceled,
    /// unspecified failure on the peer
    Internal,
}

impl ErrorReason {
    fn to_wire(self) -> u8 {
        match self {
            ErrorReason::UnknownMessage => 0,
            ErrorReason::Canceled => 1,
            ErrorReason::Internal => 2,
        }
    }

    fn from_wire(raw: u8) -> anyhow::Result<ErrorReason> {
        match raw {
            0 => Ok(ErrorReason::UnknownMessage),
            1 => Ok(ErrorReason::Canceled),
            2 => Ok(ErrorReason::Internal),
            _ => bail!("invalid error reason {}", raw),
        }
    }
}

/// Opcode-specific part of a packet.
///
/// For `Data`, the payload bytes follow the serialized header; `payload_len`
///  describes them but the codec itself neither reads nor writes payload.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PacketKind {
    Data {
        total_length: u32,
        offset: u32,
        payload_len: u32,
        priority: u8,
    },
    Grant {
        grant_offset: u32,
        priority: u8,
    },
    Resend {
        offset: u32,
        length: u32,
        priority: u8,
    },
    Busy,
    Ping,
    Done,
    Error {
        reason: ErrorReason,
    },
}

impl PacketKind {
    const OPCODE_DATA: u8 = 1;
    const OPCODE_GRANT: u8 = 2;
    const OPCODE_RESEND: u8 = 3;
    const OPCODE_BUSY: u8 = 4;
    const OPCODE_PING: u8 = 5;
    const OPCODE_DONE: u8 = 6;
    const OPCODE_ERROR: u8 = 7;

    fn opcode(&self) -> u8 {
        match self {
            PacketKind::Data { .. } => Self::OPCODE_DATA,
            PacketKind::Grant { .. } => Self::OPCODE_GRANT,
            PacketKind::Resend { .. } => Self::OPCODE_RESEND,
            PacketKind::Busy => Self::OPCODE_BUSY,
            PacketKind::Ping => Self::OPCODE_PING,
            PacketKind::Done => Self::OPCODE_DONE,
            PacketKind::Error { .. } => Self::OPCODE_ERROR,
        }
    }
}

/// The part of a packet that every opcode shares, plus the opcode tail.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub message_id: MessageId,
    pub flags: u8,
    pub kind: PacketKind,
}

impl PacketHeader {
    /// opcode + flags + message id + reserved
    pub const COMMON_HEADER_LEN: usize = 1 + 1 + 16 + 2;

    /// serialized length of a DATA header (common header + DATA tail). Every
    ///  payload chunk reserves this much space in front of its bytes.
    pub const DATA_HEADER_LEN: usize = Self::COMMON_HEADER_LEN + 4 + 4 + 4 + 1;

    /// upper bound across all opcode tails, for sizing control packet buffers
    pub const MAX_HEADER_LEN: usize = Self::DATA_HEADER_LEN;

    pub fn new(message_id: MessageId, flags: u8, kind: PacketKind) -> PacketHeader {
        PacketHeader { message_id, flags, kind }
    }

    pub fn serialized_len(&self) -> usize {
        Self::COMMON_HEADER_LEN + match self.kind {
            PacketKind::Data { .. } => 13,
            PacketKind::Grant { .. } => 5,
            PacketKind::Resend { .. } => 9,
            PacketKind::Busy | PacketKind::Ping | PacketKind::Done => 0,
            PacketKind::Error { .. } => 1,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.opcode());
        buf.put_u8(self.flags);
        self.message_id.ser(buf);
        buf.put_u16(0); // reserved

        match self.kind {
            PacketKind::Data { total_length, offset, payload_len, priority } => {
                buf.put_u32(total_length);
                buf.put_u32(offset);
                buf.put_u32(payload_len);
                buf.put_u8(priority);
            }
            PacketKind::Grant { grant_offset, priority } => {
                buf.put_u32(grant_offset);
                buf.put_u8(priority);
            }
            PacketKind::Resend { offset, length, priority } => {
                buf.put_u32(offset);
                buf.put_u32(length);
                buf.put_u8(priority);
            }
            PacketKind::Busy | PacketKind::Ping | PacketKind::Done => {}
            PacketKind::Error { reason } => {
                buf.put_u8(reason.to_wire());
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let opcode = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;
        if flags & !flags::ALL != 0 {
            bail!("invalid flags {:#x}", flags);
        }
        let message_id = MessageId::deser(buf)?;
        let _reserved = buf.try_get_u16()?;

        let kind = match opcode {
            PacketKind::OPCODE_DATA => PacketKind::Data {
                total_length: buf.try_get_u32()?,
                offset: buf.try_get_u32()?,
                payload_len: buf.try_get_u32()?,
                priority: buf.try_get_u8()?,
            },
            PacketKind::OPCODE_GRANT => PacketKind::Grant {
                grant_offset: buf.try_get_u32()?,
                priority: buf.try_get_u8()?,
            },
            PacketKind::OPCODE_RESEND => PacketKind::Resend {
                offset: buf.try_get_u32()?,
                length: buf.try_get_u32()?,
                priority: buf.try_get_u8()?,
            },
            PacketKind::OPCODE_BUSY => PacketKind::Busy,
            PacketKind::OPCODE_PING => PacketKind::Ping,
            PacketKind::OPCODE_DONE => PacketKind::Done,
            PacketKind::OPCODE_ERROR => PacketKind::Error {
                reason: ErrorReason::from_wire(buf.try_get_u8()?)?,
            },
            _ => bail!("invalid opcode {}", opcode),
        };

        Ok(PacketHeader { message_id, flags, kind })
    }
}

/// Serialize a header-only packet into a stack buffer and hand it to the
///  driver. Control packets never carry payload, so no pool buffer is
///  involved and emission cannot fail on pool exhaustion.
pub(crate) fn send_control(driver: &dyn crate::driver::PacketDriver, to: std::net::SocketAddr, header: &PacketHeader) {
    let mut buf = [0u8; PacketHeader::MAX_HEADER_LEN];
    let mut slot: &mut [u8] = &mut buf;
    header.ser(&mut slot);

    let written = PacketHeader::MAX_HEADER_LEN - slot.len();
    debug_assert_eq!(written, header.serialized_len());
    driver.send_packet(to, &buf[..written]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::data(
        PacketHeader::new(MessageId::new(3, 8), flags::LAST, PacketKind::Data {
            total_length: 1000, offset: 256, payload_len: 744, priority: 6 }),
        vec![1, 4, 0,0,0,0,0,0,0,3, 0,0,0,0,0,0,0,8, 0,0,
             0,0,3,232, 0,0,1,0, 0,0,2,232, 6])]
    #[case::data_flags(
        PacketHeader::new(MessageId::new(1, 2), flags::NO_ACK | flags::EXPECT_RESPONSE, PacketKind::Data {
            total_length: 5, offset: 0, payload_len: 5, priority: 7 }),
        vec![1, 3, 0,0,0,0,0,0,0,1, 0,0,0,0,0,0,0,2, 0,0,
             0,0,0,5, 0,0,0,0, 0,0,0,5, 7])]
    #[case::grant(
        PacketHeader::new(MessageId::new(9, 1), 0, PacketKind::Grant { grant_offset: 11464, priority: 5 }),
        vec![2, 0, 0,0,0,0,0,0,0,9, 0,0,0,0,0,0,0,1, 0,0,
             0,0,44,200, 5])]
    #[case::resend(
        PacketHeader::new(MessageId::new(9, 2), 0, PacketKind::Resend { offset: 1467, length: 1467, priority: 3 }),
        vec![3, 0, 0,0,0,0,0,0,0,9, 0,0,0,0,0,0,0,2, 0,0,
             0,0,5,187, 0,0,5,187, 3])]
    #[case::busy(
        PacketHeader::new(MessageId::new(4, 7), 0, PacketKind::Busy),
        vec![4, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0])]
    #[case::ping(
        PacketHeader::new(MessageId::new(4, 7), 0, PacketKind::Ping),
        vec![5, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0])]
    #[case::done(
        PacketHeader::new(MessageId::new(4, 7), 0, PacketKind::Done),
        vec![6, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0])]
    #[case::error(
        PacketHeader::new(MessageId::new(4, 7), 0, PacketKind::Error { reason: ErrorReason::UnknownMessage }),
        vec![7, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0, 0])]
    fn test_ser_deser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), header.serialized_len());

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_common(vec![1, 0, 0,0,0,0,0,0,0,4])]
    #[case::truncated_tail(vec![2, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0, 0,0])]
    #[case::bad_opcode(vec![99, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0])]
    #[case::zero_opcode(vec![0, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0])]
    #[case::bad_flags(vec![5, 0x80, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0])]
    #[case::bad_error_reason(vec![7, 0, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,7, 0,0, 9])]
    fn test_deser_rejects(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_header_len_constants() {
        assert_eq!(PacketHeader::COMMON_HEADER_LEN, 20);
        assert_eq!(PacketHeader::DATA_HEADER_LEN, 33);
    }
}
