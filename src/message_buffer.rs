//! Chunked message storage.
//!
//! A message is a logical byte array backed by packet-sized chunks. Each
//!  chunk lives in a driver packet buffer and reserves room for a DATA
//!  header in front of its payload bytes, so the send path can fill in the
//!  header and hand the buffer to the driver without assembling a packet.
//!
//! On the receive path the buffer *adopts* arriving packet buffers
//!  ([`MessageBuffer::absorb`]): the payload bytes stay where the driver
//!  wrote them and only the chunk table is updated.
//!
//! All chunks are returned to the driver's pool when the buffer is dropped.

use std::sync::Arc;

use bytes::BufMut;
use tracing::trace;

use crate::buffers::PacketBuf;
use crate::driver::PacketDriver;
use crate::wire::PacketHeader;

struct Chunk {
    buf: PacketBuf,
    /// offset of the first payload byte inside `buf`. Outbound chunks place
    ///  payload directly behind the reserved DATA header; absorbed chunks
    ///  keep whatever layout the wire packet had.
    payload_start: usize,
}

/// Logical byte array backed by a chain of packet-sized chunks.
pub struct MessageBuffer {
    driver: Arc<dyn PacketDriver>,
    chunk_payload: usize,
    chunks: Vec<Option<Chunk>>,
    length: usize,
}

impl MessageBuffer {
    /// an empty, growable buffer for a message under construction
    pub fn new_outbound(driver: Arc<dyn PacketDriver>, chunk_payload: usize) -> MessageBuffer {
        assert!(chunk_payload > 0);
        MessageBuffer {
            driver,
            chunk_payload,
            chunks: Vec::new(),
            length: 0,
        }
    }

    /// a fixed-length buffer with all chunks absent, to be filled by `absorb`
    pub fn new_inbound(driver: Arc<dyn PacketDriver>, chunk_payload: usize, total_length: usize) -> MessageBuffer {
        assert!(chunk_payload > 0);
        let num_chunks = total_length.div_ceil(chunk_payload);
        let mut chunks = Vec::with_capacity(num_chunks);
        chunks.resize_with(num_chunks, || None);

        MessageBuffer {
            driver,
            chunk_payload,
            chunks,
            length: total_length,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// payload bytes carried by the given chunk
    pub fn chunk_payload_len(&self, chunk_idx: usize) -> usize {
        let start = chunk_idx * self.chunk_payload;
        assert!(start < self.length || (self.length == 0 && chunk_idx == 0));
        (self.length - start).min(self.chunk_payload)
    }

    fn materialize_chunk(&mut self, chunk_idx: usize) -> anyhow::Result<()> {
        while self.chunks.len() <= chunk_idx {
            self.chunks.push(None);
        }
        if self.chunks[chunk_idx].is_none() {
            let mut buf = match self.driver.alloc_packet() {
                Some(buf) => buf,
                None => anyhow::bail!("packet pool exhausted"),
            };
            assert!(buf.capacity() >= PacketHeader::DATA_HEADER_LEN + self.chunk_payload,
                    "driver buffers are too small for the configured chunk size");
            buf.set_len(PacketHeader::DATA_HEADER_LEN);
            self.chunks[chunk_idx] = Some(Chunk {
                buf,
                payload_start: PacketHeader::DATA_HEADER_LEN,
            });
        }
        Ok(())
    }

    /// bring every materialized chunk's visible buffer length in sync with
    ///  the logical message length. Newly exposed filler is zeroed, so holes
    ///  read as zero even in recycled pool buffers.
    fn sync_chunk_lens(&mut self) {
        for chunk_idx in 0..self.chunks.len() {
            let payload_len = self.chunk_payload_len(chunk_idx);
            if let Some(chunk) = &mut self.chunks[chunk_idx] {
                let old_len = chunk.buf.len();
                let new_len = chunk.payload_start + payload_len;
                if new_len > old_len {
                    chunk.buf.set_len(new_len);
                    chunk.buf.as_mut()[old_len..new_len].fill(0);
                }
            }
        }
    }

    /// copy `bytes` after the current tail, growing the buffer
    pub fn append(&mut self, mut bytes: &[u8]) -> anyhow::Result<()> {
        while !bytes.is_empty() {
            let chunk_idx = self.length / self.chunk_payload;
            let chunk_offset = self.length % self.chunk_payload;
            self.materialize_chunk(chunk_idx)?;

            let step = bytes.len().min(self.chunk_payload - chunk_offset);
            let chunk = self.chunks[chunk_idx].as_mut().expect("just materialized");
            chunk.buf.put_slice(&bytes[..step]);

            bytes = &bytes[step..];
            self.length += step;
        }
        Ok(())
    }

    /// copy `bytes` in front of the current content.
    ///
    /// NB: this relayouts the whole buffer, so prepend small headers, not
    ///  bulk data
    pub fn prepend(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut combined = Vec::with_capacity(bytes.len() + self.length);
        combined.extend_from_slice(bytes);
        let old_len = self.length;
        combined.resize(bytes.len() + old_len, 0);
        self.get(0, &mut combined[bytes.len()..]);

        for chunk in self.chunks.drain(..).flatten() {
            self.driver.release_packet(chunk.buf);
        }
        self.length = 0;

        self.append(&combined)
    }

    /// random-access write; holes between the previous tail and `offset`
    ///  read as zero
    pub fn set(&mut self, offset: usize, bytes: &[u8]) -> anyhow::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let end = offset + bytes.len();
        // chunks between the previous tail and `offset` must exist too, or
        //  the message would be untransmittable
        let first_hole_chunk = self.length / self.chunk_payload;
        self.length = self.length.max(end);

        let first_chunk = (offset / self.chunk_payload).min(first_hole_chunk);
        let last_chunk = (end - 1) / self.chunk_payload;
        for chunk_idx in first_chunk..=last_chunk {
            self.materialize_chunk(chunk_idx)?;
        }
        self.sync_chunk_lens();

        let mut written = 0;
        while written < bytes.len() {
            let pos = offset + written;
            let chunk_idx = pos / self.chunk_payload;
            let chunk_offset = pos % self.chunk_payload;
            let step = (bytes.len() - written).min(self.chunk_payload - chunk_offset);

            let chunk = self.chunks[chunk_idx].as_mut().expect("materialized above");
            let dst_start = chunk.payload_start + chunk_offset;
            chunk.buf.as_mut()[dst_start..dst_start + step]
                .copy_from_slice(&bytes[written..written + step]);

            written += step;
        }
        Ok(())
    }

    /// copy out starting at `offset`; returns the number of bytes copied,
    ///  which is short if `offset + dst.len()` exceeds the length or runs
    ///  into a chunk that has not arrived yet
    pub fn get(&self, offset: usize, dst: &mut [u8]) -> usize {
        let want = dst.len().min(self.length.saturating_sub(offset));

        let mut copied = 0;
        while copied < want {
            let pos = offset + copied;
            let chunk_idx = pos / self.chunk_payload;
            let chunk_offset = pos % self.chunk_payload;

            let chunk = match &self.chunks[chunk_idx] {
                Some(chunk) => chunk,
                None => {
                    trace!("read at offset {} ran into an absent chunk {}", pos, chunk_idx);
                    break;
                }
            };

            let step = (want - copied).min(self.chunk_payload - chunk_offset);
            let src_start = chunk.payload_start + chunk_offset;
            dst[copied..copied + step]
                .copy_from_slice(&chunk.buf.as_ref()[src_start..src_start + step]);

            copied += step;
        }
        copied
    }

    /// adopt a received packet's storage as the chunk at `chunk_idx`; the
    ///  payload is the range starting at `payload_start` inside `packet`.
    ///
    /// The caller has already verified alignment, length and duplicate
    ///  status; a packet for an already-present chunk is a caller bug.
    pub fn absorb(&mut self, chunk_idx: usize, packet: PacketBuf, payload_start: usize) {
        assert!(chunk_idx < self.chunks.len(), "chunk index out of range");
        assert!(self.chunks[chunk_idx].is_none(), "chunk absorbed twice");
        assert!(packet.len() >= payload_start + self.chunk_payload_len(chunk_idx));

        self.chunks[chunk_idx] = Some(Chunk { buf: packet, payload_start });
    }

    pub fn has_chunk(&self, chunk_idx: usize) -> bool {
        self.chunks.get(chunk_idx).map(|c| c.is_some()).unwrap_or(false)
    }

    /// write the DATA header into the chunk's reserved prefix and return the
    ///  finished packet bytes, ready to hand to the driver
    pub fn fill_data_packet(&mut self, chunk_idx: usize, header: &PacketHeader) -> &[u8] {
        let payload_len = self.chunk_payload_len(chunk_idx);
        let chunk = self.chunks[chunk_idx].as_mut()
            .expect("serializing an absent chunk");
        assert!(chunk.payload_start >= PacketHeader::DATA_HEADER_LEN,
                "chunk has no header reserve");

        let header_start = chunk.payload_start - PacketHeader::DATA_HEADER_LEN;
        let mut slot = &mut chunk.buf.as_mut()[header_start..chunk.payload_start];
        header.ser(&mut slot);
        assert!(slot.is_empty(), "DATA header must exactly fill the reserve");

        &chunk.buf.as_ref()[header_start..chunk.payload_start + payload_len]
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..).flatten() {
            self.driver.release_packet(chunk.buf);
        }
    }
}
