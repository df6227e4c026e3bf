use std::sync::Mutex;
use tracing::{debug, trace};

use crate::buffers::packet_buf::PacketBuf;

/// Fixed-capacity pool of packet buffers. All buffers have the same
///  capacity; the pool is pre-filled at construction and never grows.
///
/// An empty pool returns `None` rather than allocating - callers are
///  expected to back off and retry on a later poll tick.
pub struct PacketPool {
    buf_size: usize,
    buffers: Mutex<Vec<PacketBuf>>,
}

impl PacketPool {
    pub fn new(buf_size: usize, pool_size: usize) -> PacketPool {
        let mut buffers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            buffers.push(PacketBuf::new(buf_size));
        }

        PacketPool {
            buf_size,
            buffers: Mutex::new(buffers),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[must_use]
    pub fn get_from_pool(&self) -> Option<PacketBuf> {
        let mut buffers = self.buffers.lock().unwrap();
        match buffers.pop() {
            Some(buffer) => {
                trace!("returning buffer from pool");
                Some(buffer)
            }
            None => {
                debug!("packet pool exhausted");
                None
            }
        }
    }

    pub fn return_to_pool(&self, mut buffer: PacketBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the pool's capacity of {} bytes", self.buf_size);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// number of buffers currently available
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
