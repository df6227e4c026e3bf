pub mod packet_buf;
pub mod packet_pool;

pub use packet_buf::PacketBuf;
pub use packet_pool::PacketPool;
