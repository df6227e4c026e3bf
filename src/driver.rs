use std::net::SocketAddr;

#[cfg(test)] use mockall::automock;

use crate::buffers::PacketBuf;

/// Capability record for packet I/O, chosen at transport construction.
///
/// This is the seam between the protocol core and the fabric: a driver
///  owns one NIC queue (or socket, or in-memory fabric port), a pool of
///  fixed-size packet buffers, and the addressing scheme. The core never
///  blocks on a driver call - `send_packet` hands the bytes to the fabric
///  or drops them, `receive_packets` returns whatever has arrived.
///
/// Buffer ownership: `alloc_packet` transfers a buffer to the caller;
///  every such buffer must come back exactly once via `release_packet`,
///  on every path (delivered, duplicate, malformed).
#[cfg_attr(test, automock)]
pub trait PacketDriver: Send + Sync + 'static {
    /// take a buffer from the driver's pool; `None` means the pool is
    ///  exhausted and the caller should back off until buffers are released
    fn alloc_packet(&self) -> Option<PacketBuf>;

    /// transmit one packet. The driver copies or DMAs the bytes before
    ///  returning; the slice is not retained.
    fn send_packet(&self, to: SocketAddr, packet: &[u8]);

    /// drain up to `max` received packets into `out`, returning how many
    ///  were appended. Buffers in `out` are pool buffers and must be
    ///  released (or absorbed into message storage and released later).
    fn receive_packets(&self, max: usize, out: &mut Vec<(SocketAddr, PacketBuf)>) -> usize;

    /// return a buffer to the driver's pool
    fn release_packet(&self, packet: PacketBuf);

    fn local_address(&self) -> SocketAddr;

    fn parse_address(&self, raw: &str) -> anyhow::Result<SocketAddr>;

    fn format_address(&self, addr: SocketAddr) -> String;

    /// largest packet this driver can carry, including protocol headers
    fn max_payload(&self) -> usize;

    /// link speed in bits per second
    fn bandwidth_bps(&self) -> u64;
}
