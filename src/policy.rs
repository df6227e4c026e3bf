//! Pure policy functions: how many bytes a sender may transmit without a
//!  grant, and which priority tier a message gets.
//!
//! Both sides use the same SRPT tiering so the fabric's priority queues see
//!  a consistent picture: fewer remaining bytes means a higher tier. Tiers
//!  coarsen SRPT by powers of two, so two messages within a factor of two
//!  of each other may share a tier.

use crate::config::HomaConfig;

/// Bytes a sender may transmit before the first GRANT arrives.
///
/// One round-trip worth of bytes keeps the link busy while the first grant
///  is in flight, and lets any message that fits into the window complete
///  in a single RTT.
pub fn unscheduled_limit(config: &HomaConfig, message_length: u32) -> u32 {
    let window = config.unscheduled_bytes.unwrap_or_else(|| config.rtt_bytes());
    message_length.min(window)
}

/// Priority tier for a message with `remaining` bytes left, in
///  `0..priority_levels`, numerically higher = more urgent.
///
/// A message that fits into a single packet gets the top tier; every
///  doubling of the remaining bytes costs one tier, saturating at tier 0.
pub fn priority(config: &HomaConfig, remaining: u32) -> u8 {
    let chunk = config.chunk_payload() as u32;
    let top = config.priority_levels - 1;

    if remaining <= chunk {
        return top;
    }

    // number of doublings of a single chunk needed to cover `remaining`
    let chunks = remaining.div_ceil(chunk);
    let doublings = 32 - (chunks - 1).leading_zeros();

    top.saturating_sub(doublings.min(u8::MAX as u32) as u8)
}
