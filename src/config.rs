use std::time::Duration;

use anyhow::bail;

use crate::wire::PacketHeader;

/// Configuration for a transport instance.
///
/// The defaults describe a typical 10Gb/s datacenter link; embedders are
///  expected to start from [`HomaConfig::default_10g`] and adjust.
#[derive(Clone, Debug)]
pub struct HomaConfig {
    /// Link speed the pacing math assumes. Together with `rtt` this sizes
    ///  the unscheduled window and the grant window: one round-trip worth of
    ///  bytes must be in flight to keep the link busy.
    pub link_bandwidth_bps: u64,

    /// The packet size this transport assumes end-to-end, including the DATA
    ///  header. The driver's `max_payload` must be at least this large.
    ///
    /// Choosing this value too big causes packets to be dropped by the
    ///  fabric, which may be partial if only some routes support smaller
    ///  frames. Choosing it too small wastes bandwidth.
    pub mtu: usize,

    /// Round-trip time the pacing math assumes. There is no measurement or
    ///  discovery; datacenter RTTs are stable enough to configure.
    pub rtt: Duration,

    /// Number of priority tiers the fabric exposes. Homa wants at least 8.
    pub priority_levels: u8,

    /// Override for the derived unscheduled window (`rtt` x bandwidth).
    pub unscheduled_bytes: Option<u32>,

    /// Number of distinct senders that are simultaneously granted scheduled
    ///  bytes. 1 gives pure SRPT; larger values mask the grant RTT at the
    ///  cost of buffer occupancy.
    pub active_grant_slots: usize,

    /// Silence interval after which the receiver requests a retransmission.
    pub resend_timeout: Duration,
    /// Silence interval after which the sender probes the receiver.
    pub ping_timeout: Duration,
    /// Consecutive unanswered pings before an outbound message fails.
    pub ping_limit: u32,
    /// Consecutive unanswered resend requests before an inbound message fails.
    pub resend_limit: u32,

    /// Maximum ingress packets drained from the driver per poll tick.
    pub poll_ingress_budget: usize,
    /// Maximum DATA packets emitted per poll tick.
    pub poll_send_budget: usize,
}

impl HomaConfig {
    /// 10Gb/s link, full Ethernet frames, 8us RTT. The derived unscheduled
    ///  window is 10_000 bytes, i.e. roughly 7 full packets.
    pub fn default_10g() -> HomaConfig {
        HomaConfig {
            link_bandwidth_bps: 10_000_000_000,
            mtu: 1500,
            rtt: Duration::from_micros(8),
            priority_levels: 8,
            unscheduled_bytes: None,
            active_grant_slots: 4,
            resend_timeout: Duration::from_micros(100),
            ping_timeout: Duration::from_millis(1),
            ping_limit: 5,
            resend_limit: 5,
            poll_ingress_budget: 32,
            poll_send_budget: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= PacketHeader::DATA_HEADER_LEN {
            bail!("mtu of {} leaves no room for payload", self.mtu);
        }
        if self.link_bandwidth_bps == 0 {
            bail!("link bandwidth must be non-zero");
        }
        if self.priority_levels < 8 {
            bail!("at least 8 priority levels are required, configured {}", self.priority_levels);
        }
        if self.active_grant_slots == 0 {
            bail!("at least one active grant slot is required");
        }
        if self.ping_limit == 0 || self.resend_limit == 0 {
            bail!("ping and resend limits must be non-zero");
        }
        if self.poll_ingress_budget == 0 || self.poll_send_budget == 0 {
            bail!("poll budgets must be non-zero");
        }
        Ok(())
    }

    /// payload bytes per DATA packet, i.e. per message chunk
    pub fn chunk_payload(&self) -> usize {
        self.mtu - PacketHeader::DATA_HEADER_LEN
    }

    /// bytes the link carries in one round trip
    pub fn rtt_bytes(&self) -> u32 {
        let bits = self.link_bandwidth_bps as u128 * self.rtt.as_nanos() / 1_000_000_000;
        let bytes = bits / 8;
        bytes.min(u32::MAX as u128) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(HomaConfig::default_10g().validate().is_ok());
    }

    #[test]
    fn test_derived_values() {
        let config = HomaConfig::default_10g();
        assert_eq!(config.chunk_payload(), 1467);
        assert_eq!(config.rtt_bytes(), 10_000);
    }

    #[rstest]
    #[case::tiny_mtu(|c: &mut HomaConfig| c.mtu = 33)]
    #[case::zero_bandwidth(|c: &mut HomaConfig| c.link_bandwidth_bps = 0)]
    #[case::few_priorities(|c: &mut HomaConfig| c.priority_levels = 4)]
    #[case::no_grant_slots(|c: &mut HomaConfig| c.active_grant_slots = 0)]
    #[case::no_ping_limit(|c: &mut HomaConfig| c.ping_limit = 0)]
    #[case::no_resend_limit(|c: &mut HomaConfig| c.resend_limit = 0)]
    #[case::no_ingress_budget(|c: &mut HomaConfig| c.poll_ingress_budget = 0)]
    #[case::no_send_budget(|c: &mut HomaConfig| c.poll_send_budget = 0)]
    fn test_validate_rejects(#[case] tweak: fn(&mut HomaConfig)) {
        let mut config = HomaConfig::default_10g();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }
}
