//! In-memory packet fabric for tests and examples: several endpoints
//!  exchange packets through shared queues, with deterministic, seeded
//!  loss / duplication / reordering so failure handling can be exercised
//!  without a real network.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::buffers::{PacketBuf, PacketPool};
use crate::driver::PacketDriver;

/// Fault model of the fabric. Probabilities are evaluated per packet with a
///  seeded RNG, so a given seed always produces the same schedule.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    pub loss_probability: f64,
    pub duplicate_probability: f64,
    pub reorder_probability: f64,
    pub seed: u64,
    /// packet size the fabric carries; doubles as the drivers' `max_payload`
    pub max_payload: usize,
    pub bandwidth_bps: u64,
}

impl FabricConfig {
    pub fn reliable() -> FabricConfig {
        FabricConfig {
            loss_probability: 0.0,
            duplicate_probability: 0.0,
            reorder_probability: 0.0,
            seed: 0,
            max_payload: 1500,
            bandwidth_bps: 10_000_000_000,
        }
    }

    pub fn lossy(seed: u64, loss_probability: f64) -> FabricConfig {
        FabricConfig {
            loss_probability,
            seed,
            ..FabricConfig::reliable()
        }
    }
}

struct FabricState {
    queues: FxHashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    rng: StdRng,
    partitioned: bool,
    packets_sent: u64,
    packets_dropped: u64,
}

struct FabricShared {
    config: FabricConfig,
    state: Mutex<FabricState>,
}

/// The shared medium. Create one fabric, then one endpoint per transport.
///  Cloning yields another handle to the same fabric.
#[derive(Clone)]
pub struct InMemoryFabric {
    shared: Arc<FabricShared>,
}

impl InMemoryFabric {
    pub fn new(config: FabricConfig) -> InMemoryFabric {
        let rng = StdRng::seed_from_u64(config.seed);
        InMemoryFabric {
            shared: Arc::new(FabricShared {
                config,
                state: Mutex::new(FabricState {
                    queues: FxHashMap::default(),
                    rng,
                    partitioned: false,
                    packets_sent: 0,
                    packets_dropped: 0,
                }),
            }),
        }
    }

    /// register an endpoint address and return a driver bound to it
    pub fn add_endpoint(&self, addr: SocketAddr, pool_size: usize) -> Arc<FabricDriver> {
        let mut state = self.shared.state.lock().unwrap();
        let previous = state.queues.insert(addr, VecDeque::new());
        assert!(previous.is_none(), "endpoint {:?} registered twice", addr);

        Arc::new(FabricDriver {
            fabric: self.clone(),
            addr,
            pool: PacketPool::new(self.shared.config.max_payload, pool_size),
        })
    }

    pub fn packets_dropped(&self) -> u64 {
        self.shared.state.lock().unwrap().packets_dropped
    }

    pub fn packets_sent(&self) -> u64 {
        self.shared.state.lock().unwrap().packets_sent
    }

    /// drop all traffic from now on (and everything in flight), simulating
    ///  a dead segment between the endpoints
    pub fn set_partitioned(&self, partitioned: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.partitioned = partitioned;
        if partitioned {
            for queue in state.queues.values_mut() {
                queue.clear();
            }
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().unwrap();
        state.packets_sent += 1;

        if state.partitioned {
            state.packets_dropped += 1;
            return;
        }

        if state.rng.gen_bool(config.loss_probability) {
            trace!("fabric: dropping packet {:?} -> {:?}", from, to);
            state.packets_dropped += 1;
            return;
        }

        let copies = if config.duplicate_probability > 0.0
            && state.rng.gen_bool(config.duplicate_probability) { 2 } else { 1 };
        let reorder = config.reorder_probability > 0.0
            && state.rng.gen_bool(config.reorder_probability);

        let queue = match state.queues.get_mut(&to) {
            Some(queue) => queue,
            None => {
                trace!("fabric: no endpoint {:?}, dropping", to);
                return;
            }
        };

        for _ in 0..copies {
            if reorder {
                queue.push_front((from, bytes.to_vec()));
            }
            else {
                queue.push_back((from, bytes.to_vec()));
            }
        }
    }

    fn drain(&self, addr: SocketAddr, max: usize, pool: &PacketPool, out: &mut Vec<(SocketAddr, PacketBuf)>) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let queue = state.queues.get_mut(&addr).expect("endpoint not registered");

        let mut drained = 0;
        while drained < max {
            let Some((from, bytes)) = queue.front() else { break };

            let Some(mut buf) = pool.get_from_pool() else {
                // receive back-pressure: the packet stays queued until the
                //  endpoint releases buffers
                break;
            };
            assert!(bytes.len() <= buf.capacity(), "fabric packet exceeds driver MTU");
            bytes::BufMut::put_slice(&mut buf, bytes);
            out.push((*from, buf));

            queue.pop_front();
            drained += 1;
        }
        drained
    }
}

/// One endpoint's view of the fabric, implementing [`PacketDriver`].
pub struct FabricDriver {
    fabric: InMemoryFabric,
    addr: SocketAddr,
    pool: PacketPool,
}

impl FabricDriver {
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }
}

impl PacketDriver for FabricDriver {
    fn alloc_packet(&self) -> Option<PacketBuf> {
        self.pool.get_from_pool()
    }

    fn send_packet(&self, to: SocketAddr, packet: &[u8]) {
        self.fabric.deliver(self.addr, to, packet);
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<(SocketAddr, PacketBuf)>) -> usize {
        self.fabric.drain(self.addr, max, &self.pool, out)
    }

    fn release_packet(&self, packet: PacketBuf) {
        self.pool.return_to_pool(packet);
    }

    fn local_address(&self) -> SocketAddr {
        self.addr
    }

    fn parse_address(&self, raw: &str) -> anyhow::Result<SocketAddr> {
        Ok(raw.parse()?)
    }

    fn format_address(&self, addr: SocketAddr) -> String {
        addr.to_string()
    }

    fn max_payload(&self) -> usize {
        self.fabric.shared.config.max_payload
    }

    fn bandwidth_bps(&self) -> u64 {
        self.fabric.shared.config.bandwidth_bps
    }
}
