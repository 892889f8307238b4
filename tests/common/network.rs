//! A "mock" (totally local) controllable network for passing around XPaxos RPCs.
//!
//! Calls are dispatched synchronously on the caller's thread, which reproduces the
//! call/reply shape of a real transport: the caller suspends until the handler
//! returns or the network decides the call was lost. The knobs mirror what the test
//! scenarios need:
//!
//! - a per-server *fault rate*: the probability that a call to (or a reply destined
//!   for) that server is dropped after a Δ delay,
//! - `reliable(false)`: short random delays plus a 10% drop rate on every message,
//! - `long_delays` / `long_reordering` for calls to missing servers and for reply
//!   delivery respectively,
//! - a per-server count of incoming RPCs.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use xpaxos::messages::Reply;
use xpaxos::networking::{Rpc, Service, Transport};
use xpaxos::types::ReplicaId;

#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetInner>,
}

struct NetInner {
    delta: Duration,
    reliable: AtomicBool,
    long_delays: AtomicBool,
    long_reordering: AtomicBool,
    fault_rate: Mutex<HashMap<ReplicaId, u32>>,
    servers: Mutex<HashMap<ReplicaId, Arc<dyn Service>>>,
    counts: Mutex<HashMap<ReplicaId, u64>>,
}

impl SimNetwork {
    pub fn new(delta: Duration) -> SimNetwork {
        SimNetwork {
            inner: Arc::new(NetInner {
                delta,
                reliable: AtomicBool::new(true),
                long_delays: AtomicBool::new(false),
                long_reordering: AtomicBool::new(false),
                fault_rate: Mutex::new(HashMap::new()),
                servers: Mutex::new(HashMap::new()),
                counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn reliable(&self, yes: bool) {
        self.inner.reliable.store(yes, Ordering::Relaxed);
    }

    pub fn long_delays(&self, yes: bool) {
        self.inner.long_delays.store(yes, Ordering::Relaxed);
    }

    pub fn long_reordering(&self, yes: bool) {
        self.inner.long_reordering.store(yes, Ordering::Relaxed);
    }

    /// Make `percent` of the traffic touching `server` fail with a Δ delay.
    pub fn set_fault_rate(&self, server: ReplicaId, percent: u32) {
        self.inner
            .fault_rate
            .lock()
            .unwrap()
            .insert(server, percent);
    }

    pub fn add_server(&self, id: ReplicaId, service: Arc<dyn Service>) {
        self.inner.servers.lock().unwrap().insert(id, service);
    }

    pub fn remove_server(&self, id: ReplicaId) {
        self.inner.servers.lock().unwrap().remove(&id);
    }

    /// How many RPCs have reached `server` so far.
    pub fn rpc_count(&self, server: ReplicaId) -> u64 {
        *self.inner.counts.lock().unwrap().get(&server).unwrap_or(&0)
    }

    /// The sending handle for endpoint `owner`.
    pub fn endpoint(&self, owner: ReplicaId) -> SimEndpoint {
        SimEndpoint {
            owner,
            net: self.clone(),
        }
    }

    fn fault_rate(&self, id: ReplicaId) -> u32 {
        *self.inner.fault_rate.lock().unwrap().get(&id).unwrap_or(&0)
    }

    fn process(&self, caller: ReplicaId, target: ReplicaId, rpc: Rpc) -> Option<Reply> {
        let server = self.inner.servers.lock().unwrap().get(&target).cloned();

        let Some(service) = server else {
            // Simulate no reply and an eventual timeout.
            let ms = if self.inner.long_delays.load(Ordering::Relaxed) {
                rand::thread_rng().gen_range(0..7000)
            } else {
                rand::thread_rng().gen_range(0..100)
            };
            thread::sleep(Duration::from_millis(ms));
            return None;
        };

        let reliable = self.inner.reliable.load(Ordering::Relaxed);
        if !reliable {
            let ms = rand::thread_rng().gen_range(0..27);
            thread::sleep(Duration::from_millis(ms));
            if rand::thread_rng().gen_range(0..1000) < 100 {
                // Drop the request and return as if timed out.
                return None;
            }
        }

        // Failure on the way to the destination.
        if rand::thread_rng().gen_range(0..100) < self.fault_rate(target) {
            log::debug!("network: dropped {} from {} to {}", rpc.method(), caller, target);
            thread::sleep(self.inner.delta);
            return None;
        }

        *self.inner.counts.lock().unwrap().entry(target).or_insert(0) += 1;
        let reply = service.handle(rpc);

        // Failure on the way back to the caller.
        if rand::thread_rng().gen_range(0..100) < self.fault_rate(caller) {
            thread::sleep(self.inner.delta);
            return None;
        }

        if !reliable && rand::thread_rng().gen_range(0..1000) < 100 {
            // Drop the reply and return as if timed out.
            return None;
        }

        if self.inner.long_reordering.load(Ordering::Relaxed)
            && rand::thread_rng().gen_range(0..900) < 600
        {
            let upper = 1 + rand::thread_rng().gen_range(0..2000);
            let ms = 200 + rand::thread_rng().gen_range(0..upper);
            thread::sleep(Duration::from_millis(ms));
        }

        Some(reply)
    }
}

/// One endpoint's view of the [`SimNetwork`].
#[derive(Clone)]
pub struct SimEndpoint {
    owner: ReplicaId,
    net: SimNetwork,
}

impl Transport for SimEndpoint {
    fn call(&self, target: ReplicaId, rpc: Rpc) -> Option<Reply> {
        self.net.process(self.owner, target, rpc)
    }
}
