use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Virtual nodes per peer. Fixed: trades distribution uniformity for a
/// constant memory overhead per peer.
const REPLICA: usize = 20;

#[derive(Debug)]
struct HashPeer {
    addr: String,
    down: AtomicBool,
}

#[derive(Debug)]
struct Ring {
    /// 32-bit virtual-node hash → owning peer. All `REPLICA` entries of one
    /// peer share the same `HashPeer`, so a down flag flip covers them all.
    vnodes: HashMap<u32, Arc<HashPeer>>,
    /// Ascending virtual-node hashes.
    sorted: Vec<u32>,
    /// Registered peer addresses.
    peers: HashMap<String, Arc<HashPeer>>,
}

/// Consistent-hash pool: a CRC32-IEEE ring with `REPLICA` virtual nodes per
/// peer. A request key maps to the first ring entry at or after its hash,
/// walking past down peers in ring order.
#[derive(Debug)]
pub struct ConsistentHashPool {
    ring: RwLock<Ring>,
    down_num: AtomicUsize,
}

fn vnode_hash(addr: &str, idx: usize) -> u32 {
    crc32fast::hash(format!("{}#{}", addr, idx).as_bytes())
}

impl ConsistentHashPool {
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(Ring {
                vnodes: HashMap::new(),
                sorted: Vec::new(),
                peers: HashMap::new(),
            }),
            down_num: AtomicUsize::new(0),
        }
    }

    pub fn from_addrs<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new();
        for addr in addrs {
            pool.add(&addr.into());
        }
        pool
    }

    /// Map `key` to a peer address, or `None` when the pool is empty or all
    /// peers are down. The up-front down count check guarantees the ring
    /// walk terminates.
    pub fn get(&self, key: &str) -> Option<String> {
        let ring = self.ring.read().unwrap();
        let size = ring.peers.len();
        if size == 0 || self.down_num.load(Ordering::Acquire) >= size {
            return None;
        }

        let h = crc32fast::hash(key.as_bytes());
        let start = ring.sorted.partition_point(|&v| v < h);
        let len = ring.sorted.len();
        for step in 0..len {
            let hash = ring.sorted[(start + step) % len];
            let peer = &ring.vnodes[&hash];
            if !peer.down.load(Ordering::Acquire) {
                return Some(peer.addr.clone());
            }
        }
        None
    }

    /// Register a peer and its virtual nodes. Idempotent on address; empty
    /// addresses are ignored.
    pub fn add(&self, addr: &str) {
        if addr.is_empty() {
            return;
        }
        let mut ring = self.ring.write().unwrap();
        if ring.peers.contains_key(addr) {
            return;
        }

        let peer = Arc::new(HashPeer {
            addr: addr.to_string(),
            down: AtomicBool::new(false),
        });
        for i in 0..REPLICA {
            let h = vnode_hash(addr, i);
            ring.vnodes.insert(h, peer.clone());
            ring.sorted.push(h);
        }
        ring.sorted.sort_unstable();
        ring.peers.insert(addr.to_string(), peer);
    }

    /// Drop a peer and all of its virtual nodes. No-op on unknown address.
    pub fn remove(&self, addr: &str) {
        let mut ring = self.ring.write().unwrap();
        let Some(peer) = ring.peers.remove(addr) else {
            return;
        };
        let Ring { vnodes, sorted, .. } = &mut *ring;
        for i in 0..REPLICA {
            vnodes.remove(&vnode_hash(addr, i));
        }
        sorted.retain(|h| vnodes.contains_key(h));
        if peer.down.load(Ordering::Acquire) {
            self.down_num.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn down_peer(&self, addr: &str) {
        let ring = self.ring.read().unwrap();
        if let Some(peer) = ring.peers.get(addr) {
            if !peer.down.swap(true, Ordering::AcqRel) {
                self.down_num.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn up_peer(&self, addr: &str) {
        let ring = self.ring.read().unwrap();
        if let Some(peer) = ring.peers.get(addr) {
            if peer.down.swap(false, Ordering::AcqRel) {
                self.down_num.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Registered peer count: by construction `sorted.len() / REPLICA`.
    pub fn size(&self) -> usize {
        self.ring.read().unwrap().sorted.len() / REPLICA
    }

    pub fn addrs(&self) -> Vec<String> {
        self.ring.read().unwrap().peers.keys().cloned().collect()
    }
}

impl Default for ConsistentHashPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConsistentHashPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut addrs = self.addrs();
        addrs.sort();
        write!(f, "{}", addrs.join(","))
    }
}
