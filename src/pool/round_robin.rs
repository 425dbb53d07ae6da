use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A weighted backend peer.
///
/// `weight` is fixed at insertion. The selection pass mutates
/// `current_weight` / `effective_weight` under the per-peer lock while the
/// pool itself is only read-locked, so concurrent `get` calls stay cheap.
pub struct Peer {
    addr: String,
    weight: i64,
    state: Mutex<WeightState>,
    down: AtomicBool,
}

struct WeightState {
    effective_weight: i64,
    current_weight: i64,
}

impl Peer {
    fn new(addr: String, weight: i64) -> Self {
        Self {
            addr,
            weight,
            state: Mutex::new(WeightState {
                effective_weight: weight,
                current_weight: 0,
            }),
            down: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        write!(
            f,
            "{}: (w={}, ew={}, cw={})",
            self.addr, self.weight, state.effective_weight, state.current_weight
        )
    }
}

/// Smooth weighted round-robin pool.
///
/// For weights {5, 1, 1} the selection order is `a,a,b,a,c,a,a` rather than
/// the bursty `c,b,a,a,a,a,a` of naive weighted rotation. The algorithm
/// follows nginx's smooth variant: every pass adds `effective_weight` to each
/// candidate's `current_weight`, picks the largest, and subtracts the weight
/// total from the winner.
#[derive(Debug)]
pub struct RoundRobinPool {
    peers: RwLock<Vec<Arc<Peer>>>,
    /// Cursor for the weight-blind `equal_get` rotation.
    cursor: AtomicU64,
    down_num: AtomicUsize,
}

impl RoundRobinPool {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(0),
            down_num: AtomicUsize::new(0),
        }
    }

    /// Build a pool from `(address, weight)` pairs, keeping insertion order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let pool = Self::new();
        for (addr, weight) in pairs {
            pool.add(&addr.into(), weight);
        }
        pool
    }

    /// Select the next peer address, or `None` when the pool is empty or
    /// every peer is down.
    pub fn get(&self) -> Option<String> {
        let peers = self.peers.read().unwrap();

        let mut total: i64 = 0;
        let mut best: Option<(&Arc<Peer>, i64)> = None;

        for peer in peers.iter() {
            if peer.down.load(Ordering::Acquire) {
                continue;
            }
            let mut state = peer.state.lock().unwrap();

            total += state.effective_weight;
            state.current_weight += state.effective_weight;

            // Recovery clamp for a previously demoted effective_weight.
            // Nothing demotes it today, but the invariant ew <= w must hold.
            if state.effective_weight < peer.weight {
                state.effective_weight += 1;
            }

            // First peer in insertion order wins ties.
            if best.map_or(true, |(_, cw)| cw < state.current_weight) {
                best = Some((peer, state.current_weight));
            }
        }

        let (winner, _) = best?;
        winner.state.lock().unwrap().current_weight -= total;
        Some(winner.addr.clone())
    }

    /// Weight-blind rotation: each call advances an atomic cursor and returns
    /// the peer at `cursor % size`, scanning past down peers. The cursor
    /// wraps from `u64::MAX` back to 0.
    pub fn equal_get(&self) -> Option<String> {
        let peers = self.peers.read().unwrap();
        let size = peers.len();
        if size == 0 || self.down_num.load(Ordering::Acquire) >= size {
            return None;
        }

        let old = self.cursor.fetch_add(1, Ordering::AcqRel);
        let start = (old % size as u64) as usize;
        for i in 0..size {
            let peer = &peers[(start + i) % size];
            if !peer.down.load(Ordering::Acquire) {
                return Some(peer.addr.clone());
            }
        }
        None
    }

    /// Insert a peer. No-op for an empty address or a duplicate; a
    /// non-positive weight defaults to 1.
    pub fn add(&self, addr: &str, weight: u32) {
        if addr.is_empty() {
            return;
        }
        let weight = i64::from(weight.max(1));

        let mut peers = self.peers.write().unwrap();
        if peers.iter().any(|p| p.addr == addr) {
            return;
        }
        peers.push(Arc::new(Peer::new(addr.to_string(), weight)));
    }

    /// Remove a peer. No-op for an unknown address.
    pub fn remove(&self, addr: &str) {
        let mut peers = self.peers.write().unwrap();
        if let Some(idx) = peers.iter().position(|p| p.addr == addr) {
            let peer = peers.remove(idx);
            if peer.down.load(Ordering::Acquire) {
                self.down_num.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub fn down_peer(&self, addr: &str) {
        let peers = self.peers.read().unwrap();
        if let Some(peer) = peers.iter().find(|p| p.addr == addr) {
            if !peer.down.swap(true, Ordering::AcqRel) {
                self.down_num.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn up_peer(&self, addr: &str) {
        let peers = self.peers.read().unwrap();
        if let Some(peer) = peers.iter().find(|p| p.addr == addr) {
            if peer.down.swap(false, Ordering::AcqRel) {
                self.down_num.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub fn size(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn addrs(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .map(|p| p.addr.clone())
            .collect()
    }

    #[cfg(test)]
    fn set_cursor(&self, value: u64) {
        self.cursor.store(value, Ordering::Release);
    }

    #[cfg(test)]
    fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }
}

impl Default for RoundRobinPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RoundRobinPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut addrs = self.addrs();
        addrs.sort();
        write!(f, "{}", addrs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn collect(pool: &RoundRobinPool, n: usize) -> String {
        (0..n)
            .map(|_| pool.get().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",")
    }

    #[test]
    fn test_smooth_order_different_weights() {
        let pool = RoundRobinPool::from_pairs([("a", 5), ("b", 1), ("c", 1)]);
        assert_eq!(collect(&pool, 7), "a,a,b,a,c,a,a");
    }

    #[test]
    fn test_rotation_equal_weights() {
        let pool = RoundRobinPool::from_pairs([("a", 1), ("b", 1), ("c", 1)]);
        assert_eq!(collect(&pool, 6), "a,b,c,a,b,c");

        let pool = RoundRobinPool::from_pairs([("a", 2), ("b", 2), ("c", 2)]);
        assert_eq!(collect(&pool, 6), "a,b,c,a,b,c");
    }

    #[test]
    fn test_aggregate_fairness() {
        let pool = RoundRobinPool::from_pairs([("a", 5), ("b", 3), ("c", 1)]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 * 4 {
            *counts.entry(pool.get().unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 20);
        assert_eq!(counts["b"], 12);
        assert_eq!(counts["c"], 4);
    }

    #[test]
    fn test_no_consecutive_repeat_with_alternative() {
        let pool = RoundRobinPool::from_pairs([("a", 2), ("b", 1)]);
        let mut prev = String::new();
        let mut repeats = 0;
        for _ in 0..30 {
            let cur = pool.get().unwrap();
            if cur == prev && cur == "b" {
                repeats += 1;
            }
            prev = cur;
        }
        assert_eq!(repeats, 0);
    }

    #[test]
    fn test_down_peer_skipped() {
        let pool = RoundRobinPool::from_pairs([("a", 1), ("b", 1)]);
        pool.down_peer("a");
        for _ in 0..4 {
            assert_eq!(pool.get().as_deref(), Some("b"));
        }
        pool.up_peer("a");
        let mut seen: Vec<String> = (0..2).map(|_| pool.get().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, ["a", "b"]);
    }

    #[test]
    fn test_all_down_returns_none() {
        let pool = RoundRobinPool::from_pairs([("a", 1), ("b", 1)]);
        pool.down_peer("a");
        pool.down_peer("b");
        assert_eq!(pool.get(), None);
        assert_eq!(pool.equal_get(), None);
    }

    #[test]
    fn test_equal_get_rotation_ignores_weight() {
        let pool = RoundRobinPool::from_pairs([("a", 5), ("b", 3), ("c", 1)]);
        let order: Vec<String> = (0..6).map(|_| pool.equal_get().unwrap()).collect();
        assert_eq!(order.join(","), "a,b,c,a,b,c");
    }

    #[test]
    fn test_equal_get_cursor_wrap() {
        let pool = RoundRobinPool::from_pairs([("a", 1), ("b", 1), ("c", 1)]);
        pool.set_cursor(u64::MAX);
        assert_eq!(pool.equal_get().as_deref(), Some("a"));
        assert_eq!(pool.cursor(), 0);
    }

    #[test]
    fn test_equal_get_skips_down() {
        let pool = RoundRobinPool::from_pairs([("a", 1), ("b", 1), ("c", 1)]);
        pool.down_peer("b");
        let order: Vec<String> = (0..4).map(|_| pool.equal_get().unwrap()).collect();
        assert_eq!(order.join(","), "a,c,c,a");
    }

    #[test]
    fn test_add_dedup_and_defaults() {
        let pool = RoundRobinPool::new();
        pool.add("", 1);
        assert_eq!(pool.size(), 0);

        pool.add("a", 0);
        assert_eq!(pool.size(), 1);
        pool.add("a", 3);
        assert_eq!(pool.size(), 1);

        // weight 0 defaulted to 1: strict rotation with another weight-1 peer
        pool.add("b", 1);
        assert_eq!(collect(&pool, 4), "a,b,a,b");
    }

    #[test]
    fn test_remove_unknown_and_down_accounting() {
        let pool = RoundRobinPool::from_pairs([("a", 1), ("b", 1)]);
        pool.remove("nope");
        assert_eq!(pool.size(), 2);

        pool.down_peer("a");
        pool.remove("a");
        assert_eq!(pool.size(), 1);
        // down_num was decremented along with the removal
        assert_eq!(pool.get().as_deref(), Some("b"));
    }

    #[test]
    fn test_empty_pool() {
        let pool = RoundRobinPool::new();
        assert_eq!(pool.get(), None);
        assert_eq!(pool.equal_get(), None);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_display_sorted() {
        let pool = RoundRobinPool::from_pairs([("b", 1), ("a", 1)]);
        assert_eq!(pool.to_string(), "a,b");
    }
}
