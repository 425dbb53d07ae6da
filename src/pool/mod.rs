pub mod consistent_hash;
pub mod round_robin;

pub use consistent_hash::ConsistentHashPool;
pub use round_robin::RoundRobinPool;

/// Selection strategy. Parsed from the config's `lb_method` string by the
/// virtual-server constructor; unknown strings are rejected there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbMethod {
    RoundRobin,
    ConsistentHash,
}

impl LbMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "round-robin" => Some(Self::RoundRobin),
            "consistent-hash" => Some(Self::ConsistentHash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::ConsistentHash => "consistent-hash",
        }
    }
}

/// Enum-based pool, no trait objects and no dynamic dispatch. Both strategies
/// expose the same operation set; callers never care which one they hold.
#[derive(Debug)]
pub enum Pool {
    RoundRobin(RoundRobinPool),
    ConsistentHash(ConsistentHashPool),
}

impl Pool {
    /// Build a pool for the given method from `(address, weight)` pairs.
    /// Consistent hashing ignores weights.
    pub fn new<I, S>(method: LbMethod, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        match method {
            LbMethod::RoundRobin => Self::RoundRobin(RoundRobinPool::from_pairs(pairs)),
            LbMethod::ConsistentHash => Self::ConsistentHash(ConsistentHashPool::from_addrs(
                pairs.into_iter().map(|(addr, _)| addr),
            )),
        }
    }

    /// Select a peer address. `key` seeds the consistent-hash lookup and is
    /// ignored by round-robin.
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::RoundRobin(p) => p.get(),
            Self::ConsistentHash(p) => p.get(key),
        }
    }

    pub fn add(&self, addr: &str, weight: u32) {
        match self {
            Self::RoundRobin(p) => p.add(addr, weight),
            Self::ConsistentHash(p) => p.add(addr),
        }
    }

    pub fn remove(&self, addr: &str) {
        match self {
            Self::RoundRobin(p) => p.remove(addr),
            Self::ConsistentHash(p) => p.remove(addr),
        }
    }

    pub fn down_peer(&self, addr: &str) {
        match self {
            Self::RoundRobin(p) => p.down_peer(addr),
            Self::ConsistentHash(p) => p.down_peer(addr),
        }
    }

    pub fn up_peer(&self, addr: &str) {
        match self {
            Self::RoundRobin(p) => p.up_peer(addr),
            Self::ConsistentHash(p) => p.up_peer(addr),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::RoundRobin(p) => p.size(),
            Self::ConsistentHash(p) => p.size(),
        }
    }

    pub fn addrs(&self) -> Vec<String> {
        match self {
            Self::RoundRobin(p) => p.addrs(),
            Self::ConsistentHash(p) => p.addrs(),
        }
    }
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin(p) => p.fmt(f),
            Self::ConsistentHash(p) => p.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lb_method_parse() {
        assert_eq!(LbMethod::parse(""), Some(LbMethod::RoundRobin));
        assert_eq!(LbMethod::parse("round-robin"), Some(LbMethod::RoundRobin));
        assert_eq!(
            LbMethod::parse("consistent-hash"),
            Some(LbMethod::ConsistentHash)
        );
        assert_eq!(LbMethod::parse("hash"), None);
    }

    #[test]
    fn test_round_robin_ignores_key() {
        let pool = Pool::new(LbMethod::RoundRobin, [("a", 1), ("b", 1)]);
        assert_eq!(pool.get("whatever").as_deref(), Some("a"));
        assert_eq!(pool.get("other").as_deref(), Some("b"));
    }

    #[test]
    fn test_consistent_hash_key_affinity() {
        let pool = Pool::new(LbMethod::ConsistentHash, [("1.1.1.1", 1), ("2.2.2.2", 1)]);
        let first = pool.get("10.0.0.1:4242").unwrap();
        for _ in 0..5 {
            assert_eq!(pool.get("10.0.0.1:4242").unwrap(), first);
        }
    }

    #[test]
    fn test_shared_mutators() {
        for method in [LbMethod::RoundRobin, LbMethod::ConsistentHash] {
            let pool = Pool::new(method, [("a", 1)]);
            pool.add("b", 2);
            assert_eq!(pool.size(), 2);
            pool.down_peer("a");
            pool.down_peer("b");
            assert_eq!(pool.get("k"), None);
            pool.up_peer("b");
            assert_eq!(pool.get("k").as_deref(), Some("b"));
            pool.remove("a");
            pool.remove("b");
            assert_eq!(pool.size(), 0);
            assert_eq!(pool.to_string(), "");
        }
    }
}
