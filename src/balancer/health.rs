use crate::pool::Pool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Passive health tracking for one virtual server.
///
/// The pool only knows up/down; this tracker owns the why (consecutive
/// 5xx counts and ejection timestamps) so a future active prober could
/// drive the same pool transitions without touching these counters.
#[derive(Debug)]
pub struct HealthTracker {
    vs: String,
    max_fails: u32,
    fail_timeout: Duration,
    state: Mutex<HealthState>,
}

#[derive(Debug)]
struct HealthState {
    fails: HashMap<String, u32>,
    ejected_at: HashMap<String, Instant>,
}

impl HealthTracker {
    pub fn new(vs: &str, max_fails: u32, fail_timeout: Duration) -> Self {
        Self {
            vs: vs.to_string(),
            max_fails,
            fail_timeout,
            state: Mutex::new(HealthState {
                fails: HashMap::new(),
                ejected_at: HashMap::new(),
            }),
        }
    }

    /// Count one 5xx response from `addr`. Crossing `max_fails` ejects the
    /// peer exactly once per window; further failures keep accumulating but
    /// do not re-arm the ejection timestamp.
    pub fn record_failure(&self, pool: &Pool, addr: &str) {
        let mut state = self.state.lock().unwrap();
        let count = state.fails.entry(addr.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.max_fails && !state.ejected_at.contains_key(addr) {
            pool.down_peer(addr);
            state.ejected_at.insert(addr.to_string(), Instant::now());
            metrics::counter!(
                "lb_peer_ejections_total",
                "vs" => self.vs.clone(),
                "peer" => addr.to_string(),
            )
            .increment(1);
            warn!(
                "health: peer ejected, vs={}, peer={}, fails={}",
                self.vs, addr, count
            );
        }
    }

    /// Re-admit peers whose ejection window has expired. Invoked on every
    /// request before selection.
    pub fn sweep(&self, pool: &Pool) {
        let mut state = self.state.lock().unwrap();
        if state.ejected_at.is_empty() {
            return;
        }

        let now = Instant::now();
        let expired: Vec<String> = state
            .ejected_at
            .iter()
            .filter(|(addr, t0)| {
                state.fails.get(*addr).copied().unwrap_or(0) >= self.max_fails
                    && now.duration_since(**t0) >= self.fail_timeout
            })
            .map(|(addr, _)| addr.clone())
            .collect();

        for addr in expired {
            pool.up_peer(&addr);
            state.fails.insert(addr.clone(), 0);
            state.ejected_at.remove(&addr);
            metrics::counter!(
                "lb_peer_recoveries_total",
                "vs" => self.vs.clone(),
                "peer" => addr.clone(),
            )
            .increment(1);
            info!("health: peer recovered, vs={}, peer={}", self.vs, addr);
        }
    }

    /// Purge all tracking for a removed peer.
    pub fn forget(&self, addr: &str) {
        let mut state = self.state.lock().unwrap();
        state.fails.remove(addr);
        state.ejected_at.remove(addr);
    }

    pub fn fail_count(&self, addr: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .fails
            .get(addr)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_ejected(&self, addr: &str) -> bool {
        self.state.lock().unwrap().ejected_at.contains_key(addr)
    }
}
