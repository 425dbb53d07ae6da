use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Mutex;

/// Synthetic stats entry for requests that never reached a peer
/// (host mismatch, empty pool).
pub const LB_ERROR_ADDR: &str = "Load Balancer Error";

/// Per-virtual-server request statistics, keyed by peer address.
#[derive(Debug)]
pub struct Stats {
    vs: String,
    peers: Mutex<HashMap<String, PeerStats>>,
}

#[derive(Default, Debug)]
struct PeerStats {
    status_code: BTreeMap<String, u64>,
    method: BTreeMap<String, u64>,
    path: BTreeMap<String, u64>,
    recv_bytes: u64,
    send_bytes: u64,
}

impl Stats {
    pub fn new(vs: &str) -> Self {
        Self {
            vs: vs.to_string(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record one finished request attempt against `addr`.
    pub fn record(&self, addr: &str, status: u16, method: &str, path: &str, recv_bytes: u64) {
        let mut buf = itoa::Buffer::new();
        let status = buf.format(status);

        let mut peers = self.peers.lock().unwrap();
        let entry = peers.entry(addr.to_string()).or_default();
        *entry.status_code.entry(status.to_string()).or_insert(0) += 1;
        *entry.method.entry(method.to_string()).or_insert(0) += 1;
        *entry.path.entry(path.to_string()).or_insert(0) += 1;
        entry.recv_bytes += recv_bytes;
    }

    /// Add response bytes streamed back to the client. Reported by the body
    /// interceptor once the stream finishes, so it lags `record` slightly.
    pub fn add_send_bytes(&self, addr: &str, n: u64) {
        let mut peers = self.peers.lock().unwrap();
        peers.entry(addr.to_string()).or_default().send_bytes += n;
    }

    /// Drop the entry for a removed peer.
    pub fn remove(&self, addr: &str) {
        self.peers.lock().unwrap().remove(addr);
    }

    pub fn has_entry(&self, addr: &str) -> bool {
        self.peers.lock().unwrap().contains_key(addr)
    }

    /// Deterministic text rendering: peers sorted by address, histogram keys
    /// in sorted order.
    pub fn render(&self) -> String {
        let peers = self.peers.lock().unwrap();
        let mut addrs: Vec<&String> = peers.keys().collect();
        addrs.sort();

        let mut out = format!("Pool-{}", self.vs);
        for addr in addrs {
            let stat = &peers[addr];
            let _ = write!(
                out,
                "\n{}\nstatus_code: {}\nmethod: {}\npath: {}\nrecv_bytes: {}\nsend_bytes: {}\n------",
                addr,
                render_histogram(&stat.status_code),
                render_histogram(&stat.method),
                render_histogram(&stat.path),
                stat.recv_bytes,
                stat.send_bytes,
            );
        }
        out
    }
}

fn render_histogram(hist: &BTreeMap<String, u64>) -> String {
    hist.iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
