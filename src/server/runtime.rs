/// Size the tokio worker pool from the container's CPU limit rather than the
/// host's core count. A pod limited to 2 cores on a 64-core node should not
/// spawn 64 workers.
///
/// Sources, in order: `STEELYARD_CPU_LIMIT` env var ("2" or "2000m"),
/// cgroup v2 `cpu.max`, cgroup v1 cfs quota/period, then host parallelism.
pub fn worker_threads() -> usize {
    if let Some(n) = std::env::var("STEELYARD_CPU_LIMIT")
        .ok()
        .as_deref()
        .and_then(parse_cpu_limit)
    {
        eprintln!("[runtime] worker threads from STEELYARD_CPU_LIMIT: {}", n);
        return n;
    }

    if let Some(n) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .as_deref()
        .and_then(parse_cgroup_v2)
    {
        eprintln!("[runtime] worker threads from cgroup v2: {}", n);
        return n;
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(n) = quota_to_cores(quota.trim(), period.trim()) {
            eprintln!("[runtime] worker threads from cgroup v1: {}", n);
            return n;
        }
    }

    let n = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] worker threads from host parallelism: {}", n);
    n
}

/// "2" means cores, "2500m" means millicores. Fractional limits round up so
/// a 500m pod still gets one worker.
fn parse_cpu_limit(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m.div_ceil(1000).max(1)),
        None => value.parse::<usize>().ok().map(|n| n.max(1)),
    }
}

/// cgroup v2 `cpu.max`: "<quota> <period>" or "max <period>" for unlimited.
fn parse_cgroup_v2(content: &str) -> Option<usize> {
    let mut fields = content.split_whitespace();
    let quota = fields.next()?;
    let period = fields.next()?;
    if quota == "max" {
        return None;
    }
    quota_to_cores(quota, period)
}

fn quota_to_cores(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(((quota + period - 1) / period) as usize)
}
