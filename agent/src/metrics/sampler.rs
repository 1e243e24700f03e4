//! System metric sampling for the periodic `metrics` frame.
//!
//! On Linux everything comes from `/proc` plus one `df -Pk /` call; CPU
//! usage is a delta between consecutive `/proc/stat` snapshots, so the
//! first sample reports 0%. Other platforms return a zeroed snapshot
//! rather than failing the collector.

use sentinel_core::frames::MetricsPayload;

/// Cumulative CPU time counters from the aggregate `cpu` line of
/// `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub busy: u64,
    pub idle: u64,
}

impl CpuCounters {
    fn total(&self) -> u64 {
        self.busy + self.idle
    }
}

/// Stateful sampler holding the previous CPU and network counters.
pub struct Sampler {
    prev_cpu: Option<CpuCounters>,
}

impl Sampler {
    pub fn new() -> Self {
        Self { prev_cpu: None }
    }

    /// Take one snapshot of the host.
    #[cfg(target_os = "linux")]
    pub fn sample(&mut self) -> MetricsPayload {
        let mut payload = MetricsPayload::default();

        if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
            if let Some(current) = stat.lines().next().and_then(parse_cpu_line) {
                if let Some(prev) = self.prev_cpu {
                    payload.cpu_percent = cpu_percent_from_delta(prev, current);
                }
                self.prev_cpu = Some(current);
            }
        }

        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            if let Some((total_kb, available_kb)) = parse_meminfo(&meminfo) {
                let used_kb = total_kb.saturating_sub(available_kb);
                payload.memory_used_bytes = used_kb * 1024;
                payload.memory_available_bytes = available_kb * 1024;
                if total_kb > 0 {
                    payload.memory_percent = used_kb as f64 / total_kb as f64 * 100.0;
                }
            }
        }

        if let Ok(uptime) = std::fs::read_to_string("/proc/uptime") {
            payload.uptime_secs = parse_uptime(&uptime).unwrap_or(0);
        }

        if let Ok(net) = std::fs::read_to_string("/proc/net/dev") {
            let (rx, tx) = parse_net_dev(&net);
            payload.network_rx_bytes = rx;
            payload.network_tx_bytes = tx;
        }

        payload.process_count = count_processes();

        if let Ok(output) = std::process::Command::new("df").args(["-Pk", "/"]).output() {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Some((total_kb, used_kb)) = parse_df_output(&text) {
                    payload.disk_total_bytes = total_kb * 1024;
                    payload.disk_used_bytes = used_kb * 1024;
                    if total_kb > 0 {
                        payload.disk_percent = used_kb as f64 / total_kb as f64 * 100.0;
                    }
                }
            }
        }

        payload
    }

    #[cfg(not(target_os = "linux"))]
    pub fn sample(&mut self) -> MetricsPayload {
        // Unsupported host: report an empty snapshot instead of erroring.
        let _ = &self.prev_cpu;
        MetricsPayload::default()
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the aggregate `cpu` line: `cpu user nice system idle iowait ...`.
/// Idle time is idle + iowait; everything else counts as busy.
pub fn parse_cpu_line(line: &str) -> Option<CpuCounters> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = parts.filter_map(|s| s.parse().ok()).collect();
    if values.len() < 5 {
        return None;
    }
    let idle = values[3] + values[4];
    let busy: u64 = values.iter().sum::<u64>() - idle;
    Some(CpuCounters { busy, idle })
}

/// CPU usage over the interval between two snapshots, 0..=100.
pub fn cpu_percent_from_delta(prev: CpuCounters, current: CpuCounters) -> f64 {
    let total_delta = current.total().saturating_sub(prev.total());
    if total_delta == 0 {
        return 0.0;
    }
    let busy_delta = current.busy.saturating_sub(prev.busy);
    busy_delta as f64 / total_delta as f64 * 100.0
}

/// `MemTotal` and `MemAvailable` in KiB from `/proc/meminfo`.
pub fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next()?.parse().ok();
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    Some((total?, available?))
}

/// Whole seconds of uptime from `/proc/uptime`.
pub fn parse_uptime(text: &str) -> Option<u64> {
    text.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|secs| secs as u64)
}

/// Cumulative (rx, tx) bytes summed over physical interfaces from
/// `/proc/net/dev`; the loopback interface is excluded.
pub fn parse_net_dev(text: &str) -> (u64, u64) {
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        // Field 0 is rx bytes, field 8 is tx bytes.
        if fields.len() > 8 {
            rx_total += fields[0];
            tx_total += fields[8];
        }
    }
    (rx_total, tx_total)
}

/// `(total_kb, used_kb)` for the root filesystem from `df -Pk /` output.
pub fn parse_df_output(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total = fields.get(1)?.parse().ok()?;
    let used = fields.get(2)?.parse().ok()?;
    Some((total, used))
}

/// Running process count: numeric directories in `/proc`.
#[cfg(target_os = "linux")]
fn count_processes() -> u32 {
    std::fs::read_dir("/proc")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .chars()
                        .all(|c| c.is_ascii_digit())
                })
                .count() as u32
        })
        .unwrap_or(0)
}
