//! # CPU Monitor
//!
//! Per-process and system-wide CPU statistics with uniform semantics
//! across platforms, feeding the autoscaler and the alert log.
//!
//! - **Linux** reads `/proc/[pid]/stat` (utime/stime, fields 14/15) and
//!   `/proc/stat`, converting jiffies with the clock-tick rate discovered
//!   via `getconf CLK_TCK` at construction (one warning and 100 assumed
//!   when discovery fails). The process count is the number of numeric
//!   entries in `/proc`; load averages come from `/proc/loadavg`.
//! - **macOS** shells out to `ps -o pcpu=,time=` per process and
//!   `iostat -c 1 1` for the system view; `ps -A` supplies the count.
//! - **Windows** uses `wmic` process time counters (100 ns units),
//!   `wmic cpu get loadpercentage`, and a `tasklist` line count.
//! - **Anything else** returns zeros with a single logged warning.
//!
//! A first sample for a pid reports 0%; percentages need a previous
//! observation. Values are exponentially smoothed (α = 0.3 by default)
//! and the cluster aggregate mixes system (0.4) and worker-sum (0.6),
//! clamped to 0..100.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct CpuMonitorConfig {
    /// Exponential smoothing factor α in (0, 1]
    pub smoothing_factor: f64,
    /// Samples kept in the ring buffer
    pub history_size: usize,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for CpuMonitorConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.3,
            history_size: 100,
            warning_threshold: 75.0,
            critical_threshold: 90.0,
        }
    }
}

/// One process observation.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessCpuSample {
    pub pid: u32,
    /// 0..100
    pub usage: f64,
    pub user_time_ms: u64,
    pub system_time_ms: u64,
    pub total_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// One system observation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemCpuSample {
    /// 0..100
    pub overall: f64,
    pub per_core: Vec<f64>,
    /// 1/5/15-minute load averages, Unix only
    pub load_average: Option<(f64, f64, f64)>,
    pub process_count: usize,
}

/// One full monitor tick.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterCpuSnapshot {
    pub system: SystemCpuSample,
    pub workers: Vec<ProcessCpuSample>,
    /// 0.4·system + 0.6·worker-sum, clamped
    pub aggregate: f64,
    /// Exponentially smoothed aggregate
    pub smoothed: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct PrevProcess {
    total_time_ms: u64,
    at: Instant,
}

/// The monitor. One per supervisor (or worker when standalone).
pub struct CpuMonitor {
    config: CpuMonitorConfig,
    clock_ticks: u64,
    prev_process: Mutex<HashMap<u32, PrevProcess>>,
    prev_system: Mutex<Option<(u64, u64)>>,
    history: Mutex<VecDeque<ClusterCpuSnapshot>>,
    smoothed: Mutex<Option<f64>>,
    warned_platform: AtomicBool,
}

impl CpuMonitor {
    pub fn new(config: CpuMonitorConfig) -> Self {
        Self {
            config,
            clock_ticks: discover_clock_ticks(),
            prev_process: Mutex::new(HashMap::new()),
            prev_system: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            smoothed: Mutex::new(None),
            warned_platform: AtomicBool::new(false),
        }
    }

    /// Take one full sample for the given worker pids.
    pub async fn sample(&self, worker_pids: &[u32]) -> ClusterCpuSnapshot {
        let system = self.sample_system().await;
        let mut workers = Vec::with_capacity(worker_pids.len());
        for pid in worker_pids {
            workers.push(self.sample_process(*pid).await);
        }

        let aggregate = aggregate_usage(&system, &workers);
        let smoothed = {
            let mut smoothed = self.smoothed.lock();
            let next = match *smoothed {
                Some(previous) => smooth(previous, aggregate, self.config.smoothing_factor),
                None => aggregate,
            };
            *smoothed = Some(next);
            next
        };

        let snapshot = ClusterCpuSnapshot {
            system,
            workers,
            aggregate,
            smoothed,
            timestamp: Utc::now(),
        };
        self.check_alerts(&snapshot);

        let mut history = self.history.lock();
        if history.len() >= self.config.history_size {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    pub fn history(&self) -> Vec<ClusterCpuSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn last_smoothed(&self) -> Option<f64> {
        *self.smoothed.lock()
    }

    /// Compare the smoothed aggregate against the thresholds; alerts are
    /// logged, never thrown.
    fn check_alerts(&self, snapshot: &ClusterCpuSnapshot) {
        if snapshot.smoothed >= self.config.critical_threshold {
            tracing::error!(
                smoothed = snapshot.smoothed,
                threshold = self.config.critical_threshold,
                "cluster CPU critically high"
            );
        } else if snapshot.smoothed >= self.config.warning_threshold {
            tracing::warn!(
                smoothed = snapshot.smoothed,
                threshold = self.config.warning_threshold,
                "cluster CPU above warning threshold"
            );
        }
    }

    /// Sample one process; 0% on first observation.
    pub async fn sample_process(&self, pid: u32) -> ProcessCpuSample {
        let now = Instant::now();
        let (user_ms, system_ms) = self.process_times(pid).await.unwrap_or((0, 0));
        let total_ms = user_ms + system_ms;

        let usage = {
            let mut prev = self.prev_process.lock();
            let usage = match prev.get(&pid) {
                Some(previous) => {
                    let wall_ms = now.duration_since(previous.at).as_millis() as u64;
                    let cpu_delta = total_ms.saturating_sub(previous.total_time_ms);
                    if wall_ms == 0 {
                        0.0
                    } else {
                        (cpu_delta as f64 / wall_ms as f64 * 100.0).clamp(0.0, 100.0)
                    }
                }
                None => 0.0,
            };
            prev.insert(
                pid,
                PrevProcess {
                    total_time_ms: total_ms,
                    at: now,
                },
            );
            usage
        };

        ProcessCpuSample {
            pid,
            usage,
            user_time_ms: user_ms,
            system_time_ms: system_ms,
            total_time_ms: total_ms,
            timestamp: Utc::now(),
        }
    }

    /// Forget a pid after its worker exits.
    pub fn forget_process(&self, pid: u32) {
        self.prev_process.lock().remove(&pid);
    }

    #[cfg(target_os = "linux")]
    async fn process_times(&self, pid: u32) -> Option<(u64, u64)> {
        let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
            .await
            .ok()?;
        parse_proc_pid_stat(&stat, self.clock_ticks)
    }

    #[cfg(target_os = "macos")]
    async fn process_times(&self, pid: u32) -> Option<(u64, u64)> {
        let output = tokio::process::Command::new("ps")
            .args(["-o", "pcpu=,time=", "-p", &pid.to_string()])
            .output()
            .await
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().next()?;
        let mut fields = line.split_whitespace();
        let _pcpu = fields.next()?;
        let cumulative_ms = parse_ps_time(fields.next()?)?;
        // ps reports one cumulative figure; attribute it to user time.
        Some((cumulative_ms, 0))
    }

    #[cfg(target_os = "windows")]
    async fn process_times(&self, pid: u32) -> Option<(u64, u64)> {
        let output = tokio::process::Command::new("wmic")
            .args([
                "process",
                "where",
                &format!("ProcessId={pid}"),
                "get",
                "KernelModeTime,UserModeTime",
                "/format:csv",
            ])
            .output()
            .await
            .ok()?;
        parse_wmic_process_csv(&String::from_utf8_lossy(&output.stdout))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    async fn process_times(&self, _pid: u32) -> Option<(u64, u64)> {
        self.warn_unknown_platform();
        Some((0, 0))
    }

    /// Sample the whole system.
    pub async fn sample_system(&self) -> SystemCpuSample {
        self.platform_system_sample().await
    }

    #[cfg(target_os = "linux")]
    async fn platform_system_sample(&self) -> SystemCpuSample {
        let mut sample = SystemCpuSample::default();

        if let Ok(stat) = tokio::fs::read_to_string("/proc/stat").await {
            if let Some((idle, total)) = parse_proc_stat_aggregate(&stat) {
                let mut prev = self.prev_system.lock();
                if let Some((prev_idle, prev_total)) = *prev {
                    let idle_delta = idle.saturating_sub(prev_idle);
                    let total_delta = total.saturating_sub(prev_total);
                    if total_delta > 0 {
                        sample.overall = ((total_delta - idle_delta) as f64
                            / total_delta as f64
                            * 100.0)
                            .clamp(0.0, 100.0);
                    }
                }
                *prev = Some((idle, total));
            }
            sample.per_core = parse_proc_stat_cores(&stat);
        }

        if let Ok(loadavg) = tokio::fs::read_to_string("/proc/loadavg").await {
            sample.load_average = parse_loadavg(&loadavg);
        }

        if let Ok(mut dir) = tokio::fs::read_dir("/proc").await {
            let mut count = 0;
            while let Ok(Some(entry)) = dir.next_entry().await {
                if entry
                    .file_name()
                    .to_str()
                    .map(|n| n.bytes().all(|b| b.is_ascii_digit()))
                    .unwrap_or(false)
                {
                    count += 1;
                }
            }
            sample.process_count = count;
        }

        sample
    }

    #[cfg(target_os = "macos")]
    async fn platform_system_sample(&self) -> SystemCpuSample {
        let mut sample = SystemCpuSample::default();

        if let Ok(output) = tokio::process::Command::new("iostat")
            .args(["-c", "1", "1"])
            .output()
            .await
        {
            if let Some(idle) = parse_iostat_idle(&String::from_utf8_lossy(&output.stdout)) {
                sample.overall = (100.0 - idle).clamp(0.0, 100.0);
            }
        }

        if let Ok(output) = tokio::process::Command::new("ps").arg("-A").output().await {
            let lines = String::from_utf8_lossy(&output.stdout).lines().count();
            sample.process_count = lines.saturating_sub(1);
        }

        sample
    }

    #[cfg(target_os = "windows")]
    async fn platform_system_sample(&self) -> SystemCpuSample {
        let mut sample = SystemCpuSample::default();

        if let Ok(output) = tokio::process::Command::new("wmic")
            .args(["cpu", "get", "loadpercentage", "/value"])
            .output()
            .await
        {
            if let Some(load) = parse_wmic_load(&String::from_utf8_lossy(&output.stdout)) {
                sample.overall = load.clamp(0.0, 100.0);
            }
        }

        if let Ok(output) = tokio::process::Command::new("tasklist")
            .args(["/fo", "csv"])
            .output()
            .await
        {
            let lines = String::from_utf8_lossy(&output.stdout).lines().count();
            sample.process_count = lines.saturating_sub(1);
        }

        sample
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    async fn platform_system_sample(&self) -> SystemCpuSample {
        self.warn_unknown_platform();
        SystemCpuSample::default()
    }

    #[allow(dead_code)]
    fn warn_unknown_platform(&self) {
        if !self.warned_platform.swap(true, Ordering::Relaxed) {
            tracing::warn!("unsupported platform, CPU monitoring reports zeros");
        }
    }

    /// Approximate RSS per pid, for the autoscaler's memory rule.
    pub async fn sample_memory(&self, pids: &[u32]) -> HashMap<u32, u64> {
        let mut out = HashMap::with_capacity(pids.len());
        for pid in pids {
            if let Some(rss) = process_rss_bytes(*pid).await {
                out.insert(*pid, rss);
            }
        }
        out
    }
}

/// One smoothing step.
pub fn smooth(previous: f64, current: f64, alpha: f64) -> f64 {
    (alpha * current + (1.0 - alpha) * previous).clamp(0.0, 100.0)
}

/// Cluster aggregate: system weighted 0.4, worker sum 0.6, clamped.
pub fn aggregate_usage(system: &SystemCpuSample, workers: &[ProcessCpuSample]) -> f64 {
    let worker_sum: f64 = workers.iter().map(|w| w.usage).sum();
    (0.4 * system.overall + 0.6 * worker_sum).clamp(0.0, 100.0)
}

/// Clock ticks per second, via `getconf CLK_TCK`; warn once and assume
/// 100 when discovery is unavailable.
fn discover_clock_ticks() -> u64 {
    #[cfg(unix)]
    {
        if let Ok(output) = std::process::Command::new("getconf").arg("CLK_TCK").output() {
            if let Ok(ticks) = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>() {
                if ticks > 0 {
                    return ticks;
                }
            }
        }
        tracing::warn!("could not discover CLK_TCK, assuming 100 ticks/s");
    }
    100
}

/// Fields 14 (utime) and 15 (stime) of `/proc/[pid]/stat`, in ms.
/// The comm field may contain spaces; parsing restarts after `) `.
fn parse_proc_pid_stat(stat: &str, clock_ticks: u64) -> Option<(u64, u64)> {
    let after_comm = &stat[stat.rfind(") ")? + 2..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After comm: field 3 is at index 0, so utime (14) and stime (15)
    // land at indices 11 and 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let to_ms = |ticks: u64| ticks.saturating_mul(1000) / clock_ticks.max(1);
    Some((to_ms(utime), to_ms(stime)))
}

/// Aggregate (idle+iowait, total) jiffies from the `cpu ` line.
fn parse_proc_stat_aggregate(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 5 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total: u64 = values.iter().sum();
    Some((idle, total))
}

/// Instantaneous per-core busy fractions from `cpuN` lines. These are
/// lifetime ratios, adequate for the health report's relative view.
fn parse_proc_stat_cores(stat: &str) -> Vec<f64> {
    stat.lines()
        .filter(|l| {
            l.starts_with("cpu") && l.as_bytes().get(3).map(u8::is_ascii_digit).unwrap_or(false)
        })
        .filter_map(|line| {
            let values: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|v| v.parse().ok())
                .collect();
            if values.len() < 5 {
                return None;
            }
            let idle = values[3] + values.get(4).copied().unwrap_or(0);
            let total: u64 = values.iter().sum();
            if total == 0 {
                return None;
            }
            Some(((total - idle) as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
        })
        .collect()
}

fn parse_loadavg(loadavg: &str) -> Option<(f64, f64, f64)> {
    let mut fields = loadavg.split_whitespace();
    Some((
        fields.next()?.parse().ok()?,
        fields.next()?.parse().ok()?,
        fields.next()?.parse().ok()?,
    ))
}

/// `MM:SS.ss` or `HH:MM:SS.ss` cumulative time from `ps`, in ms.
#[allow(dead_code)]
fn parse_ps_time(time: &str) -> Option<u64> {
    let parts: Vec<&str> = time.trim().split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [minutes, seconds] => (0u64, minutes.parse::<u64>().ok()?, *seconds),
        [hours, minutes, seconds] => (
            hours.parse::<u64>().ok()?,
            minutes.parse::<u64>().ok()?,
            *seconds,
        ),
        _ => return None,
    };
    let seconds: f64 = seconds.parse().ok()?;
    Some(hours * 3_600_000 + minutes * 60_000 + (seconds * 1000.0) as u64)
}

/// Idle percentage from `iostat -c 1 1` output (last column block).
#[allow(dead_code)]
fn parse_iostat_idle(output: &str) -> Option<f64> {
    // The data line follows a header containing "us sy id".
    let mut lines = output.lines();
    let header_index = lines.position(|l| l.contains(" id"))?;
    let data = output.lines().nth(header_index + 1)?;
    let fields: Vec<&str> = data.split_whitespace().collect();
    // iostat prints disk columns first; us/sy/id sit before the load
    // averages, so idle is the third-from-last of the cpu triple.
    if fields.len() < 6 {
        return None;
    }
    fields[fields.len() - 4].parse().ok()
}

/// KernelModeTime/UserModeTime (100 ns units) from wmic csv output.
#[allow(dead_code)]
fn parse_wmic_process_csv(output: &str) -> Option<(u64, u64)> {
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("Node") {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 3 {
            continue;
        }
        let kernel: u64 = fields[1].trim().parse().ok()?;
        let user: u64 = fields[2].trim().parse().ok()?;
        // 100 ns units to ms.
        return Some((user / 10_000, kernel / 10_000));
    }
    None
}

#[allow(dead_code)]
fn parse_wmic_load(output: &str) -> Option<f64> {
    output
        .lines()
        .find_map(|l| l.trim().strip_prefix("LoadPercentage="))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(target_os = "linux")]
async fn process_rss_bytes(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(target_os = "macos")]
async fn process_rss_bytes(pid: u32) -> Option<u64> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    let kb: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn process_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_stays_in_range_and_converges() {
        let alpha = 0.3;
        let mut value = 0.0;
        for _ in 0..50 {
            value = smooth(value, 80.0, alpha);
            assert!((0.0..=100.0).contains(&value));
        }
        // ceil(log(eps)/log(1-alpha)) samples reach steady state; with
        // eps = 0.01 that is 13 samples, 50 is comfortably converged.
        assert!((value - 80.0).abs() < 0.01);
    }

    #[test]
    fn aggregate_mixes_system_and_workers_clamped() {
        let system = SystemCpuSample {
            overall: 50.0,
            ..Default::default()
        };
        let worker = |usage: f64| ProcessCpuSample {
            pid: 1,
            usage,
            user_time_ms: 0,
            system_time_ms: 0,
            total_time_ms: 0,
            timestamp: Utc::now(),
        };
        let aggregate = aggregate_usage(&system, &[worker(30.0), worker(20.0)]);
        assert!((aggregate - (0.4 * 50.0 + 0.6 * 50.0)).abs() < f64::EPSILON);

        let pinned = aggregate_usage(&system, &[worker(100.0), worker(100.0)]);
        assert!((pinned - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn proc_pid_stat_parses_around_comm_spaces() {
        // comm contains spaces and parentheses, the worst case.
        let stat = "1234 (my (weird) proc) S 1 1234 1234 0 -1 4194304 100 0 0 0 \
                    500 250 0 0 20 0 4 0 12345 1000000 200 18446744073709551615";
        let (user_ms, system_ms) = parse_proc_pid_stat(stat, 100).unwrap();
        assert_eq!(user_ms, 5000);
        assert_eq!(system_ms, 2500);
    }

    #[test]
    fn proc_stat_aggregate_takes_idle_and_iowait() {
        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
        let (idle, total) = parse_proc_stat_aggregate(stat).unwrap();
        assert_eq!(idle, 800);
        assert_eq!(total, 1000);

        let cores = parse_proc_stat_cores(stat);
        assert_eq!(cores.len(), 1);
        assert!((cores[0] - 20.0).abs() < 0.001);
    }

    #[test]
    fn loadavg_parses_three_fields() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345"),
            Some((0.52, 0.58, 0.59))
        );
    }

    #[test]
    fn ps_time_parses_both_shapes() {
        assert_eq!(parse_ps_time("01:02.50"), Some(62_500));
        assert_eq!(parse_ps_time("2:15:30.00"), Some(8_130_000));
        assert_eq!(parse_ps_time("garbage"), None);
    }

    #[test]
    fn wmic_process_csv_converts_100ns_to_ms() {
        let csv = "Node,KernelModeTime,UserModeTime\r\nHOST,1562500,4687500\r\n";
        assert_eq!(parse_wmic_process_csv(csv), Some((468, 156)));
    }

    #[test]
    fn wmic_load_parses_value_format() {
        assert_eq!(parse_wmic_load("\r\nLoadPercentage=42\r\n"), Some(42.0));
    }

    #[tokio::test]
    async fn first_process_sample_reports_zero() {
        let monitor = CpuMonitor::new(CpuMonitorConfig::default());
        let sample = monitor.sample_process(std::process::id()).await;
        assert_eq!(sample.usage, 0.0);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let monitor = CpuMonitor::new(CpuMonitorConfig {
            history_size: 3,
            ..Default::default()
        });
        for _ in 0..5 {
            monitor.sample(&[]).await;
        }
        assert_eq!(monitor.history().len(), 3);
    }
}
