//! Worker process supervision.
//!
//! Each worker is a child process running the same binary with
//! `--worker`; the kernel distributes accepted connections across the
//! pool because every worker binds the port with SO_REUSEPORT. The
//! supervisor:
//!
//! - reads heartbeat JSON lines from each worker's stdout and marks a
//!   worker unhealthy once the heartbeat timeout lapses (kill, respawn);
//! - treats a non-zero exit within ten seconds of spawn as a crash loop
//!   and backs the restart rate off exponentially;
//! - drives the autoscaler from the CPU monitor each scale interval;
//! - on shutdown, signals workers to drain (SIGTERM on Unix) and force
//!   kills whatever outlives the graceful deadline.
//!
//! Scaling decisions are serialized here; workers never coordinate with
//! one another.

use super::autoscaler::{AutoScaler, ScaleDecision};
use super::{HeartbeatMsg, WorkerState};
use crate::config::ClusterSection;
use crate::cpu_monitor::CpuMonitor;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// A worker recently spawned is a crash if it dies this fast.
const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(10);
const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);

struct SupervisedWorker {
    id: usize,
    pid: u32,
    child: Child,
    state: WorkerState,
    restart_count: u32,
    spawned_at: Instant,
    last_heartbeat: Arc<Mutex<Instant>>,
    reader: tokio::task::JoinHandle<()>,
}

/// The cluster supervisor.
pub struct ClusterSupervisor {
    config: ClusterSection,
    workers: Vec<SupervisedWorker>,
    cpu: Arc<CpuMonitor>,
    scaler: AutoScaler,
    next_id: AtomicUsize,
    config_path: String,
}

impl ClusterSupervisor {
    pub fn new(config: ClusterSection, cpu: Arc<CpuMonitor>, config_path: String) -> Self {
        let scaler = AutoScaler::new(config.auto_scale.clone());
        Self {
            config,
            workers: Vec::new(),
            cpu,
            scaler,
            next_id: AtomicUsize::new(0),
            config_path,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state != WorkerState::Stopped)
            .count()
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers
            .iter()
            .filter(|w| w.state != WorkerState::Stopped)
            .map(|w| w.pid)
            .collect()
    }

    /// Run the supervision loop until interrupted.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let initial = self.config.workers.resolve();
        tracing::info!(workers = initial, "starting cluster");
        for _ in 0..initial {
            self.spawn_worker().await?;
        }

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut last_scale_check = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                _ = tick.tick() => {
                    self.reap_exited().await;
                    self.check_heartbeats().await;

                    if self.config.auto_scale.enabled
                        && last_scale_check.elapsed() >= self.config.auto_scale.scale_interval
                    {
                        last_scale_check = Instant::now();
                        self.autoscale_tick().await;
                    }
                }
            }
        }

        self.shutdown_all().await;
        Ok(())
    }

    async fn autoscale_tick(&mut self) {
        let pids = self.worker_pids();
        let snapshot = self.cpu.sample(&pids).await;
        let healthy = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Healthy)
            .count()
            .max(1);
        let avg_cpu = snapshot
            .workers
            .iter()
            .map(|w| w.usage)
            .sum::<f64>()
            / healthy as f64;

        let memory = self.cpu.sample_memory(&pids).await;
        let avg_memory_pct = if memory.is_empty() {
            0.0
        } else {
            // RSS as a share of an assumed 1 GiB budget per worker;
            // operators tune memoryThreshold against this scale.
            let total: u64 = memory.values().sum();
            (total as f64 / memory.len() as f64) / (1024.0 * 1024.0 * 1024.0) * 100.0
        };

        match self
            .scaler
            .evaluate(avg_cpu, avg_memory_pct, self.worker_count())
        {
            ScaleDecision::Up => {
                if let Err(error) = self.spawn_worker().await {
                    tracing::error!(%error, "scale-up spawn failed");
                }
            }
            ScaleDecision::Down => self.retire_newest().await,
            ScaleDecision::Hold => {}
        }
    }

    async fn spawn_worker(&mut self) -> anyhow::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("--worker")
            .arg("--config")
            .arg(&self.config_path)
            .env("XYPRISS_WORKER_ID", id.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or_default();
        let last_heartbeat = Arc::new(Mutex::new(Instant::now()));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout not piped"))?;
        let heartbeat_clock = Arc::clone(&last_heartbeat);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<HeartbeatMsg>(&line) {
                    Ok(_beat) => *heartbeat_clock.lock() = Instant::now(),
                    Err(_) => tracing::debug!(worker = id, line, "non-heartbeat worker output"),
                }
            }
        });

        tracing::info!(worker = id, pid, "worker spawned");
        self.workers.push(SupervisedWorker {
            id,
            pid,
            child,
            state: WorkerState::Starting,
            restart_count: 0,
            spawned_at: Instant::now(),
            last_heartbeat,
            reader,
        });
        Ok(())
    }

    /// Collect exited children and respawn with crash backoff.
    async fn reap_exited(&mut self) {
        let mut respawn = 0usize;
        let mut backoff = Duration::ZERO;

        for worker in &mut self.workers {
            if worker.state == WorkerState::Stopped {
                continue;
            }
            if let Ok(Some(status)) = worker.child.try_wait() {
                worker.state = WorkerState::Stopped;
                worker.reader.abort();
                let early = worker.spawned_at.elapsed() < EARLY_EXIT_WINDOW;
                if status.success() {
                    tracing::info!(worker = worker.id, "worker exited cleanly");
                    continue;
                }
                worker.restart_count += 1;
                if early {
                    let exponent = worker.restart_count.min(6);
                    backoff = backoff.max(
                        (RESTART_BACKOFF_BASE * 2u32.pow(exponent)).min(RESTART_BACKOFF_CAP),
                    );
                    tracing::warn!(
                        worker = worker.id,
                        restarts = worker.restart_count,
                        "worker crashed shortly after spawn, backing off"
                    );
                } else {
                    tracing::warn!(worker = worker.id, ?status, "worker died, respawning");
                }
                respawn += 1;
            }
        }

        self.workers.retain(|w| w.state != WorkerState::Stopped);

        if respawn > 0 {
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            for _ in 0..respawn {
                if let Err(error) = self.spawn_worker().await {
                    tracing::error!(%error, "respawn failed, cluster degraded");
                }
            }
        }
    }

    /// Promote fresh workers, demote silent ones.
    async fn check_heartbeats(&mut self) {
        let timeout = self.config.heartbeat_timeout;
        let mut to_kill = Vec::new();

        for worker in &mut self.workers {
            let silence = worker.last_heartbeat.lock().elapsed();
            match worker.state {
                WorkerState::Starting if silence < self.config.heartbeat_interval * 2 => {
                    worker.state = WorkerState::Healthy;
                }
                WorkerState::Healthy | WorkerState::Starting if silence > timeout => {
                    tracing::warn!(
                        worker = worker.id,
                        silence_ms = silence.as_millis() as u64,
                        "heartbeat timeout, recycling worker"
                    );
                    worker.state = WorkerState::Unhealthy;
                    to_kill.push(worker.id);
                }
                _ => {}
            }
        }

        for id in to_kill {
            if let Some(worker) = self.workers.iter_mut().find(|w| w.id == id) {
                let _ = worker.child.start_kill();
                // The next reap pass respawns it.
            }
        }
    }

    /// Gracefully retire the most recently spawned worker.
    async fn retire_newest(&mut self) {
        let Some(index) = self
            .workers
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| w.spawned_at)
            .map(|(i, _)| i)
        else {
            return;
        };
        let mut worker = self.workers.remove(index);
        let deadline = self.config.graceful_shutdown.timeout;
        tracing::info!(worker = worker.id, "retiring worker for scale-down");
        Self::stop_worker(&mut worker, deadline).await;
        self.cpu.forget_process(worker.pid);
    }

    async fn shutdown_all(&mut self) {
        let deadline = self.config.graceful_shutdown.timeout;
        tracing::info!(workers = self.workers.len(), "stopping cluster");
        let mut workers = std::mem::take(&mut self.workers);
        for worker in &mut workers {
            Self::stop_worker(worker, deadline).await;
        }
    }

    /// Ask a worker to drain, then force kill after the deadline.
    async fn stop_worker(worker: &mut SupervisedWorker, deadline: Duration) {
        worker.state = WorkerState::Stopping;
        signal_terminate(worker.pid);

        let drained = tokio::time::timeout(deadline, worker.child.wait()).await;
        match drained {
            Ok(_) => tracing::info!(worker = worker.id, "worker drained and exited"),
            Err(_) => {
                tracing::warn!(worker = worker.id, "drain deadline exceeded, force killing");
                let _ = worker.child.start_kill();
                let _ = worker.child.wait().await;
            }
        }
        worker.reader.abort();
        worker.state = WorkerState::Stopped;
    }
}

/// SIGTERM on Unix; elsewhere there is no graceful signal, the drain
/// deadline just starts immediately.
#[cfg(unix)]
fn signal_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) {}

/// Worker-side heartbeat emitter: one JSON line per interval on stdout.
pub fn spawn_heartbeat_emitter(interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let pid = std::process::id();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let beat = HeartbeatMsg::now(pid, None);
            match serde_json::to_string(&beat) {
                Ok(line) => println!("{line}"),
                Err(error) => tracing::error!(%error, "heartbeat serialization failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips_as_json_line() {
        let beat = HeartbeatMsg::now(4242, Some(1024));
        let line = serde_json::to_string(&beat).unwrap();
        let parsed: HeartbeatMsg = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.rss_bytes, Some(1024));
    }

    #[tokio::test]
    async fn heartbeat_emitter_prints_periodically() {
        // Smoke test: the emitter task starts and survives a few ticks.
        let handle = spawn_heartbeat_emitter(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    }
}
