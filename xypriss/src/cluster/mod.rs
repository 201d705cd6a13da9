//! # Cluster Supervisor & Autoscaler
//!
//! The supervisor owns a pool of identical worker processes, re-spawned
//! instances of the current executable with the internal `--worker`
//! flag, sharing the listening port through SO_REUSEPORT. Workers emit
//! heartbeat lines on stdout; the supervisor reads them, tracks health,
//! respawns crashed or silent workers with backoff, and runs the
//! autoscaling control loop over the CPU monitor's samples.

pub mod autoscaler;
pub mod supervisor;

use serde::{Deserialize, Serialize};

pub use autoscaler::{AutoScaler, ScaleDecision};
pub use supervisor::ClusterSupervisor;

/// Worker lifecycle states as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
}

/// Heartbeat message a worker prints to stdout, one JSON object per
/// line. Logs go to stderr in worker mode so the two streams never mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub pid: u32,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Worker RSS when cheaply available
    pub rss_bytes: Option<u64>,
}

impl HeartbeatMsg {
    pub fn now(pid: u32, rss_bytes: Option<u64>) -> Self {
        Self {
            pid,
            timestamp: chrono::Utc::now().timestamp_millis(),
            rss_bytes,
        }
    }
}
