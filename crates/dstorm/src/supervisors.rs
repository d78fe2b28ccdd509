//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where workers send batches endlessly..."
//! 🎬 "One supervisor dared to count them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor module: part middle manager, part helicopter parent.
//!
//! Two pools live here. The [`PoolSupervisor`] runs the producing workers, feeds
//! their reports to the metrics aggregator, lets the tuner resize the pool, and
//! drives a bounded shutdown. The [`IntakeSupervisor`] runs the consuming workers
//! and keeps their counters.
//!
//! 📨 Nobody shares memory with a worker. Supervisor → worker traffic is a
//! [`WorkerControl`] on a per-worker channel; worker → supervisor traffic is a
//! [`WorkerEvent`] on one shared channel. The supervisor is the only one who
//! ever holds aggregate state.
//!
//! ⚠️ DO NOT MAKE `workers` PUB. Workers are the supervisors' private little minions.

use std::time::Duration;

use tokio::time::Instant;

use crate::backends::BrokerError;
use crate::common::WorkerId;

mod intake;
mod pool;
mod workers;

#[cfg(test)]
mod scripted;

pub use intake::{IntakeSummary, IntakeSupervisor};
pub use pool::{PoolSupervisor, RunSummary};

/// 📮 Supervisor → worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerControl {
    /// 🛑 finish the current iteration, disconnect, exit
    Shutdown,
    /// 🔧 rebuild the batch pool at the next loop boundary
    UpdateConfig { batch_size: usize, pool_depth: usize },
}

/// 🚦 Where a worker is in its life.
///
/// ```text
/// Connecting → Running ⇄ Backoff → ShuttingDown → Exited
///                 ↘ Reconnecting ↗
/// ```
/// A fatal connect error goes straight to `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Connecting,
    Running,
    Backoff,
    Reconnecting,
    ShuttingDown,
    Exited,
}

/// 🏁 How a worker left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    Clean,
    Failed(String),
}

/// 📥 What a consumer worker has to say for itself.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IntakeReport {
    BatchProcessed {
        count: usize,
        skipped: usize,
        elapsed: Duration,
        buffered: usize,
    },
    Flushed {
        points: usize,
        elapsed: Duration,
    },
    FlushFailed {
        retained: usize,
        trimmed: usize,
    },
    Health {
        buffered: usize,
        total_flushed: u64,
    },
}

/// 📨 Worker → supervisor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerEvent {
    Status {
        worker_id: WorkerId,
        state: WorkerState,
    },
    Metrics {
        worker_id: WorkerId,
        count: u64,
        elapsed: Duration,
    },
    /// 💀 send errors since the last report, with the most recent one for flavour
    Error {
        worker_id: WorkerId,
        count: u64,
        last: BrokerError,
    },
    Fatal {
        worker_id: WorkerId,
        error: String,
    },
    Intake {
        worker_id: WorkerId,
        report: IntakeReport,
    },
    Exited {
        worker_id: WorkerId,
        status: ExitStatus,
    },
    /// ⏰ sent by the supervisor to itself once a restart delay has passed
    Respawn { worker_id: WorkerId },
}

/// 🏁 How a pool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// ✅ every worker exited before the force-exit timer
    Graceful,
    /// 💀 the timer won; stragglers were aborted
    ForcedTimeout,
}

// -- ⏰ schedule a Respawn event after `delay`, without blocking the supervisor loop
fn schedule_respawn(events: async_channel::Sender<WorkerEvent>, worker_id: WorkerId, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // -- 🔚 if the supervisor is gone, so is the point of respawning
        let _ = events.send(WorkerEvent::Respawn { worker_id }).await;
    });
}

// -- ⏳ sleep until `deadline`, or forever when there is none
async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
