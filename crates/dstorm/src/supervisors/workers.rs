//! 🧵 Workers: the ones who actually do the work while the supervisor takes all
//! the credit in the sprint retro.
//!
//! Every worker is one tokio task with one connection. It hears from its
//! supervisor on a private control channel and talks back on the shared event
//! channel. When it stops, for any reason including a panic, the supervisor is
//! told exactly once with an [`WorkerEvent::Exited`].

use std::panic::AssertUnwindSafe;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExitStatus, WorkerControl, WorkerEvent, WorkerState};
use crate::common::WorkerId;

mod consumer_worker;
mod producer_worker;

pub(in crate::supervisors) use consumer_worker::{ConsumerSettings, ConsumerWorker};
pub(in crate::supervisors) use producer_worker::{ProducerSettings, ProducerWorker};

/// 🏗️ A background worker, that does work. duh.
#[async_trait]
pub(in crate::supervisors) trait Worker: Send + Sized + 'static {
    fn id(&self) -> WorkerId;

    /// 🚀 Run until shutdown or failure. `Err` means the supervisor should
    /// consider a respawn.
    async fn run(self) -> Result<()>;
}

/// 📇 The supervisor's half of a running worker.
#[derive(Debug)]
pub(in crate::supervisors) struct WorkerHandle {
    pub(in crate::supervisors) control: Sender<WorkerControl>,
    pub(in crate::supervisors) join: JoinHandle<()>,
    /// 🪓 asked to leave by the tuner; never respawned
    pub(in crate::supervisors) retiring: bool,
}

impl WorkerHandle {
    /// 📮 Best effort. A worker that already left cannot be told anything.
    pub(in crate::supervisors) fn tell(&self, message: WorkerControl) -> bool {
        self.control.try_send(message).is_ok()
    }
}

/// 🧵 Spawn a worker and wire its exit into the event channel.
pub(in crate::supervisors) fn start<W: Worker>(
    worker: W,
    control: Sender<WorkerControl>,
    events: Sender<WorkerEvent>,
) -> WorkerHandle {
    let worker_id = worker.id();
    let join = tokio::spawn(async move {
        let status = match AssertUnwindSafe(worker.run()).catch_unwind().await {
            Ok(Ok(())) => ExitStatus::Clean,
            Ok(Err(err)) => ExitStatus::Failed(format!("{err:#}")),
            Err(_) => ExitStatus::Failed("worker panicked".to_string()),
        };
        debug!(worker_id, ?status, "🏁 worker exited");
        let _ = events
            .send(WorkerEvent::Status {
                worker_id,
                state: WorkerState::Exited,
            })
            .await;
        if events
            .send(WorkerEvent::Exited { worker_id, status })
            .await
            .is_err()
        {
            warn!(worker_id, "⚠️ supervisor left before hearing this worker exit");
        }
    });
    WorkerHandle {
        control,
        join,
        retiring: false,
    }
}

/// 📪 A fresh control channel. Unbounded: control traffic is a handful of messages per worker.
pub(in crate::supervisors) fn control_channel() -> (Sender<WorkerControl>, Receiver<WorkerControl>) {
    async_channel::unbounded()
}
