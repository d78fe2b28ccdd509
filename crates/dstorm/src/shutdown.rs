//! 🛑 Process signals and a tiny broadcast so several pools can stop together.
//!
//! SIGINT or SIGTERM starts the graceful path. The supervisors own the
//! force-exit timer; this module only says "now".

use std::fmt;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

/// 📟 Which signal ended the party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT (Ctrl+C)"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// 🛑 Resolve on the first SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() -> Result<ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("💀 could not install the SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("💀 could not install the SIGINT handler")?;

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };
    info!("🛑 received {received}, initiating graceful shutdown");
    Ok(received)
}

/// 🛑 Ctrl+C is all we get off unix.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> Result<ShutdownSignal> {
    tokio::signal::ctrl_c()
        .await
        .context("💀 could not install the Ctrl+C handler")?;
    info!("🛑 received Ctrl+C, initiating graceful shutdown");
    Ok(ShutdownSignal::Interrupt)
}

/// 📢 One trigger, many listeners. Triggering twice is the same as triggering once.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// ⏳ A future that resolves once `trigger` has been called, even if that
    /// happened before the future was created.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            // -- 🔚 the sender lives in self; if every clone is gone nobody can trigger, so stop too
            let _ = receiver.wait_for(|stop| *stop).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn the_one_where_every_listener_hears_the_trigger() {
        let the_coordinator = ShutdownCoordinator::new();
        let the_first = the_coordinator.wait();
        let the_second = the_coordinator.wait();
        assert!(!the_coordinator.is_triggered());

        the_coordinator.trigger();
        the_coordinator.trigger();
        the_first.await;
        the_second.await;
        // ✅ late subscribers do not miss it either
        assert!(the_coordinator.wait().now_or_never().is_some());
    }

    #[tokio::test]
    async fn the_one_where_nobody_stops_until_asked() {
        let the_coordinator = ShutdownCoordinator::new();
        assert!(the_coordinator.wait().now_or_never().is_none());
    }

    #[test]
    fn the_one_where_signals_have_names() {
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT (Ctrl+C)");
    }
}
