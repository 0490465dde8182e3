//! Process shutdown hooks
//!
//! Termination signals, an explicit maintenance request, and normal process
//! exit all funnel into `ExperimentOrchestrator::shutdown`, whose one-shot
//! flag makes the first trigger win. A forceful kill cannot be intercepted;
//! containers leak in that case and `db-shootout cleanup` removes them.

use crate::load::StopHandle;
use crate::orchestrator::ExperimentOrchestrator;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Wait for Ctrl-C or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and that signal
/// source never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, initiating shutdown"),
        () = terminate => info!("received SIGTERM, initiating shutdown"),
    }
}

/// What asked for the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// Explicit maintenance request
    Request,
    /// Ctrl-C or SIGTERM
    Signal,
    /// Normal end of the process
    Exit,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Signal => "signal",
            Self::Exit => "exit",
        })
    }
}

/// Routes every shutdown trigger to one orchestrator teardown.
///
/// Load sessions registered with `stop_sessions` are asked to stop before
/// the environments go away, so an interrupted run ends as cancelled.
pub struct ShutdownHooks {
    orchestrator: Arc<ExperimentOrchestrator>,
    notify: broadcast::Sender<ShutdownTrigger>,
    sessions: Mutex<Vec<StopHandle>>,
}

impl ShutdownHooks {
    /// Create hooks for `orchestrator`
    #[must_use]
    pub fn new(orchestrator: Arc<ExperimentOrchestrator>) -> Arc<Self> {
        let (notify, _) = broadcast::channel(4);
        Arc::new(Self {
            orchestrator,
            notify,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Stop these sessions whenever a trigger fires, ahead of teardown
    pub fn stop_sessions(&self, handle: StopHandle) {
        self.sessions.lock().push(handle);
    }

    /// Receive every trigger that fired
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownTrigger> {
        self.notify.subscribe()
    }

    /// Shut the orchestrator down; `true` if this trigger performed the teardown
    pub async fn trigger(&self, trigger: ShutdownTrigger) -> bool {
        let sessions = self.sessions.lock().clone();
        for handle in &sessions {
            handle.stop_all();
        }

        let performed = self.orchestrator.shutdown().await;
        if performed {
            info!(%trigger, "teardown complete");
        }
        let _ = self.notify.send(trigger);
        performed
    }

    /// Spawn a task that triggers shutdown on Ctrl-C or SIGTERM
    #[must_use]
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let hooks = Arc::clone(self);
        tokio::spawn(async move {
            shutdown_signal().await;
            hooks.trigger(ShutdownTrigger::Signal).await;
        })
    }
}
