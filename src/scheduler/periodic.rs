//! Timer-driven sweep runner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::handle::{COMMAND_CHANNEL_BUFFER, SweepHandle};
use super::types::{SweepReport, TaskCommand, TaskState};
use super::Sweep;
use crate::lock::{LockService, run_exclusive};

/// Timer and lease settings of a periodic task.
#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Time between ticks. `None` disables the task.
    pub interval: Option<Duration>,
    /// Delay before the first tick.
    pub warmup: Duration,
    pub lock_ttl: chrono::Duration,
    /// Lease holder name, usually the instance id.
    pub holder: String,
}

/// Runs a [`Sweep`] on its own timer.
pub struct PeriodicTask {
    sweep: Arc<dyn Sweep>,
    locks: Arc<dyn LockService>,
    config: PeriodicConfig,
}

impl PeriodicTask {
    pub fn new(sweep: Arc<dyn Sweep>, locks: Arc<dyn LockService>, config: PeriodicConfig) -> Self {
        Self {
            sweep,
            locks,
            config,
        }
    }

    pub fn name(&self) -> &'static str {
        self.sweep.name()
    }

    /// Run one tick under the sweep lease.
    ///
    /// Returns `None` when another holder has the lease or the sweep panicked.
    pub async fn tick(&self) -> Option<SweepReport> {
        let sweep = Arc::clone(&self.sweep);
        run_exclusive(
            self.locks.as_ref(),
            self.sweep.lock_name(),
            &self.config.holder,
            self.config.lock_ttl,
            || async move { sweep.run_once().await },
        )
        .await
    }

    /// Spawn the timer loop.
    ///
    /// Returns `None` without spawning when the interval is disabled.
    pub fn start(self) -> Option<(SweepHandle, JoinHandle<()>)> {
        let Some(interval) = self.config.interval else {
            tracing::info!(sweep = self.name(), "sweep disabled");
            return None;
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(TaskState::Running));

        let handle = SweepHandle {
            name: self.name(),
            command_tx,
            state: Arc::clone(&state),
        };

        tracing::info!(
            sweep = self.name(),
            interval_secs = interval.as_secs(),
            warmup_secs = self.config.warmup.as_secs(),
            "sweep started"
        );
        let task = tokio::spawn(async move {
            self.run(interval, command_rx, state).await;
        });

        Some((handle, task))
    }

    async fn run(
        self,
        interval: Duration,
        mut command_rx: mpsc::Receiver<TaskCommand>,
        state: Arc<RwLock<TaskState>>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.config.warmup, interval);
        // A slow tick pushes the next one back instead of bursting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *state.read().await == TaskState::Running {
                        self.tick().await;
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        TaskCommand::RunNow { response } => {
                            let _ = response.send(self.tick().await);
                        }
                        TaskCommand::Pause { response } => {
                            *state.write().await = TaskState::Paused;
                            tracing::info!(sweep = self.name(), "sweep paused");
                            let _ = response.send(());
                        }
                        TaskCommand::Resume { response } => {
                            *state.write().await = TaskState::Running;
                            tracing::info!(sweep = self.name(), "sweep resumed");
                            let _ = response.send(());
                        }
                        TaskCommand::Shutdown { response } => {
                            *state.write().await = TaskState::Stopped;
                            tracing::info!(sweep = self.name(), "sweep stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }
}
