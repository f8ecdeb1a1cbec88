//! Handle for controlling a periodic sweep.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use super::types::{SchedulerError, SweepReport, TaskCommand, TaskState};

/// Buffer size for the command channel between a handle and its task.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 16;

/// Handle for controlling a running [`PeriodicTask`](super::PeriodicTask).
#[derive(Clone)]
pub struct SweepHandle {
    pub(crate) name: &'static str,
    pub(crate) command_tx: mpsc::Sender<TaskCommand>,
    pub(crate) state: Arc<RwLock<TaskState>>,
}

impl SweepHandle {
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> TaskCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!(
                    "failed to send {} command to {}",
                    operation, self.name
                ))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!(
                "failed to receive {} response from {}",
                operation, self.name
            ))
        })
    }

    /// Name of the sweep.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run one tick now, outside the timer.
    ///
    /// Returns `None` when the sweep lock was held elsewhere.
    pub async fn run_now(&self) -> Result<Option<SweepReport>, SchedulerError> {
        self.send_command(|response| TaskCommand::RunNow { response }, "run_now")
            .await
    }

    /// Pause the timer. `run_now` still works while paused.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| TaskCommand::Pause { response }, "pause")
            .await
    }

    /// Resume after a pause.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| TaskCommand::Resume { response }, "resume")
            .await
    }

    /// Stop the task. An in-progress tick finishes first.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| TaskCommand::Shutdown { response }, "shutdown")
            .await
    }

    /// Get the current state.
    pub async fn state(&self) -> TaskState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == TaskState::Running
    }

    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == TaskState::Paused
    }
}
