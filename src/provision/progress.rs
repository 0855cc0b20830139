use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Done,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

/// One progress update. Re-emitting the same `step_index` replaces the
/// observer's view of that step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisioningStep {
    pub step_index: usize,
    pub total_steps: usize,
    pub label: String,
    pub status: StepStatus,
    pub message: Option<String>,
}

/// Emits the updates for a single step. Construction emits `running`; the
/// terminal methods consume the handle so a step finishes exactly once.
pub struct StepHandle {
    tx: broadcast::Sender<ProvisioningStep>,
    index: usize,
    total: usize,
    label: &'static str,
    finished: bool,
}

impl StepHandle {
    pub(crate) fn begin(
        tx: broadcast::Sender<ProvisioningStep>,
        index: usize,
        total: usize,
        label: &'static str,
    ) -> Self {
        let handle = Self {
            tx,
            index,
            total,
            label,
            finished: false,
        };
        info!(step = index, total, "{}", label);
        handle.emit(StepStatus::Running, None);
        handle
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn emit(&self, status: StepStatus, message: Option<String>) {
        let _ = self.tx.send(ProvisioningStep {
            step_index: self.index,
            total_steps: self.total,
            label: self.label.to_string(),
            status,
            message,
        });
    }

    /// Sub-progress for a long step.
    pub fn running(&self, message: impl Into<String>) {
        self.emit(StepStatus::Running, Some(message.into()));
    }

    pub fn done(mut self, message: Option<String>) {
        self.finished = true;
        self.emit(StepStatus::Done, message);
    }

    pub fn skipped(mut self, message: impl Into<String>) {
        self.finished = true;
        let message = message.into();
        info!(step = self.index, reason = %message, "{} skipped", self.label);
        self.emit(StepStatus::Skipped, Some(message));
    }

    pub fn error(mut self, message: impl Into<String>) {
        self.finished = true;
        let message = message.into();
        warn!(step = self.index, error = %message, "{} failed", self.label);
        self.emit(StepStatus::Error, Some(message));
    }
}

impl Drop for StepHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.emit(StepStatus::Error, Some("step did not complete".to_string()));
        }
    }
}
