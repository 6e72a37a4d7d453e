use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::aggregator::RunMetrics;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// `pending -> completed` covers a dataset with no items.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next != RunStatus::Pending,
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub at: DateTime<Utc>,
}

/// The persisted view of one run. Mutated only by the run's supervisor task
/// (and by `cancel` while nothing has been dispatched yet).
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub metrics: Option<RunMetrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StatusTransition>,
}

impl ExperimentRun {
    pub fn new(run_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            experiment_id: experiment_id.into(),
            status: RunStatus::Pending,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            metrics: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            transitions: Vec::new(),
        }
    }

    pub fn transition_to(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "run {}: illegal transition {} -> {}",
                self.run_id, self.status, next
            )));
        }

        let now = Utc::now();
        debug!(run_id = %self.run_id, from = %self.status, to = %next, "Run status transition");
        self.transitions.push(StatusTransition {
            from: self.status,
            to: next,
            at: now,
        });
        self.status = next;

        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Total is fixed once, at enumeration, before anything is dispatched.
    pub fn set_total(&mut self, total: usize) -> Result<(), EngineError> {
        if self.status != RunStatus::Pending || self.processed() > 0 {
            return Err(EngineError::Internal(format!(
                "run {}: total_items can only be set while pending",
                self.run_id
            )));
        }
        self.total_items = total;
        Ok(())
    }

    pub fn record_item(&mut self, success: bool) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::Internal(format!(
                "run {}: counts are frozen once {}",
                self.run_id, self.status
            )));
        }
        if self.processed() >= self.total_items {
            return Err(EngineError::Internal(format!(
                "run {}: more results than items ({})",
                self.run_id, self.total_items
            )));
        }
        if success {
            self.completed_items += 1;
        } else {
            self.failed_items += 1;
        }
        Ok(())
    }

    pub fn processed(&self) -> usize {
        self.completed_items + self.failed_items
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.completed_items as f64 / self.total_items as f64 * 100.0
    }

    pub fn view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.run_id.clone(),
            experiment_id: self.experiment_id.clone(),
            status: self.status,
            total_items: self.total_items,
            completed_items: self.completed_items,
            failed_items: self.failed_items,
            progress_percentage: self.progress_percentage(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub progress_percentage: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending() {
        let run = ExperimentRun::new("run_1", "exp-1");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());
        assert_eq!(run.progress_percentage(), 0.0);
    }

    #[test]
    fn test_lifecycle_sets_timestamps_once() {
        let mut run = ExperimentRun::new("run_1", "exp-1");
        run.set_total(2).unwrap();
        run.transition_to(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());

        run.record_item(true).unwrap();
        run.record_item(false).unwrap();
        assert_eq!(run.progress_percentage(), 50.0);

        run.transition_to(RunStatus::Completed).unwrap();
        let completed_at = run.completed_at;
        assert!(completed_at.is_some());

        assert!(run.transition_to(RunStatus::Cancelled).is_err());
        assert_eq!(run.completed_at, completed_at);
        assert_eq!(run.transitions.len(), 2);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            for next in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_counts_never_exceed_total() {
        let mut run = ExperimentRun::new("run_1", "exp-1");
        run.set_total(1).unwrap();
        run.transition_to(RunStatus::Running).unwrap();
        run.record_item(true).unwrap();
        assert!(run.record_item(true).is_err());
        assert_eq!(run.processed(), 1);
    }

    #[test]
    fn test_counts_frozen_after_terminal() {
        let mut run = ExperimentRun::new("run_1", "exp-1");
        run.set_total(3).unwrap();
        run.transition_to(RunStatus::Running).unwrap();
        run.transition_to(RunStatus::Cancelled).unwrap();
        assert!(run.record_item(true).is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
