use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::run::RunStatus;

#[derive(Debug)]
pub struct Metrics {
    pub runs_submitted: AtomicU64,
    pub runs_active: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub items_completed: AtomicU64,
    pub items_failed: AtomicU64,
    pub invocation_attempts: AtomicU64,
    pub traces_ingested: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runs_submitted: AtomicU64::new(0),
            runs_active: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            items_completed: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            invocation_attempts: AtomicU64::new(0),
            traces_ingested: AtomicU64::new(0),
        })
    }

    pub fn run_submitted(&self) {
        self.runs_submitted.fetch_add(1, Ordering::Relaxed);
        self.runs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_finished(&self, status: RunStatus) {
        let counter = match status {
            RunStatus::Completed => &self.runs_completed,
            RunStatus::Failed => &self.runs_failed,
            RunStatus::Cancelled => &self.runs_cancelled,
            RunStatus::Pending | RunStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.runs_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn item_finished(&self, success: bool) {
        if success {
            self.items_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.items_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_attempts(&self, attempts: u32) {
        self.invocation_attempts
            .fetch_add(attempts as u64, Ordering::Relaxed);
    }

    pub fn trace_ingested(&self) {
        self.traces_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let rows: [(&str, &str, &str, &AtomicU64); 9] = [
            ("runs_submitted_total", "counter", "Runs accepted for execution.", &self.runs_submitted),
            ("runs_active", "gauge", "Runs not yet in a terminal state.", &self.runs_active),
            ("runs_completed_total", "counter", "Runs that completed.", &self.runs_completed),
            ("runs_failed_total", "counter", "Runs that failed before dispatch.", &self.runs_failed),
            ("runs_cancelled_total", "counter", "Runs that were cancelled.", &self.runs_cancelled),
            ("items_completed_total", "counter", "Dataset items evaluated successfully.", &self.items_completed),
            ("items_failed_total", "counter", "Dataset items recorded as failed.", &self.items_failed),
            ("invocation_attempts_total", "counter", "Model invocation attempts, retries included.", &self.invocation_attempts),
            ("traces_ingested_total", "counter", "Production traces ingested.", &self.traces_ingested),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in rows {
            out.push_str(&format!(
                "# HELP evalrun_{name} {help}\n# TYPE evalrun_{name} {kind}\nevalrun_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
