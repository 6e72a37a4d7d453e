use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::aggregator::{RunAggregator, RunMetrics};
use super::job::EvaluationResult;
use super::state::{ExperimentRun, RunStatus, RunStatusView};
use crate::error::EngineError;

/// One registered run: its record, its results and its cancellation flag.
pub struct RunEntry {
    record: RwLock<ExperimentRun>,
    /// Keyed by dataset item id; each key is written by exactly one executor.
    results: DashMap<String, EvaluationResult>,
    aggregator: Mutex<RunAggregator>,
    cancel: watch::Sender<bool>,
    /// Set, under the record lock, once items are handed to executors.
    launched: AtomicBool,
}

impl RunEntry {
    fn new(run: ExperimentRun) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            record: RwLock::new(run),
            results: DashMap::new(),
            aggregator: Mutex::new(RunAggregator::default()),
            cancel,
            launched: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> ExperimentRun {
        self.record.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.record.read().status
    }

    pub fn view(&self) -> RunStatusView {
        self.record.read().view()
    }

    /// Write access for the run's single writer.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ExperimentRun) -> R) -> R {
        f(&mut self.record.write())
    }

    /// Fixes the item count and marks the run as handed to executors. Fails if
    /// the run already left `pending`.
    pub(crate) fn launch(&self, total_items: usize) -> Result<(), EngineError> {
        let mut run = self.record.write();
        run.set_total(total_items)?;
        self.launched.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Moves a pending run straight to `cancelled` if no executor can hold one
    /// of its items yet. Once launched, the supervisor finalizes instead.
    pub(crate) fn cancel_if_idle(&self) -> bool {
        let mut run = self.record.write();
        if self.launched.load(Ordering::SeqCst) || run.status != RunStatus::Pending {
            return false;
        }
        run.transition_to(RunStatus::Cancelled).is_ok()
    }

    pub(crate) fn reset_aggregator(&self, total_items: usize) {
        *self.aggregator.lock() = RunAggregator::new(total_items);
    }

    pub(crate) fn observe(&self, result: &EvaluationResult) {
        self.aggregator.lock().observe(result);
    }

    pub fn live_metrics(&self) -> RunMetrics {
        self.aggregator.lock().snapshot()
    }

    pub(crate) fn store_result(&self, result: EvaluationResult) {
        self.results.insert(result.dataset_item_id.clone(), result);
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Results in enumeration order.
    pub fn results_page(&self, offset: usize, limit: Option<usize>) -> Vec<EvaluationResult> {
        let mut all: Vec<EvaluationResult> =
            self.results.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.ordinal);
        all.into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Raises the cancellation flag. Returns false if it was already raised.
    pub(crate) fn request_cancel(&self) -> bool {
        !self.cancel.send_replace(true)
    }
}

/// Owning store of every run, keyed by run id.
pub struct RunRegistry {
    runs: DashMap<String, Arc<RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
        }
    }

    pub fn insert(&self, run: ExperimentRun) -> Arc<RunEntry> {
        let id = run.run_id.clone();
        let entry = Arc::new(RunEntry::new(run));
        self.runs.insert(id, entry.clone());
        entry
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunEntry>> {
        self.runs.get(run_id).map(|e| e.value().clone())
    }

    /// Newest first.
    pub fn list(&self, experiment_id: Option<&str>) -> Vec<RunStatusView> {
        let mut runs: Vec<RunStatusView> = self
            .runs
            .iter()
            .map(|e| e.value().view())
            .filter(|v| experiment_id.map_or(true, |id| v.experiment_id == id))
            .collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        runs
    }

    pub fn active_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|e| !e.value().status().is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn result(item: &str, ordinal: usize) -> EvaluationResult {
        EvaluationResult {
            run_id: "run_a".to_string(),
            dataset_item_id: item.to_string(),
            ordinal,
            input_data: Map::new(),
            output_data: Some("x".to_string()),
            metrics: BTreeMap::new(),
            is_success: true,
            error_message: None,
            attempts: 1,
            latency_ms: Some(1.0),
            usage: None,
            cost_usd: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let registry = RunRegistry::new();
        registry.insert(ExperimentRun::new("run_a", "exp-1"));
        assert_eq!(registry.get("run_a").unwrap().snapshot().run_id, "run_a");
        assert!(registry.get("run_b").is_none());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_list_newest_first_and_filtered() {
        let registry = RunRegistry::new();
        let mut old = ExperimentRun::new("run_old", "exp-1");
        old.created_at = Utc::now() - Duration::minutes(5);
        registry.insert(old);
        registry.insert(ExperimentRun::new("run_new", "exp-1"));
        registry.insert(ExperimentRun::new("run_other", "exp-2"));

        let runs = registry.list(Some("exp-1"));
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run_new", "run_old"]);
        assert_eq!(registry.list(None).len(), 3);
    }

    #[test]
    fn test_results_page_in_enumeration_order() {
        let registry = RunRegistry::new();
        let entry = registry.insert(ExperimentRun::new("run_a", "exp-1"));
        entry.store_result(result("c", 2));
        entry.store_result(result("a", 0));
        entry.store_result(result("b", 1));

        let page = entry.results_page(1, Some(1));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].dataset_item_id, "b");
        assert_eq!(entry.results_page(0, None).len(), 3);
    }

    #[test]
    fn test_request_cancel_once() {
        let registry = RunRegistry::new();
        let entry = registry.insert(ExperimentRun::new("run_a", "exp-1"));
        let rx = entry.subscribe_cancel();
        assert!(entry.request_cancel());
        assert!(!entry.request_cancel());
        assert!(*rx.borrow());
        assert!(entry.cancel_requested());
    }

    #[test]
    fn test_cancel_if_idle_only_before_launch() {
        let registry = RunRegistry::new();
        let idle = registry.insert(ExperimentRun::new("run_a", "exp-1"));
        assert!(idle.cancel_if_idle());
        assert_eq!(idle.status(), RunStatus::Cancelled);
        assert!(idle.launch(3).is_err());

        let launched = registry.insert(ExperimentRun::new("run_b", "exp-1"));
        launched.launch(3).unwrap();
        assert!(!launched.cancel_if_idle());
        assert_eq!(launched.status(), RunStatus::Pending);
        assert_eq!(launched.snapshot().total_items, 3);
    }
}
