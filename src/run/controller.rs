use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use super::aggregator::RunMetrics;
use super::job::{EvaluationResult, RunPlan};
use super::pool::{self, Services};
use super::registry::{RunEntry, RunRegistry};
use super::state::{ExperimentRun, RunStatus, RunStatusView};
use crate::catalog::Catalog;
use crate::error::{EngineError, Result};
use crate::evaluation::{BuildContext, EvaluatorRegistry};
use crate::invoker::{ModelCallLimiter, ModelInvoker, RetryPolicy};
use crate::metrics::Metrics;
use crate::timeseries::TimeSeriesSink;

/// Returned by `submit`: the freshly created, still pending run.
#[derive(Debug, Clone, Serialize)]
pub struct RunHandle {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub metrics: Option<RunMetrics>,
    pub created_at: DateTime<Utc>,
}

impl From<&ExperimentRun> for RunHandle {
    fn from(run: &ExperimentRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            experiment_id: run.experiment_id.clone(),
            status: run.status,
            total_items: run.total_items,
            completed_items: run.completed_items,
            failed_items: run.failed_items,
            metrics: run.metrics.clone(),
            created_at: run.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResults {
    pub run_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub progress_percentage: f64,
    pub error_message: Option<String>,
    pub metrics: Option<RunMetrics>,
    /// Aggregates so far, while the run is not terminal.
    pub live_metrics: Option<RunMetrics>,
    pub total_results: usize,
    pub evaluation_results: Vec<EvaluationResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub message: String,
    pub run_id: String,
    pub status: RunStatus,
}

/// Coordinates every run: validates and creates runs, hands them to a worker
/// pool, and answers status/result/cancel queries from the registry.
pub struct RunController {
    catalog: Arc<Catalog>,
    registry: Arc<RunRegistry>,
    evaluators: Arc<EvaluatorRegistry>,
    services: Arc<Services>,
    max_parallel_workers: usize,
}

impl RunController {
    pub fn new(
        catalog: Arc<Catalog>,
        invoker: Arc<dyn ModelInvoker>,
        limiter: ModelCallLimiter,
        metrics: Arc<Metrics>,
        timeseries: Arc<TimeSeriesSink>,
        max_parallel_workers: usize,
    ) -> Self {
        Self {
            catalog,
            registry: Arc::new(RunRegistry::new()),
            evaluators: Arc::new(EvaluatorRegistry::with_builtins()),
            services: Arc::new(Services {
                invoker,
                limiter,
                metrics,
                timeseries,
            }),
            max_parallel_workers: max_parallel_workers.max(1),
        }
    }

    #[cfg(test)]
    pub fn with_evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = Arc::new(evaluators);
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn limiter(&self) -> &ModelCallLimiter {
        &self.services.limiter
    }

    /// Validates the experiment, registers a pending run and starts it in the
    /// background. Must be called from within a tokio runtime.
    pub fn submit(&self, experiment_id: &str) -> Result<RunHandle> {
        let experiment = self
            .catalog
            .experiment(experiment_id)
            .ok_or_else(|| EngineError::NotFound(format!("Experiment {} not found", experiment_id)))?;
        let prompt = self.catalog.prompt(&experiment.prompt_id).ok_or_else(|| {
            EngineError::Configuration(format!(
                "prompt {} referenced by experiment {} does not exist",
                experiment.prompt_id, experiment.id
            ))
        })?;

        experiment.execution_config.validate()?;
        self.services
            .invoker
            .validate(&experiment.model_configuration)
            .map_err(|e| EngineError::Configuration(format!("model configuration: {}", e)))?;

        let policy = RetryPolicy::from_execution(&experiment.execution_config);
        let build_ctx = BuildContext {
            invoker: self.services.invoker.clone(),
            limiter: self.services.limiter.clone(),
            model: experiment.model_configuration.clone(),
            policy,
        };
        let evaluators = self
            .evaluators
            .resolve(&experiment.evaluation_config.evaluators, &build_ctx)?;

        let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
        let entry = self
            .registry
            .insert(ExperimentRun::new(&run_id, &experiment.id));
        self.services.metrics.run_submitted();

        let plan = Arc::new(RunPlan {
            run_id: run_id.clone(),
            experiment_id: experiment.id.clone(),
            model: experiment.model_configuration.clone(),
            template: prompt.template.clone(),
            evaluators,
            policy,
            workers: experiment
                .execution_config
                .effective_workers(self.max_parallel_workers),
        });

        info!(
            run_id = %run_id,
            experiment_id = %experiment.id,
            dataset_id = %experiment.dataset_id,
            model = %experiment.model_configuration.model,
            workers = plan.workers,
            "Run submitted"
        );

        let handle = RunHandle::from(&entry.snapshot());
        let catalog = self.catalog.clone();
        let services = self.services.clone();
        let dataset_id = experiment.dataset_id.clone();

        tokio::spawn(async move {
            match catalog.enumerate(&dataset_id) {
                Ok(items) => {
                    pool::execute_run(entry, plan, services, items).await;
                }
                Err(e) => {
                    let failed = entry.update(|r| {
                        if r.status.is_terminal() {
                            return false;
                        }
                        r.error_message = Some(e.to_string());
                        r.transition_to(RunStatus::Failed).is_ok()
                    });
                    if failed {
                        services.metrics.run_finished(RunStatus::Failed);
                        error!(run_id = %plan.run_id, error = %e, "Run failed before dispatch");
                    }
                }
            }
        });

        Ok(handle)
    }

    pub fn get_status(&self, run_id: &str) -> Result<RunStatusView> {
        Ok(self.entry(run_id)?.view())
    }

    /// Partial results while running, all of them once terminal.
    pub fn get_results(
        &self,
        run_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<RunResults> {
        let entry = self.entry(run_id)?;
        let run = entry.snapshot();
        let total_results = entry.result_count();
        if total_results == 0 && !run.status.is_terminal() {
            return Err(EngineError::ResultsNotReady(run_id.to_string()));
        }

        let live_metrics = (!run.status.is_terminal()).then(|| entry.live_metrics());
        Ok(RunResults {
            progress_percentage: run.progress_percentage(),
            run_id: run.run_id,
            status: run.status,
            total_items: run.total_items,
            completed_items: run.completed_items,
            failed_items: run.failed_items,
            error_message: run.error_message,
            metrics: run.metrics,
            live_metrics,
            total_results,
            evaluation_results: entry.results_page(offset, limit),
        })
    }

    /// Idempotent. A terminal run reports its existing status.
    pub fn cancel(&self, run_id: &str) -> Result<CancelOutcome> {
        let entry = self.entry(run_id)?;
        let status = entry.status();
        if status.is_terminal() {
            return Ok(CancelOutcome {
                message: format!("Run is already {}", status),
                run_id: run_id.to_string(),
                status,
            });
        }

        let first_request = entry.request_cancel();
        if entry.cancel_if_idle() {
            self.services.metrics.run_finished(RunStatus::Cancelled);
        }
        if first_request {
            info!(run_id = %run_id, was = %status, "Run cancellation requested");
        }

        Ok(CancelOutcome {
            message: "Run cancelled successfully".to_string(),
            run_id: run_id.to_string(),
            status: RunStatus::Cancelled,
        })
    }

    pub fn list_runs(&self, experiment_id: Option<&str>) -> Vec<RunStatusView> {
        self.registry.list(experiment_id)
    }

    fn entry(&self, run_id: &str) -> Result<Arc<RunEntry>> {
        self.registry
            .get(run_id)
            .ok_or_else(|| EngineError::NotFound(format!("Run {} not found", run_id)))
    }
}
