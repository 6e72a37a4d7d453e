use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::job::{self, EvaluationResult, JobOutcome, JobUnit, RunPlan};
use super::registry::RunEntry;
use super::state::RunStatus;
use crate::catalog::DatasetItem;
use crate::invoker::{ModelCallLimiter, ModelInvoker};
use crate::metrics::Metrics;
use crate::timeseries::{Sample, TimeSeriesSink};

/// Engine-wide collaborators shared by every run.
pub struct Services {
    pub invoker: Arc<dyn ModelInvoker>,
    pub limiter: ModelCallLimiter,
    pub metrics: Arc<Metrics>,
    pub timeseries: Arc<TimeSeriesSink>,
}

/// Executors report here; only the supervisor touches the run's counters.
#[derive(Debug)]
enum WorkerEvent {
    Dispatched,
    Finished(EvaluationResult),
    Discarded { attempts: u32 },
}

type Queue = Arc<Mutex<mpsc::UnboundedReceiver<JobUnit>>>;

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let flagged = *rx.borrow_and_update();
        if flagged {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: no cancellation can arrive any more.
            std::future::pending::<()>().await;
        }
    }
}

async fn executor_loop(
    worker: usize,
    plan: Arc<RunPlan>,
    services: Arc<Services>,
    queue: Queue,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }

        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => None,
                unit = queue.recv() => unit,
            }
        };
        let Some(unit) = next else {
            break;
        };
        if *cancel.borrow() {
            break;
        }

        debug!(run_id = %plan.run_id, worker, item_id = %unit.item.id, "Dispatching item");
        if events.send(WorkerEvent::Dispatched).is_err() {
            break;
        }

        let outcome = job::execute(
            &plan,
            services.invoker.as_ref(),
            &services.limiter,
            unit,
            &cancel,
        )
        .await;

        let event = match outcome {
            JobOutcome::Finished(result) => WorkerEvent::Finished(result),
            JobOutcome::Discarded { attempts } => WorkerEvent::Discarded { attempts },
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!(run_id = %plan.run_id, worker, "Executor drained");
}

/// Drives one run from enumerated items to a terminal state. Returns the
/// status this call moved the run to, or `None` if something else (a cancel
/// while pending) already finalized it.
pub(crate) async fn execute_run(
    entry: Arc<RunEntry>,
    plan: Arc<RunPlan>,
    services: Arc<Services>,
    items: Vec<DatasetItem>,
) -> Option<RunStatus> {
    let total = items.len();
    if let Err(e) = entry.launch(total) {
        debug!(run_id = %plan.run_id, error = %e, "Run finalized before enumeration completed");
        return None;
    }
    entry.reset_aggregator(total);

    let start = Instant::now();
    if total > 0 {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        for (ordinal, item) in items.into_iter().enumerate() {
            let _ = queue_tx.send(JobUnit { ordinal, item });
        }
        drop(queue_tx);
        let queue: Queue = Arc::new(Mutex::new(queue_rx));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let workers = plan.workers.clamp(1, total);
        info!(run_id = %plan.run_id, total_items = total, workers, "Starting run executors");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            handles.push(tokio::spawn(executor_loop(
                worker,
                plan.clone(),
                services.clone(),
                queue.clone(),
                entry.subscribe_cancel(),
                events_tx.clone(),
            )));
        }
        drop(events_tx);

        while let Some(event) = events_rx.recv().await {
            supervise(&entry, &plan, &services, event);
        }
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                error!(run_id = %plan.run_id, error = %e, "Executor task failed");
            }
        }
    }

    finalize(&entry, &plan, &services, start)
}

fn supervise(entry: &RunEntry, plan: &RunPlan, services: &Services, event: WorkerEvent) {
    match event {
        WorkerEvent::Dispatched => {
            entry.update(|r| {
                if r.status == RunStatus::Pending {
                    if let Err(e) = r.transition_to(RunStatus::Running) {
                        warn!(run_id = %plan.run_id, error = %e, "Could not start run");
                    }
                }
            });
        }
        WorkerEvent::Discarded { attempts } => {
            services.metrics.add_attempts(attempts);
        }
        WorkerEvent::Finished(result) => {
            services.metrics.add_attempts(result.attempts);
            if let Err(e) = entry.update(|r| r.record_item(result.is_success)) {
                debug!(run_id = %plan.run_id, item_id = %result.dataset_item_id, error = %e, "Dropping late result");
                return;
            }

            services.metrics.item_finished(result.is_success);
            if result.attempts > 0 {
                let sample = Sample {
                    model: plan.model.model.clone(),
                    at: Utc::now(),
                    latency_ms: result.latency_ms,
                    cost_usd: result.cost_usd.unwrap_or(0.0),
                    tokens: result.usage.map(|u| u.total_tokens).unwrap_or(0),
                    is_error: !result.is_success,
                };
                if let Err(e) = services.timeseries.record(sample) {
                    debug!(run_id = %plan.run_id, error = %e, "Time-series sample skipped");
                }
            }
            entry.observe(&result);
            entry.store_result(result);
        }
    }
}

fn finalize(
    entry: &RunEntry,
    plan: &RunPlan,
    services: &Services,
    start: Instant,
) -> Option<RunStatus> {
    let snapshot = entry.live_metrics();
    let cancel_requested = entry.cancel_requested();

    let finished = entry.update(|r| {
        if r.status.is_terminal() {
            return None;
        }
        let unprocessed = r.total_items - r.processed();
        // A launched run that never dispatched still honours the cancel.
        let target = if cancel_requested && (unprocessed > 0 || r.status == RunStatus::Pending) {
            RunStatus::Cancelled
        } else if unprocessed == 0 {
            RunStatus::Completed
        } else {
            r.error_message = Some(format!("{} items were never processed", unprocessed));
            RunStatus::Failed
        };
        if target == RunStatus::Completed {
            r.metrics = Some(snapshot);
        }
        match r.transition_to(target) {
            Ok(()) => Some((target, r.completed_items, r.failed_items, r.total_items)),
            Err(e) => {
                warn!(run_id = %plan.run_id, error = %e, "Could not finalize run");
                None
            }
        }
    });

    let (status, completed, failed, total) = finished?;
    services.metrics.run_finished(status);
    info!(
        run_id = %plan.run_id,
        experiment_id = %plan.experiment_id,
        status = %status,
        completed_items = completed,
        failed_items = failed,
        total_items = total,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Run finished"
    );
    Some(status)
}
