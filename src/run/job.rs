use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::catalog::{DatasetItem, ModelConfig};
use crate::evaluation::{EvalContext, ResolvedEvaluator};
use crate::invoker::{
    invoke_with_retry, pricing, InvocationOutcome, ModelCallLimiter, ModelInvoker, RetryPolicy,
    Usage,
};
use crate::template;

/// Everything fixed at submission that executors need for every item of a run.
pub struct RunPlan {
    pub run_id: String,
    pub experiment_id: String,
    pub model: ModelConfig,
    pub template: String,
    pub evaluators: Vec<ResolvedEvaluator>,
    pub policy: RetryPolicy,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct JobUnit {
    /// Position in enumeration order.
    pub ordinal: usize,
    pub item: DatasetItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub run_id: String,
    pub dataset_item_id: String,
    #[serde(skip)]
    pub ordinal: usize,
    pub input_data: Map<String, Value>,
    pub output_data: Option<String>,
    pub metrics: BTreeMap<String, Value>,
    pub is_success: bool,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub latency_ms: Option<f64>,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl EvaluationResult {
    fn failed(plan: &RunPlan, unit: JobUnit, error: String, attempts: u32) -> Self {
        Self {
            run_id: plan.run_id.clone(),
            dataset_item_id: unit.item.id,
            ordinal: unit.ordinal,
            input_data: unit.item.input_data,
            output_data: None,
            metrics: BTreeMap::new(),
            is_success: false,
            error_message: Some(error),
            attempts,
            latency_ms: None,
            usage: None,
            cost_usd: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Finished(EvaluationResult),
    /// Cancellation was observed; nothing is recorded for the item.
    Discarded { attempts: u32 },
}

/// Runs one dataset item end to end: render, invoke (with retries), evaluate.
/// Item-level failures are folded into the returned result.
pub async fn execute(
    plan: &RunPlan,
    invoker: &dyn ModelInvoker,
    limiter: &ModelCallLimiter,
    unit: JobUnit,
    cancel: &watch::Receiver<bool>,
) -> JobOutcome {
    let prompt = match template::render(&plan.template, &unit.item.input_data) {
        Ok(p) => p,
        Err(e) => {
            warn!(run_id = %plan.run_id, item_id = %unit.item.id, error = %e, "Prompt rendering failed");
            return JobOutcome::Finished(EvaluationResult::failed(plan, unit, e.to_string(), 0));
        }
    };

    let outcome = invoke_with_retry(invoker, limiter, &plan.model, &prompt, &plan.policy, cancel).await;

    // In-flight calls are not interrupted, but their results no longer count.
    if *cancel.borrow() {
        debug!(run_id = %plan.run_id, item_id = %unit.item.id, "Discarding result after cancellation");
        return JobOutcome::Discarded {
            attempts: outcome.attempts(),
        };
    }

    let (completion, attempts, latency_ms) = match outcome {
        InvocationOutcome::Success {
            completion,
            attempts,
            latency_ms,
        } => (completion, attempts, latency_ms),
        InvocationOutcome::Failed { error, attempts } => {
            warn!(
                run_id = %plan.run_id,
                item_id = %unit.item.id,
                attempts,
                error = %error,
                "Item failed after exhausting retries"
            );
            return JobOutcome::Finished(EvaluationResult::failed(
                plan,
                unit,
                error.to_string(),
                attempts,
            ));
        }
        InvocationOutcome::Cancelled { attempts } => return JobOutcome::Discarded { attempts },
    };

    let cost_usd = pricing::cost_usd(&plan.model.model, &completion.usage);
    let ctx = EvalContext {
        input_data: &unit.item.input_data,
        expected_output: unit.item.expected_output.as_deref(),
        actual_output: &completion.text,
        latency_ms,
        cost_usd,
        cancel,
    };

    let mut metrics = BTreeMap::new();
    for resolved in &plan.evaluators {
        match resolved.evaluator.score(&ctx).await {
            Ok(score) if score.value.is_finite() => {
                metrics.insert(resolved.key.clone(), json!(score.value));
                if let Some(passed) = score.passed {
                    metrics.insert(format!("{}_passed", resolved.key), Value::Bool(passed));
                }
            }
            Ok(score) => {
                warn!(run_id = %plan.run_id, item_id = %unit.item.id, evaluator = %resolved.key, value = score.value, "Evaluator returned a non-finite score");
                metrics.insert(resolved.key.clone(), Value::Null);
            }
            Err(e) => {
                warn!(run_id = %plan.run_id, item_id = %unit.item.id, evaluator = %resolved.key, error = %e, "Evaluator failed");
                metrics.insert(resolved.key.clone(), Value::Null);
            }
        }
    }

    // An evaluator may have seen the flag mid-scoring (the judge's own calls).
    if *cancel.borrow() {
        debug!(run_id = %plan.run_id, item_id = %unit.item.id, "Discarding scored result after cancellation");
        return JobOutcome::Discarded { attempts };
    }

    JobOutcome::Finished(EvaluationResult {
        run_id: plan.run_id.clone(),
        dataset_item_id: unit.item.id,
        ordinal: unit.ordinal,
        input_data: unit.item.input_data,
        output_data: Some(completion.text),
        metrics,
        is_success: true,
        error_message: None,
        attempts,
        latency_ms: Some(latency_ms),
        usage: Some(completion.usage),
        cost_usd: Some(cost_usd),
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EvaluatorConfig;
    use crate::evaluation::evaluator::testing::{
        build_context, build_context_with, registry_with_broken,
    };
    use crate::evaluation::EvaluatorRegistry;
    use crate::invoker::testing::{Behavior, ScriptedInvoker};
    use crate::invoker::{Completion, InvokeError};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Judge backend that raises the run's cancel flag from inside its call.
    struct CancellingJudge {
        cancel: watch::Sender<bool>,
    }

    #[async_trait]
    impl ModelInvoker for CancellingJudge {
        fn validate(&self, _model: &ModelConfig) -> Result<(), String> {
            Ok(())
        }

        async fn invoke(&self, _model: &ModelConfig, _prompt: &str) -> Result<Completion, InvokeError> {
            self.cancel.send_replace(true);
            Err(InvokeError::Transient("503 upstream".to_string()))
        }
    }

    fn item(id: &str, city: &str, expected: Option<&str>) -> DatasetItem {
        let mut input = Map::new();
        input.insert("country".to_string(), json!(city));
        DatasetItem {
            id: id.to_string(),
            input_data: input,
            expected_output: expected.map(str::to_string),
        }
    }

    fn plan(template: &str, evaluators: &[EvaluatorConfig], max_retries: u32) -> RunPlan {
        let evaluators = registry_with_broken()
            .resolve(evaluators, &build_context())
            .unwrap();
        RunPlan {
            run_id: "run_test".to_string(),
            experiment_id: "exp-1".to_string(),
            model: ModelConfig::new("openai", "gpt-4"),
            template: template.to_string(),
            evaluators,
            policy: RetryPolicy {
                timeout: Duration::from_secs(1),
                max_retries,
                backoff: Duration::ZERO,
            },
            workers: 1,
        }
    }

    fn unit(item: DatasetItem) -> JobUnit {
        JobUnit { ordinal: 0, item }
    }

    #[tokio::test]
    async fn test_successful_item_merges_scores() {
        let plan = plan(
            "Capital of {country}?",
            &[EvaluatorConfig::new("exact_match"), EvaluatorConfig::new("latency")],
            0,
        );
        let invoker = ScriptedInvoker::reply(|_| "Paris".to_string());
        let (_tx, rx) = watch::channel(false);

        let outcome = execute(
            &plan,
            &invoker,
            &ModelCallLimiter::new(1),
            unit(item("fr", "France", Some("paris"))),
            &rx,
        )
        .await;

        let JobOutcome::Finished(result) = outcome else {
            panic!("expected a finished result");
        };
        assert!(result.is_success);
        assert_eq!(result.output_data.as_deref(), Some("Paris"));
        assert_eq!(result.metrics["exact_match"], json!(1.0));
        assert_eq!(result.metrics["exact_match_passed"], json!(true));
        assert!(result.metrics.contains_key("latency"));
        assert_eq!(result.usage, Some(Usage::new(40, 10)));
    }

    #[tokio::test]
    async fn test_failing_evaluator_is_isolated() {
        let plan = plan(
            "{country}",
            &[EvaluatorConfig::new("broken"), EvaluatorConfig::new("exact_match")],
            0,
        );
        let invoker = ScriptedInvoker::reply(|_| "Tokyo".to_string());
        let (_tx, rx) = watch::channel(false);

        let JobOutcome::Finished(result) = execute(
            &plan,
            &invoker,
            &ModelCallLimiter::new(1),
            unit(item("jp", "Japan", Some("Tokyo"))),
            &rx,
        )
        .await
        else {
            panic!("expected a finished result");
        };

        assert!(result.is_success);
        assert_eq!(result.metrics["broken"], Value::Null);
        assert!(!result.metrics.contains_key("broken_passed"));
        assert_eq!(result.metrics["exact_match"], json!(1.0));
    }

    #[tokio::test]
    async fn test_template_error_fails_item_without_invoking() {
        let plan = plan("{missing}", &[], 3);
        let invoker = ScriptedInvoker::reply(|_| "x".to_string());
        let (_tx, rx) = watch::channel(false);

        let JobOutcome::Finished(result) = execute(
            &plan,
            &invoker,
            &ModelCallLimiter::new(1),
            unit(item("a", "A", None)),
            &rx,
        )
        .await
        else {
            panic!("expected a finished result");
        };

        assert!(!result.is_success);
        assert!(result.error_message.unwrap().contains("missing"));
        assert_eq!(invoker.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let plan = plan("{country}", &[EvaluatorConfig::new("exact_match")], 2);
        let invoker = ScriptedInvoker::new(Behavior::Transient);
        let (_tx, rx) = watch::channel(false);

        let outcome = execute(
            &plan,
            &invoker,
            &ModelCallLimiter::new(1),
            unit(item("a", "A", Some("a"))),
            &rx,
        )
        .await;

        assert_eq!(invoker.calls(), 3);
        let JobOutcome::Finished(result) = outcome else {
            panic!("expected a finished result");
        };
        assert!(!result.is_success);
        assert_eq!(result.attempts, 3);
        assert!(result.error_message.is_some());
        assert!(result.metrics.is_empty());
    }

    #[tokio::test]
    async fn test_result_discarded_after_cancel() {
        let plan = plan("{country}", &[], 0);
        let invoker = ScriptedInvoker::reply(|_| "x".to_string());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = execute(
            &plan,
            &invoker,
            &ModelCallLimiter::new(1),
            unit(item("a", "A", None)),
            &rx,
        )
        .await;
        assert!(matches!(outcome, JobOutcome::Discarded { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_result_discarded_when_cancelled_during_scoring() {
        let (tx, rx) = watch::channel(false);
        let judge_ctx = build_context_with(Arc::new(CancellingJudge { cancel: tx }));
        let evaluators = EvaluatorRegistry::with_builtins()
            .resolve(&[EvaluatorConfig::new("llm_judge")], &judge_ctx)
            .unwrap();
        let mut plan = plan("{country}", &[], 0);
        plan.evaluators = evaluators;
        let invoker = ScriptedInvoker::reply(|_| "Paris".to_string());

        let outcome = execute(
            &plan,
            &invoker,
            &ModelCallLimiter::new(2),
            unit(item("fr", "France", Some("Paris"))),
            &rx,
        )
        .await;

        assert!(*rx.borrow());
        assert_eq!(invoker.calls(), 1);
        assert!(matches!(outcome, JobOutcome::Discarded { attempts: 1 }));
    }
}
