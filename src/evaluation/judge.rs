use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::evaluator::{opt_str, threshold, EvalContext, Evaluator, EvaluatorRegistry, Score};
use crate::catalog::ModelConfig;
use crate::error::EngineError;
use crate::invoker::{invoke_with_retry, InvocationOutcome, ModelCallLimiter, ModelInvoker, RetryPolicy};

const DEFAULT_JUDGE_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_THRESHOLD: f64 = 0.7;
const JUDGE_MAX_TOKENS: u32 = 16;

pub(crate) fn register(registry: &mut EvaluatorRegistry) {
    registry.register(
        "llm_judge",
        Arc::new(|cfg, ctx| {
            let model_name = opt_str(cfg, "judge_model", DEFAULT_JUDGE_MODEL)?;
            let provider = opt_str(cfg, "judge_provider", &ctx.model.provider)?;
            let mut model = ModelConfig::new(provider, model_name);
            model.temperature = 0.0;
            model.max_tokens = JUDGE_MAX_TOKENS;
            ctx.invoker.validate(&model)?;

            Ok(Arc::new(LlmJudge {
                invoker: ctx.invoker.clone(),
                limiter: ctx.limiter.clone(),
                model,
                policy: ctx.policy,
                threshold: threshold(cfg, DEFAULT_THRESHOLD)?,
            }) as Arc<dyn Evaluator>)
        }),
    );
}

/// Asks a judge model to rate the output on a 0-1 scale.
pub struct LlmJudge {
    invoker: Arc<dyn ModelInvoker>,
    limiter: ModelCallLimiter,
    model: ModelConfig,
    policy: RetryPolicy,
    threshold: f64,
}

fn judge_prompt(ctx: &EvalContext<'_>) -> String {
    let input = Value::Object(ctx.input_data.clone());
    format!(
        "You are evaluating the quality of an AI model's response.\n\n\
         Input: {}\n\
         Expected Output: {}\n\
         Actual Output: {}\n\n\
         Rate the actual output on a scale of 0.0 to 1.0 based on how well it matches the \
         expected output and answers the input correctly.\n\n\
         Respond with only a number between 0.0 and 1.0.",
        input,
        ctx.expected_output.unwrap_or("(none)"),
        ctx.actual_output
    )
}

/// First decimal number appearing in the reply.
fn parse_score(reply: &str) -> Option<f64> {
    let bytes = reply.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = if i > 0 && bytes[i - 1] == b'-' { i - 1 } else { i };
            let mut end = i;
            let mut seen_dot = false;
            while end < bytes.len()
                && (bytes[end].is_ascii_digit() || (bytes[end] == b'.' && !seen_dot))
            {
                if bytes[end] == b'.' {
                    seen_dot = true;
                }
                end += 1;
            }
            let text = reply[start..end].trim_end_matches('.');
            return text.parse().ok();
        }
        i += 1;
    }
    None
}

#[async_trait]
impl Evaluator for LlmJudge {
    fn kind(&self) -> &'static str {
        "llm_judge"
    }

    async fn score(&self, ctx: &EvalContext<'_>) -> Result<Score, EngineError> {
        let prompt = judge_prompt(ctx);
        let outcome = invoke_with_retry(
            self.invoker.as_ref(),
            &self.limiter,
            &self.model,
            &prompt,
            &self.policy,
            ctx.cancel,
        )
        .await;

        let reply = match outcome {
            InvocationOutcome::Success { completion, .. } => completion.text,
            InvocationOutcome::Failed { error, attempts } => {
                return Err(EngineError::Evaluator(format!(
                    "judge call failed after {} attempt(s): {}",
                    attempts, error
                )))
            }
            InvocationOutcome::Cancelled { .. } => {
                return Err(EngineError::Evaluator("judge call cancelled".to_string()))
            }
        };

        let raw = parse_score(&reply).ok_or_else(|| {
            EngineError::Evaluator(format!("judge reply has no score: {:?}", reply))
        })?;
        let value = raw.clamp(0.0, 1.0);
        debug!(judge = %self.model.model, raw, value, "Judge scored output");
        Ok(Score::with_pass(value, value >= self.threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::super::evaluator::testing::{build_context_with, Fixture};
    use super::*;
    use crate::catalog::EvaluatorConfig;
    use crate::invoker::testing::{Behavior, ScriptedInvoker};
    use serde_json::json;

    fn judge(invoker: Arc<ScriptedInvoker>) -> Arc<dyn Evaluator> {
        let registry = EvaluatorRegistry::with_builtins();
        let resolved = registry
            .resolve(
                &[EvaluatorConfig::new("llm_judge").with_option("threshold", json!(0.5))],
                &build_context_with(invoker),
            )
            .unwrap();
        resolved[0].evaluator.clone()
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("0.85"), Some(0.85));
        assert_eq!(parse_score("Score: 0.4 out of 1"), Some(0.4));
        assert_eq!(parse_score("1."), Some(1.0));
        assert_eq!(parse_score("-0.3"), Some(-0.3));
        assert_eq!(parse_score("no idea"), None);
    }

    #[tokio::test]
    async fn test_judge_scores_and_clamps() {
        let invoker = Arc::new(ScriptedInvoker::reply(|_| "Rating: 7".to_string()));
        let eval = judge(invoker.clone());
        let fx = Fixture::new(Some("Paris"), "Paris");

        let score = eval.score(&fx.ctx()).await.unwrap();
        assert_eq!(score, Score::with_pass(1.0, true));
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test]
    async fn test_judge_prompt_carries_item() {
        let invoker = Arc::new(ScriptedInvoker::reply(|prompt| {
            if prompt.contains("Expected Output: Paris") && prompt.contains("Actual Output: Lyon") {
                "0.2".to_string()
            } else {
                "1.0".to_string()
            }
        }));
        let eval = judge(invoker);
        let fx = Fixture::new(Some("Paris"), "Lyon");
        assert_eq!(eval.score(&fx.ctx()).await.unwrap(), Score::with_pass(0.2, false));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_error() {
        let eval = judge(Arc::new(ScriptedInvoker::reply(|_| "excellent".to_string())));
        let fx = Fixture::new(Some("a"), "a");
        assert!(matches!(eval.score(&fx.ctx()).await, Err(EngineError::Evaluator(_))));
    }

    #[tokio::test]
    async fn test_judge_retries_then_errors() {
        let invoker = Arc::new(ScriptedInvoker::new(Behavior::Transient));
        let eval = judge(invoker.clone());
        let fx = Fixture::new(Some("a"), "a");

        assert!(eval.score(&fx.ctx()).await.is_err());
        // max_retries = 1 in the test build context
        assert_eq!(invoker.calls(), 2);
    }

    #[test]
    fn test_unsupported_judge_provider_is_configuration_error() {
        let registry = EvaluatorRegistry::with_builtins();
        let cfg = EvaluatorConfig::new("llm_judge").with_option("judge_provider", json!("unsupported"));
        let result = registry.resolve(
            &[cfg],
            &build_context_with(Arc::new(ScriptedInvoker::reply(|_| "1".to_string()))),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
