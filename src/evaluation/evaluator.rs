use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::catalog::{EvaluatorConfig, ModelConfig};
use crate::error::EngineError;
use crate::invoker::{ModelCallLimiter, ModelInvoker, RetryPolicy};

/// Numeric score plus the pass/fail verdict for threshold-style evaluators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub value: f64,
    pub passed: Option<bool>,
}

impl Score {
    pub fn value(value: f64) -> Self {
        Self {
            value,
            passed: None,
        }
    }

    pub fn with_pass(value: f64, passed: bool) -> Self {
        Self {
            value,
            passed: Some(passed),
        }
    }
}

/// Everything an evaluator may look at for one item.
pub struct EvalContext<'a> {
    pub input_data: &'a Map<String, Value>,
    pub expected_output: Option<&'a str>,
    pub actual_output: &'a str,
    /// Measured duration of the successful model invocation.
    pub latency_ms: f64,
    pub cost_usd: f64,
    pub cancel: &'a watch::Receiver<bool>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Errors are reported as `EngineError::Evaluator` and only null this evaluator's score.
    async fn score(&self, ctx: &EvalContext<'_>) -> Result<Score, EngineError>;
}

/// Collaborators available to evaluators while they are being built.
#[derive(Clone)]
pub struct BuildContext {
    pub invoker: Arc<dyn ModelInvoker>,
    pub limiter: ModelCallLimiter,
    pub model: ModelConfig,
    pub policy: RetryPolicy,
}

pub type EvaluatorFactory = Arc<
    dyn Fn(&Map<String, Value>, &BuildContext) -> Result<Arc<dyn Evaluator>, String> + Send + Sync,
>;

#[derive(Clone)]
pub struct ResolvedEvaluator {
    pub key: String,
    pub evaluator: Arc<dyn Evaluator>,
}

/// Resolves evaluator configurations by name. Resolution happens once, at run
/// submission; unknown names never reach execution.
pub struct EvaluatorRegistry {
    factories: HashMap<String, EvaluatorFactory>,
}

impl EvaluatorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        super::builtin::register(&mut registry);
        super::similarity::register(&mut registry);
        super::judge::register(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, factory: EvaluatorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(
        &self,
        configs: &[EvaluatorConfig],
        ctx: &BuildContext,
    ) -> Result<Vec<ResolvedEvaluator>, EngineError> {
        let mut keys = HashSet::new();
        let mut resolved = Vec::with_capacity(configs.len());

        for cfg in configs {
            let factory = self.factories.get(&cfg.name).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "unknown evaluator '{}' (available: {})",
                    cfg.name,
                    self.names().join(", ")
                ))
            })?;

            let key = cfg.key().to_string();
            if key.is_empty() {
                return Err(EngineError::Configuration(
                    "evaluator label must not be empty".to_string(),
                ));
            }
            if !keys.insert(key.clone()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate evaluator key '{}'; set a distinct label",
                    key
                )));
            }

            let evaluator = factory(&cfg.config, ctx).map_err(|e| {
                EngineError::Configuration(format!("evaluator '{}': {}", key, e))
            })?;
            debug!(evaluator = %key, kind = evaluator.kind(), "Resolved evaluator");
            resolved.push(ResolvedEvaluator { key, evaluator });
        }

        Ok(resolved)
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub(crate) fn opt_bool(cfg: &Map<String, Value>, key: &str, default: bool) -> Result<bool, String> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(format!("'{}' must be a boolean, got {}", key, other)),
    }
}

pub(crate) fn opt_f64(cfg: &Map<String, Value>, key: &str, default: f64) -> Result<f64, String> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("'{}' must be a finite number", key)),
        Some(other) => Err(format!("'{}' must be a number, got {}", key, other)),
    }
}

pub(crate) fn opt_str(
    cfg: &Map<String, Value>,
    key: &str,
    default: &str,
) -> Result<String, String> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(other) => Err(format!("'{}' must be a non-empty string, got {}", key, other)),
    }
}

/// Thresholds live in [0, 1].
pub(crate) fn threshold(cfg: &Map<String, Value>, default: f64) -> Result<f64, String> {
    let t = opt_f64(cfg, "threshold", default)?;
    if !(0.0..=1.0).contains(&t) {
        return Err(format!("threshold {} is out of range [0, 1]", t));
    }
    Ok(t)
}

pub(crate) fn require_expected<'a>(ctx: &EvalContext<'a>) -> Result<&'a str, EngineError> {
    ctx.expected_output
        .ok_or_else(|| EngineError::Evaluator("item has no expected output".to_string()))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let names = EvaluatorRegistry::with_builtins().names();
        assert_eq!(
            names,
            vec!["cost", "exact_match", "latency", "llm_judge", "semantic_similarity"]
        );
    }

    #[test]
    fn test_resolve_unknown_name_fails_fast() {
        let registry = EvaluatorRegistry::with_builtins();
        let err = registry
            .resolve(&[EvaluatorConfig::new("bleu")], &build_context())
            .err()
            .unwrap();
        match err {
            EngineError::Configuration(msg) => assert!(msg.contains("bleu")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_duplicate_keys() {
        let registry = EvaluatorRegistry::with_builtins();
        let configs = vec![
            EvaluatorConfig::new("exact_match"),
            EvaluatorConfig::new("exact_match"),
        ];
        assert!(registry.resolve(&configs, &build_context()).is_err());

        let configs = vec![
            EvaluatorConfig::new("exact_match"),
            EvaluatorConfig::new("exact_match")
                .with_label("exact_match_cs")
                .with_option("case_sensitive", json!(true)),
        ];
        let resolved = registry.resolve(&configs, &build_context()).unwrap();
        assert_eq!(resolved[1].key, "exact_match_cs");
    }

    #[test]
    fn test_resolve_invalid_option_type() {
        let registry = EvaluatorRegistry::with_builtins();
        let configs =
            vec![EvaluatorConfig::new("exact_match").with_option("case_sensitive", json!("yes"))];
        assert!(matches!(
            registry.resolve(&configs, &build_context()),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_option_helpers() {
        let cfg = json!({"flag": true, "n": 0.5, "s": "gpt-4", "bad": "x"});
        let cfg = cfg.as_object().unwrap();
        assert!(opt_bool(cfg, "flag", false).unwrap());
        assert!(!opt_bool(cfg, "missing", false).unwrap());
        assert_eq!(opt_f64(cfg, "n", 1.0).unwrap(), 0.5);
        assert!(opt_f64(cfg, "bad", 1.0).is_err());
        assert_eq!(opt_str(cfg, "s", "x").unwrap(), "gpt-4");
        assert!(threshold(&json!({"threshold": 1.5}).as_object().unwrap().clone(), 0.5).is_err());
    }
}
