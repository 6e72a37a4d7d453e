//! Deterministic evaluators: exact match plus the latency and cost budgets.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::evaluator::{
    opt_bool, opt_f64, require_expected, EvalContext, Evaluator, EvaluatorRegistry, Score,
};
use crate::error::EngineError;

const DEFAULT_MAX_LATENCY_MS: f64 = 5000.0;
const DEFAULT_MAX_COST_USD: f64 = 0.10;

pub(crate) fn register(registry: &mut EvaluatorRegistry) {
    registry.register(
        "exact_match",
        Arc::new(|cfg, _| Ok(Arc::new(ExactMatch::from_config(cfg)?) as Arc<dyn Evaluator>)),
    );
    registry.register(
        "latency",
        Arc::new(|cfg, _| {
            let max = positive(cfg, "max_latency_ms", DEFAULT_MAX_LATENCY_MS)?;
            Ok(Arc::new(Budget::latency(max)) as Arc<dyn Evaluator>)
        }),
    );
    registry.register(
        "cost",
        Arc::new(|cfg, _| {
            let max = positive(cfg, "max_cost_usd", DEFAULT_MAX_COST_USD)?;
            Ok(Arc::new(Budget::cost(max)) as Arc<dyn Evaluator>)
        }),
    );
}

fn positive(cfg: &Map<String, Value>, key: &str, default: f64) -> Result<f64, String> {
    let v = opt_f64(cfg, key, default)?;
    if v <= 0.0 {
        return Err(format!("'{}' must be greater than zero", key));
    }
    Ok(v)
}

pub struct ExactMatch {
    case_sensitive: bool,
}

impl ExactMatch {
    pub fn new(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }

    fn from_config(cfg: &Map<String, Value>) -> Result<Self, String> {
        Ok(Self::new(opt_bool(cfg, "case_sensitive", false)?))
    }

    fn matches(&self, expected: &str, actual: &str) -> bool {
        let (expected, actual) = (expected.trim(), actual.trim());
        if self.case_sensitive {
            expected == actual
        } else {
            expected.to_lowercase() == actual.to_lowercase()
        }
    }
}

#[async_trait]
impl Evaluator for ExactMatch {
    fn kind(&self) -> &'static str {
        "exact_match"
    }

    async fn score(&self, ctx: &EvalContext<'_>) -> Result<Score, EngineError> {
        let expected = require_expected(ctx)?;
        let matched = self.matches(expected, ctx.actual_output);
        Ok(Score::with_pass(if matched { 1.0 } else { 0.0 }, matched))
    }
}

#[derive(Debug, Clone, Copy)]
enum Measure {
    Latency,
    Cost,
}

/// Scores a measured quantity against a budget: `1 - 0.5 * used / max` while
/// within budget, 0 beyond it.
pub struct Budget {
    measure: Measure,
    max: f64,
}

impl Budget {
    pub fn latency(max_ms: f64) -> Self {
        Self {
            measure: Measure::Latency,
            max: max_ms,
        }
    }

    pub fn cost(max_usd: f64) -> Self {
        Self {
            measure: Measure::Cost,
            max: max_usd,
        }
    }

    fn score_for(&self, used: f64) -> Score {
        let within = used <= self.max;
        let value = if within {
            (1.0 - 0.5 * used / self.max).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Score::with_pass(value, within)
    }
}

#[async_trait]
impl Evaluator for Budget {
    fn kind(&self) -> &'static str {
        match self.measure {
            Measure::Latency => "latency",
            Measure::Cost => "cost",
        }
    }

    async fn score(&self, ctx: &EvalContext<'_>) -> Result<Score, EngineError> {
        let used = match self.measure {
            Measure::Latency => ctx.latency_ms,
            Measure::Cost => ctx.cost_usd,
        };
        if !used.is_finite() || used < 0.0 {
            return Err(EngineError::Evaluator(format!(
                "invalid {} measurement: {}",
                self.kind(),
                used
            )));
        }
        Ok(self.score_for(used))
    }
}
