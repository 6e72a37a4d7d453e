use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::job::EvaluationResult;

/// Running statistics over one numeric series. The mean is updated
/// incrementally so it stays accurate while the run is still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl MetricStats {
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.mean += (value - self.mean) / self.count as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub evaluator_scores: BTreeMap<String, MetricStats>,
}

/// Streaming per-run aggregation of evaluation results.
#[derive(Debug, Clone, Default)]
pub struct RunAggregator {
    total_items: usize,
    successful: usize,
    failed: usize,
    latency: MetricStats,
    total_cost_usd: f64,
    total_tokens: u64,
    scores: BTreeMap<String, MetricStats>,
}

impl RunAggregator {
    pub fn new(total_items: usize) -> Self {
        Self {
            total_items,
            ..Default::default()
        }
    }

    pub fn observe(&mut self, result: &EvaluationResult) {
        if result.is_success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        if let Some(latency) = result.latency_ms {
            self.latency.push(latency);
        }
        if let Some(cost) = result.cost_usd {
            self.total_cost_usd += cost;
        }
        if let Some(usage) = result.usage {
            self.total_tokens += usage.total_tokens;
        }

        for (key, value) in &result.metrics {
            let numeric = match value {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            if let Some(v) = numeric {
                self.scores.entry(key.clone()).or_default().push(v);
            }
        }
    }

    pub fn snapshot(&self) -> RunMetrics {
        let processed = self.successful + self.failed;
        RunMetrics {
            total_items: self.total_items,
            successful_items: self.successful,
            failed_items: self.failed,
            success_rate: if processed == 0 {
                0.0
            } else {
                self.successful as f64 / processed as f64
            },
            avg_latency_ms: self.latency.mean,
            total_cost_usd: self.total_cost_usd,
            total_tokens: self.total_tokens,
            evaluator_scores: self.scores.clone(),
        }
    }
}
