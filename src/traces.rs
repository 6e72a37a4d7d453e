//! Production trace ingestion. A write path beside the run engine: traces are
//! stored as-is and feed the time-series sink when they carry enough data.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::EngineError;
use crate::timeseries::{Sample, TimeSeriesSink};

#[derive(Debug, Clone, Deserialize)]
pub struct TraceRequest {
    pub prompt_id: String,
    #[serde(default)]
    pub input_data: Option<Value>,
    #[serde(default)]
    pub output_data: Option<Value>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default = "default_success")]
    pub is_success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub trace_id: String,
    pub prompt_id: String,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub latency_ms: Option<f64>,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
    pub model_name: Option<String>,
    pub model_provider: Option<String>,
    pub is_success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn non_negative(name: &str, value: Option<f64>) -> Result<(), EngineError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(EngineError::BadRequest(format!(
            "{} must be a non-negative number",
            name
        ))),
        _ => Ok(()),
    }
}

pub struct TraceStore {
    traces: DashMap<String, Arc<Trace>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self {
            traces: DashMap::new(),
        }
    }

    pub fn ingest(
        &self,
        req: TraceRequest,
        catalog: &Catalog,
        timeseries: &TimeSeriesSink,
    ) -> Result<Arc<Trace>, EngineError> {
        if catalog.prompt(&req.prompt_id).is_none() {
            return Err(EngineError::NotFound(format!(
                "Prompt {} not found",
                req.prompt_id
            )));
        }
        non_negative("latency_ms", req.latency_ms)?;
        non_negative("cost_usd", req.cost_usd)?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let trace = Arc::new(Trace {
            trace_id: format!("trace_{}", &id[..12]),
            prompt_id: req.prompt_id,
            input_data: req.input_data,
            output_data: req.output_data,
            latency_ms: req.latency_ms,
            tokens_used: req.tokens_used,
            cost_usd: req.cost_usd,
            model_name: req.model_name,
            model_provider: req.model_provider,
            is_success: req.is_success,
            error_message: req.error_message,
            created_at: Utc::now(),
        });

        if let (Some(latency), Some(cost), Some(model)) =
            (trace.latency_ms, trace.cost_usd, trace.model_name.as_ref())
        {
            let sample = Sample {
                model: model.clone(),
                at: trace.created_at,
                latency_ms: Some(latency),
                cost_usd: cost,
                tokens: trace.tokens_used.unwrap_or(0),
                is_error: !trace.is_success,
            };
            if let Err(e) = timeseries.record(sample) {
                debug!(trace_id = %trace.trace_id, error = %e, "Trace not added to time series");
            }
        }

        self.traces.insert(trace.trace_id.clone(), trace.clone());
        info!(trace_id = %trace.trace_id, prompt_id = %trace.prompt_id, "Trace ingested");
        Ok(trace)
    }

    pub fn get(&self, trace_id: &str) -> Option<Arc<Trace>> {
        self.traces.get(trace_id).map(|t| t.value().clone())
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}
