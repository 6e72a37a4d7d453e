//! Append-only, time-bucketed latency/cost/usage roll-ups keyed by
//! (model name, bucket start).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::EngineError;
use crate::run::MetricStats;

pub const DEFAULT_QUERY_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct Sample {
    pub model: String,
    pub at: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub cost_usd: f64,
    pub tokens: u64,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bucket {
    pub model: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_secs: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub latency_ms: MetricStats,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

impl Bucket {
    fn add(&mut self, sample: &Sample) {
        self.request_count += 1;
        if sample.is_error {
            self.error_count += 1;
        }
        if let Some(latency) = sample.latency_ms {
            self.latency_ms.push(latency);
        }
        self.total_cost_usd += sample.cost_usd;
        self.total_tokens += sample.tokens;
    }
}

pub struct TimeSeriesSink {
    bucket_secs: u64,
    series: DashMap<String, Mutex<BTreeMap<i64, Bucket>>>,
}

impl TimeSeriesSink {
    pub fn new(bucket_secs: u64) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
            series: DashMap::new(),
        }
    }

    pub fn bucket_secs(&self) -> u64 {
        self.bucket_secs
    }

    fn bucket_start(&self, at: DateTime<Utc>) -> i64 {
        let width = self.bucket_secs as i64;
        at.timestamp().div_euclid(width) * width
    }

    /// Adds to the sample's bucket. Buckets behind the model's newest one are
    /// closed, so late samples are rejected.
    pub fn record(&self, sample: Sample) -> Result<(), EngineError> {
        let start = self.bucket_start(sample.at);
        let bucket_start = DateTime::from_timestamp(start, 0).ok_or_else(|| {
            EngineError::BadRequest(format!("timestamp {} is out of range", sample.at))
        })?;

        let series = self.series.entry(sample.model.clone()).or_default();
        let mut buckets = series.lock();
        if let Some((&newest, _)) = buckets.last_key_value() {
            if start < newest {
                debug!(model = %sample.model, at = %sample.at, "Rejected late time-series sample");
                return Err(EngineError::BadRequest(format!(
                    "sample at {} is older than the current bucket for {}",
                    sample.at, sample.model
                )));
            }
        }

        buckets
            .entry(start)
            .or_insert_with(|| Bucket {
                model: sample.model.clone(),
                bucket_start,
                bucket_secs: self.bucket_secs,
                request_count: 0,
                error_count: 0,
                latency_ms: MetricStats::default(),
                total_cost_usd: 0.0,
                total_tokens: 0,
            })
            .add(&sample);
        Ok(())
    }

    /// Buckets overlapping `[start, end]`, newest first.
    pub fn query(
        &self,
        model: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Bucket> {
        let (from, to) = (self.bucket_start(start), end.timestamp());
        let mut out: Vec<Bucket> = self
            .series
            .iter()
            .filter(|e| model.map_or(true, |m| e.key() == m))
            .flat_map(|e| {
                e.value()
                    .lock()
                    .range(from..=to)
                    .map(|(_, b)| b.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| {
            b.bucket_start
                .cmp(&a.bucket_start)
                .then_with(|| a.model.cmp(&b.model))
        });
        out
    }

    pub fn default_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::hours(DEFAULT_QUERY_WINDOW_HOURS), now)
    }
}
