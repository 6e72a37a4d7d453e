use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::EngineError;

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1000;
const DEFAULT_PARALLEL_WORKERS: usize = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    pub id: String,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub expected_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub items: Vec<DatasetItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub name: String,
    /// Metrics key override, so one evaluator kind can appear twice.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl EvaluatorConfig {
    pub fn key(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
impl EvaluatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            config: Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub evaluators: Vec<EvaluatorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: 0,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.timeout_seconds == 0 {
            return Err(EngineError::Configuration(
                "timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.parallel_workers == 0 {
            return Err(EngineError::Configuration(
                "parallel_workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool size bounded by the platform maximum.
    pub fn effective_workers(&self, platform_max: usize) -> usize {
        self.parallel_workers.clamp(1, platform_max.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub prompt_id: String,
    pub dataset_id: String,
    pub model_configuration: ModelConfig,
    #[serde(default)]
    pub evaluation_config: EvaluationConfig,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_parallel_workers() -> usize {
    DEFAULT_PARALLEL_WORKERS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    prompts: Vec<Prompt>,
    #[serde(default)]
    datasets: Vec<Dataset>,
    #[serde(default)]
    experiments: Vec<Experiment>,
}

/// Prompts, datasets and experiments the engine runs against. Read-only to runs.
pub struct Catalog {
    prompts: DashMap<String, Arc<Prompt>>,
    datasets: DashMap<String, Arc<Dataset>>,
    experiments: DashMap<String, Arc<Experiment>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            prompts: DashMap::new(),
            datasets: DashMap::new(),
            experiments: DashMap::new(),
        }
    }

    pub fn load_yaml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
        let catalog = Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid catalog file {}", path.display()))?;
        info!(
            prompts = catalog.prompts.len(),
            datasets = catalog.datasets.len(),
            experiments = catalog.experiments.len(),
            "Loaded catalog from {}",
            path.display()
        );
        Ok(catalog)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(content).context("Failed to parse catalog YAML")?;
        let catalog = Self::new();
        for prompt in file.prompts {
            catalog.insert_prompt(prompt);
        }
        for dataset in file.datasets {
            catalog.insert_dataset(dataset);
        }
        for experiment in file.experiments {
            catalog.insert_experiment(experiment);
        }
        Ok(catalog)
    }

    pub fn insert_prompt(&self, prompt: Prompt) {
        self.prompts.insert(prompt.id.clone(), Arc::new(prompt));
    }

    pub fn insert_dataset(&self, dataset: Dataset) {
        self.datasets.insert(dataset.id.clone(), Arc::new(dataset));
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        self.experiments
            .insert(experiment.id.clone(), Arc::new(experiment));
    }

    pub fn experiment(&self, id: &str) -> Option<Arc<Experiment>> {
        self.experiments.get(id).map(|e| e.value().clone())
    }

    pub fn prompt(&self, id: &str) -> Option<Arc<Prompt>> {
        self.prompts.get(id).map(|p| p.value().clone())
    }

    /// Lists the dataset's items in their stored order.
    pub fn enumerate(&self, dataset_id: &str) -> std::result::Result<Vec<DatasetItem>, EngineError> {
        let dataset = self
            .datasets
            .get(dataset_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| EngineError::Enumeration(format!("dataset {} not found", dataset_id)))?;

        let mut seen = std::collections::HashSet::with_capacity(dataset.items.len());
        for item in &dataset.items {
            if !seen.insert(item.id.as_str()) {
                return Err(EngineError::Enumeration(format!(
                    "dataset {} has duplicate item id {}",
                    dataset_id, item.id
                )));
            }
        }
        Ok(dataset.items.clone())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
