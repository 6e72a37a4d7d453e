use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_PARALLEL_WORKERS: usize = 32;
const DEFAULT_MAX_CONCURRENT_MODEL_CALLS: usize = 64;
const DEFAULT_METRICS_BUCKET_SECS: u64 = 3600;
const DEFAULT_MODEL_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL_PROVIDERS: &str = "openai";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: Option<String>,
    pub max_parallel_workers: usize,
    pub max_concurrent_model_calls: usize,
    pub metrics_bucket_secs: u64,
    pub catalog_path: Option<PathBuf>,
    pub model_api_base: String,
    pub model_api_key: Option<String>,
    pub model_providers: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            auth_token: std::env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            max_parallel_workers: env_parse("MAX_PARALLEL_WORKERS", DEFAULT_MAX_PARALLEL_WORKERS)
                .max(1),
            max_concurrent_model_calls: env_parse(
                "MAX_CONCURRENT_MODEL_CALLS",
                DEFAULT_MAX_CONCURRENT_MODEL_CALLS,
            )
            .max(1),
            metrics_bucket_secs: env_parse("METRICS_BUCKET_SECS", DEFAULT_METRICS_BUCKET_SECS)
                .max(1),
            catalog_path: std::env::var("CATALOG_PATH").ok().map(PathBuf::from),
            model_api_base: std::env::var("MODEL_API_BASE")
                .unwrap_or_else(|_| DEFAULT_MODEL_API_BASE.into()),
            model_api_key: std::env::var("MODEL_API_KEY").ok(),
            model_providers: parse_list(
                &std::env::var("MODEL_PROVIDERS").unwrap_or_else(|_| DEFAULT_MODEL_PROVIDERS.into()),
            ),
        }
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║           evalrun v{}                    ║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Auth:              {:<28}║", if self.auth_token.is_some() { "enabled" } else { "disabled" });
        tracing::info!("║  Max workers/run:   {:<28}║", self.max_parallel_workers);
        tracing::info!("║  Model call limit:  {:<28}║", self.max_concurrent_model_calls);
        tracing::info!("║  Metrics bucket:    {:<25}s ║", self.metrics_bucket_secs);
        tracing::info!("║  Model endpoint:    {:<28}║", truncate(&self.model_api_base, 28));
        tracing::info!("║  Providers:         {:<28}║", truncate(&self.model_providers.join(","), 28));
        tracing::info!(
            "║  Catalog:           {:<28}║",
            self.catalog_path
                .as_ref()
                .map(|p| truncate(&p.display().to_string(), 28))
                .unwrap_or_else(|| "empty".to_string())
        );
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_parallel_workers, DEFAULT_MAX_PARALLEL_WORKERS);
        assert_eq!(cfg.metrics_bucket_secs, DEFAULT_METRICS_BUCKET_SECS);
        assert_eq!(cfg.model_providers, vec!["openai".to_string()]);
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse::<u16>("NONEXISTENT_VAR_XYZ", 42), 42);
    }

    #[test]
    fn test_parse_list_normalizes() {
        assert_eq!(
            parse_list(" OpenAI, local ,,"),
            vec!["openai".to_string(), "local".to_string()]
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
