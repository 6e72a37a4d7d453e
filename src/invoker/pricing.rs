use super::Usage;

/// Blended USD price per 1K tokens.
const PRICE_TABLE: &[(&str, f64)] = &[
    ("gpt-4", 0.03),
    ("gpt-4-turbo", 0.01),
    ("gpt-3.5-turbo", 0.002),
    ("gpt-3.5-turbo-16k", 0.003),
    ("claude-3-opus-20240229", 0.015),
    ("claude-3-sonnet-20240229", 0.003),
    ("claude-3-haiku-20240307", 0.00025),
];

const DEFAULT_PRICE_PER_1K: f64 = 0.002;

pub fn price_per_1k(model: &str) -> f64 {
    PRICE_TABLE
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICE_PER_1K)
}

pub fn cost_usd(model: &str, usage: &Usage) -> f64 {
    usage.total_tokens as f64 / 1000.0 * price_per_1k(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_price() {
        let usage = Usage::new(500, 500);
        assert!((cost_usd("gpt-4", &usage) - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        assert_eq!(price_per_1k("some-local-model"), DEFAULT_PRICE_PER_1K);
    }

    #[test]
    fn test_zero_usage_is_free() {
        assert_eq!(cost_usd("gpt-4", &Usage::default()), 0.0);
    }
}
