use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Completion, InvokeError, ModelInvoker, Usage};
use crate::catalog::ModelConfig;

const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Invoker for any endpoint speaking the chat-completions wire format.
pub struct HttpInvoker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    providers: Vec<String>,
}

impl HttpInvoker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        providers: Vec<String>,
    ) -> anyhow::Result<Self> {
        // Per-attempt deadlines come from the retry policy, not the client.
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client for model invoker: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            providers,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ModelInvoker for HttpInvoker {
    fn validate(&self, model: &ModelConfig) -> Result<(), String> {
        if model.model.trim().is_empty() {
            return Err("model name is required".to_string());
        }
        let provider = model.provider.to_lowercase();
        if !self.providers.iter().any(|p| *p == provider) {
            return Err(format!(
                "provider '{}' is not supported (available: {})",
                model.provider,
                self.providers.join(", ")
            ));
        }
        if !(0.0..=2.0).contains(&model.temperature) {
            return Err(format!(
                "temperature {} is out of range [0, 2]",
                model.temperature
            ));
        }
        Ok(())
    }

    async fn invoke(&self, model: &ModelConfig, prompt: &str) -> Result<Completion, InvokeError> {
        let body = ChatRequest {
            model: &model.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: model.temperature,
            max_tokens: model.max_tokens,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| InvokeError::Transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| InvokeError::Transient(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        debug!(model = %model.model, bytes = text.len(), "Model response received");
        parse_response(&text)
    }
}

fn classify_status(status: StatusCode, body: &str) -> InvokeError {
    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    let msg = format!("HTTP {}: {}", status.as_u16(), snippet);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        InvokeError::Transient(msg)
    } else {
        InvokeError::Fatal(msg)
    }
}

fn parse_response(body: &str) -> Result<Completion, InvokeError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| InvokeError::Fatal(format!("malformed response: {}", e)))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| InvokeError::Fatal("response contained no choices".to_string()))?;
    let usage = parsed
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();
    Ok(Completion { text, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker() -> HttpInvoker {
        HttpInvoker::new("http://localhost:9/v1/", None, vec!["openai".to_string()]).unwrap()
    }

    #[test]
    fn test_endpoint_trims_slash() {
        assert_eq!(invoker().endpoint(), "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn test_validate_provider() {
        let inv = invoker();
        assert!(inv.validate(&ModelConfig::new("OpenAI", "gpt-4")).is_ok());
        let err = inv
            .validate(&ModelConfig::new("acme", "gpt-4"))
            .unwrap_err();
        assert!(err.contains("acme"));
    }

    #[test]
    fn test_validate_model_name_and_temperature() {
        let inv = invoker();
        assert!(inv.validate(&ModelConfig::new("openai", " ")).is_err());
        let mut cfg = ModelConfig::new("openai", "gpt-4");
        cfg.temperature = 3.5;
        assert!(inv.validate(&cfg).is_err());
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Paris"}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
        }"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.text, "Paris");
        assert_eq!(completion.usage.total_tokens, 10);
    }

    #[test]
    fn test_parse_response_without_usage() {
        let body = r#"{"choices": [{"message": {"content": "ok"}}]}"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.usage, Usage::default());
    }

    #[test]
    fn test_parse_response_malformed() {
        assert!(matches!(parse_response("not json"), Err(InvokeError::Fatal(_))));
        assert!(matches!(
            parse_response(r#"{"choices": []}"#),
            Err(InvokeError::Fatal(_))
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            InvokeError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            InvokeError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            InvokeError::Fatal(_)
        ));
    }
}
