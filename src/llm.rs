//! Hosted language model gateway.
//!
//! Public model ids (`claude-sonnet-4-5`, `gpt-4o-mini`, ...) map through
//! [`MODEL_CATALOG`] to a provider, an upstream model name and a price.
//! Each provider is a [`LanguageModel`] client; [`LlmGateway`] picks the
//! client for a model id and falls back to Anthropic when the provider has
//! no API key configured.
//!
//! # Retry Strategy
//!
//! Same as the embedding client: 429 and 5xx are retried with exponential
//! backoff, other 4xx responses fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{ServiceError, ServiceResult};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
        }
    }

    /// Environment variable holding this provider's API key.
    pub fn key_env(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelSpec {
    pub id: &'static str,
    pub provider: Provider,
    pub upstream: &'static str,
    /// USD per million input tokens.
    pub input_price: f64,
    /// USD per million output tokens.
    pub output_price: f64,
}

pub const DEFAULT_MODEL_ID: &str = "claude-sonnet-4-5";

pub const MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "claude-sonnet-4-5",
        provider: Provider::Anthropic,
        upstream: "claude-sonnet-4-20250514",
        input_price: 3.00,
        output_price: 15.00,
    },
    ModelSpec {
        id: "claude-haiku-4-5",
        provider: Provider::Anthropic,
        upstream: "claude-haiku-4-5-20251001",
        input_price: 0.25,
        output_price: 1.25,
    },
    ModelSpec {
        id: "gemini-2.5-pro",
        provider: Provider::Google,
        upstream: "gemini-2.5-pro",
        input_price: 1.25,
        output_price: 10.00,
    },
    ModelSpec {
        id: "gemini-2.5-flash",
        provider: Provider::Google,
        upstream: "gemini-2.5-flash",
        input_price: 0.075,
        output_price: 0.30,
    },
    ModelSpec {
        id: "gpt-4o",
        provider: Provider::OpenAi,
        upstream: "gpt-4o",
        input_price: 2.50,
        output_price: 10.00,
    },
    ModelSpec {
        id: "gpt-4o-mini",
        provider: Provider::OpenAi,
        upstream: "gpt-4o-mini",
        input_price: 0.15,
        output_price: 0.60,
    },
];

/// Catalog entry for `model_id`; unknown ids resolve to the default model.
pub fn model_spec(model_id: &str) -> &'static ModelSpec {
    MODEL_CATALOG
        .iter()
        .find(|m| m.id == model_id)
        .unwrap_or(&MODEL_CATALOG[0])
}

pub fn is_known_model(model_id: &str) -> bool {
    MODEL_CATALOG.iter().any(|m| m.id == model_id)
}

/// Cost in USD, rounded to six decimals.
pub fn calculate_cost(model_id: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let spec = model_spec(model_id);
    let cost = input_tokens as f64 / 1_000_000.0 * spec.input_price
        + output_tokens as f64 / 1_000_000.0 * spec.output_price;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    /// Allow the provider's hosted web search tool (Anthropic only).
    pub web_search: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 4096,
            web_search: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Public model id that produced the text.
    pub model: String,
    pub provider: Provider,
}

/// A single provider's completion API.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> Provider;
    /// Run one completion against `upstream_model`. The returned
    /// [`Completion::model`] is filled in by the gateway.
    async fn complete(&self, upstream_model: &str, request: &CompletionRequest)
        -> Result<Completion>;
}

/// Routes model ids to configured provider clients.
#[derive(Clone, Default)]
pub struct LlmGateway {
    clients: HashMap<Provider, Arc<dyn LanguageModel>>,
}

impl LlmGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every provider whose API key is present in the environment.
    pub fn from_env(config: &LlmConfig) -> Result<Self> {
        let mut gateway = Self::new();
        for provider in [Provider::Anthropic, Provider::OpenAi, Provider::Google] {
            let Ok(key) = std::env::var(provider.key_env()) else {
                continue;
            };
            if key.trim().is_empty() {
                continue;
            }
            let http = HttpSettings::new(config)?;
            let client: Arc<dyn LanguageModel> = match provider {
                Provider::Anthropic => Arc::new(AnthropicClient { api_key: key, http }),
                Provider::OpenAi => Arc::new(OpenAiClient { api_key: key, http }),
                Provider::Google => Arc::new(GeminiClient { api_key: key, http }),
            };
            tracing::info!(provider = %provider, "language model provider configured");
            gateway = gateway.with_client(client);
        }
        if gateway.clients.is_empty() {
            tracing::warn!("no language model provider configured; AI endpoints will fail");
        }
        Ok(gateway)
    }

    pub fn with_client(mut self, client: Arc<dyn LanguageModel>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn configured_providers(&self) -> Vec<Provider> {
        [Provider::Anthropic, Provider::OpenAi, Provider::Google]
            .into_iter()
            .filter(|p| self.clients.contains_key(p))
            .collect()
    }

    /// The catalog model that will answer for `model_id`. Unknown ids map to
    /// the default, and a model whose provider is not configured falls back
    /// to the default Anthropic model.
    pub fn resolve(&self, model_id: &str) -> ServiceResult<&'static ModelSpec> {
        let spec = model_spec(model_id);
        if self.clients.contains_key(&spec.provider) {
            return Ok(spec);
        }
        let fallback = model_spec(DEFAULT_MODEL_ID);
        if !self.clients.contains_key(&fallback.provider) {
            return Err(ServiceError::Upstream(
                "No language model provider is configured".to_string(),
            ));
        }
        tracing::warn!(
            requested = model_id,
            fallback = fallback.id,
            "provider not configured, falling back"
        );
        Ok(fallback)
    }

    /// Complete with the model [`resolve`](Self::resolve) picks for `model_id`.
    pub async fn complete(
        &self,
        model_id: &str,
        request: &CompletionRequest,
    ) -> ServiceResult<Completion> {
        let spec = self.resolve(model_id)?;
        let client = self.clients.get(&spec.provider).ok_or_else(|| {
            ServiceError::Upstream("No language model provider is configured".to_string())
        })?;

        let started = std::time::Instant::now();
        let mut completion = client
            .complete(spec.upstream, request)
            .await
            .map_err(|e| ServiceError::Upstream(format!("{} request failed: {:#}", spec.provider, e)))?;
        completion.model = spec.id.to_string();
        completion.provider = spec.provider;

        tracing::info!(
            model = spec.id,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            cost_usd = calculate_cost(spec.id, completion.input_tokens, completion.output_tokens),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completion finished"
        );
        Ok(completion)
    }
}

// ============ HTTP clients ============

#[derive(Clone)]
struct HttpSettings {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpSettings {
    fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    /// POST `body` as JSON with retry on 429/5xx and network errors.
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut builder = self.client.post(url).json(body);
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "completion request failed, retrying");
                        last_err = Some(anyhow::anyhow!("API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
    }
}

fn token_count(value: &Value, pointer: &str) -> i64 {
    value.pointer(pointer).and_then(Value::as_i64).unwrap_or(0)
}

struct AnthropicClient {
    api_key: String,
    http: HttpSettings,
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn complete(
        &self,
        upstream_model: &str,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let mut messages = vec![json!({"role": "user", "content": request.prompt})];
        let mut text = String::new();
        let mut input_tokens = 0;
        let mut output_tokens = 0;

        // A server-side tool turn can pause; continue it once.
        for _ in 0..2 {
            let mut body = json!({
                "model": upstream_model,
                "max_tokens": request.max_tokens,
                "system": request.system,
                "messages": messages,
            });
            if request.web_search {
                body["tools"] = json!([{"type": "web_search_20250305", "name": "web_search"}]);
            }

            let resp = self
                .http
                .post_json(
                    ANTHROPIC_URL,
                    &[
                        ("x-api-key", self.api_key.as_str()),
                        ("anthropic-version", ANTHROPIC_VERSION),
                    ],
                    &body,
                )
                .await?;

            input_tokens += token_count(&resp, "/usage/input_tokens");
            output_tokens += token_count(&resp, "/usage/output_tokens");
            let content = resp.get("content").cloned().unwrap_or_else(|| json!([]));
            if let Some(blocks) = content.as_array() {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(t) = block.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                }
            }

            match resp.get("stop_reason").and_then(Value::as_str) {
                Some("pause_turn") | Some("tool_use") => {
                    messages.push(json!({"role": "assistant", "content": content}));
                }
                _ => break,
            }
        }

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
            model: upstream_model.to_string(),
            provider: Provider::Anthropic,
        })
    }
}

struct OpenAiClient {
    api_key: String,
    http: HttpSettings,
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn complete(
        &self,
        upstream_model: &str,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let body = json!({
            "model": upstream_model,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });
        let auth = format!("Bearer {}", self.api_key);
        let resp = self
            .http
            .post_json(OPENAI_CHAT_URL, &[("Authorization", auth.as_str())], &body)
            .await?;

        let text = resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))?
            .to_string();

        Ok(Completion {
            text,
            input_tokens: token_count(&resp, "/usage/prompt_tokens"),
            output_tokens: token_count(&resp, "/usage/completion_tokens"),
            model: upstream_model.to_string(),
            provider: Provider::OpenAi,
        })
    }
}

struct GeminiClient {
    api_key: String,
    http: HttpSettings,
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn complete(
        &self,
        upstream_model: &str,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let url = format!("{}/{}:generateContent", GEMINI_BASE_URL, upstream_model);
        let body = json!({
            "systemInstruction": {"parts": [{"text": request.system}]},
            "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
            "generationConfig": {"maxOutputTokens": request.max_tokens},
        });
        let resp = self
            .http
            .post_json(&url, &[("x-goog-api-key", self.api_key.as_str())], &body)
            .await?;

        let parts = resp
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing candidate parts"))?;
        let text = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<String>();

        Ok(Completion {
            text,
            input_tokens: token_count(&resp, "/usageMetadata/promptTokenCount"),
            output_tokens: token_count(&resp, "/usageMetadata/candidatesTokenCount"),
            model: upstream_model.to_string(),
            provider: Provider::Google,
        })
    }
}

// ============ Reply parsing ============

/// Parse the JSON object a model was asked to return.
///
/// Prefers a ```` ```json ```` fence, then any fence, then the raw reply;
/// if none of those parse, the first balanced `{...}` in the reply is tried.
pub fn extract_json(reply: &str) -> Result<Value> {
    let candidate = if let Some((_, rest)) = reply.split_once("```json") {
        rest.split("```").next().unwrap_or(rest)
    } else if let Some((_, rest)) = reply.split_once("```") {
        rest.split("```").next().unwrap_or(rest)
    } else {
        reply
    };

    if let Ok(value) = serde_json::from_str::<Value>(candidate.trim()) {
        return Ok(value);
    }

    if let Some(object) = first_balanced_object(reply) {
        if let Ok(value) = serde_json::from_str::<Value>(object) {
            return Ok(value);
        }
    }

    let preview: String = reply.chars().take(200).collect();
    bail!("Could not parse JSON from model reply: {}", preview)
}

/// First `{...}` span with balanced braces, ignoring braces inside strings.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeModel {
        provider: Provider,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        fn provider(&self) -> Provider {
            self.provider
        }
        async fn complete(
            &self,
            upstream_model: &str,
            _request: &CompletionRequest,
        ) -> Result<Completion> {
            self.seen.lock().unwrap().push(upstream_model.to_string());
            Ok(Completion {
                text: "{}".to_string(),
                input_tokens: 10,
                output_tokens: 5,
                model: String::new(),
                provider: self.provider,
            })
        }
    }

    fn fake(provider: Provider) -> Arc<FakeModel> {
        Arc::new(FakeModel {
            provider,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn cost_uses_catalog_pricing() {
        assert_eq!(calculate_cost("claude-sonnet-4-5", 1_000_000, 1_000_000), 18.0);
        assert_eq!(calculate_cost("gpt-4o-mini", 1000, 500), 0.00045);
        // unknown ids are priced like the default model
        assert_eq!(calculate_cost("mystery", 1000, 0), 0.003);
        assert_eq!(calculate_cost("gemini-2.5-flash", 1, 1), 0.0);
    }

    #[test]
    fn unknown_model_resolves_to_default() {
        assert_eq!(model_spec("nope").id, DEFAULT_MODEL_ID);
        assert!(is_known_model("gemini-2.5-pro"));
        assert!(!is_known_model("auto"));
    }

    #[test]
    fn extract_json_variants() {
        let fenced = "Here:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(fenced).unwrap()["a"], 1);

        let plain_fence = "```\n{\"b\": true}\n```";
        assert_eq!(extract_json(plain_fence).unwrap()["b"], true);

        assert_eq!(extract_json("  {\"c\": \"x\"} ").unwrap()["c"], "x");

        let embedded = "I found it: {\"found\": true, \"url\": \"http://x/{y}.pdf\"} done";
        assert_eq!(extract_json(embedded).unwrap()["found"], true);

        assert!(extract_json("no json here").is_err());
    }

    #[tokio::test]
    async fn gateway_routes_to_provider() {
        let openai = fake(Provider::OpenAi);
        let gateway = LlmGateway::new()
            .with_client(fake(Provider::Anthropic))
            .with_client(openai.clone());
        let c = gateway
            .complete("gpt-4o-mini", &CompletionRequest::new("s", "p"))
            .await
            .unwrap();
        assert_eq!(c.model, "gpt-4o-mini");
        assert_eq!(c.provider, Provider::OpenAi);
        assert_eq!(openai.seen.lock().unwrap().as_slice(), ["gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn gateway_falls_back_to_anthropic() {
        let anthropic = fake(Provider::Anthropic);
        let gateway = LlmGateway::new().with_client(anthropic.clone());
        let c = gateway
            .complete("gemini-2.5-pro", &CompletionRequest::new("s", "p"))
            .await
            .unwrap();
        assert_eq!(c.model, DEFAULT_MODEL_ID);
        assert_eq!(
            anthropic.seen.lock().unwrap().as_slice(),
            ["claude-sonnet-4-20250514"]
        );
    }

    #[test]
    fn resolve_reports_the_answering_model() {
        let gateway = LlmGateway::new().with_client(fake(Provider::Anthropic));
        assert_eq!(gateway.resolve("claude-haiku-4-5").unwrap().id, "claude-haiku-4-5");
        assert_eq!(gateway.resolve("gpt-4o").unwrap().id, DEFAULT_MODEL_ID);
        assert_eq!(gateway.resolve("no-such-model").unwrap().id, DEFAULT_MODEL_ID);
        assert!(LlmGateway::new().resolve("gpt-4o").is_err());
    }

    #[tokio::test]
    async fn gateway_without_providers_is_upstream_error() {
        let gateway = LlmGateway::new();
        assert!(gateway.configured_providers().is_empty());
        let err = gateway
            .complete("gpt-4o", &CompletionRequest::new("s", "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
    }
}
