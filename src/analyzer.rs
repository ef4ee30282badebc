//! Language-model document analysis.
//!
//! [`Analyzer`] turns extracted text into an [`AnalysisResult`] with exactly
//! one completion call through a [`CompletionClient`]. The production client,
//! [`OpenAiCompatibleClient`], speaks the OpenAI `/chat/completions` protocol
//! (OpenRouter by default).
//!
//! The analyzer owns no retry or backoff. Callers decide what a failure means.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::AnalyzerConfig;

/// Structured output requested from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub summary: String,
    #[serde(rename = "type", default)]
    pub doc_type: String,
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub metadata: Map<String, Value>,
}

fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("completion response contained no message content")]
    EmptyResponse,
    #[error("no API key configured (set OPENROUTER_API_KEY or OPENAI_API_KEY)")]
    MissingApiKey,
}

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("failed to parse model response: {source}; content: {content}")]
    MalformedResponse {
        content: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("analysis cancelled")]
    Cancelled,
}

/// A single-shot text completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, CompletionError>;
}

pub struct Analyzer {
    client: Arc<dyn CompletionClient>,
    model: String,
    max_input_chars: usize,
}

impl Analyzer {
    pub fn new(client: Arc<dyn CompletionClient>, config: &AnalyzerConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn analyze_text(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalyzeError> {
        let input = truncate_chars(text, self.max_input_chars);
        if input.len() < text.len() {
            tracing::debug!(
                original_bytes = text.len(),
                kept_chars = self.max_input_chars,
                "truncated analysis input"
            );
        }
        let prompt = build_prompt(input);

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AnalyzeError::Cancelled),
            res = self.client.complete(&self.model, &prompt) => res?,
        };

        parse_response(&raw)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn build_prompt(text: &str) -> String {
    format!(
        r#"Analyze the following document text and return a JSON object with exactly these fields:
1. "summary": A concise summary of the document.
2. "type": The deduced document type (one of Invoice, CV, Report, Letter, Contract, Other).
3. "metadata": A flat JSON object of extracted key fields (e.g. date, author, total_amount, invoice_number).

Return ONLY the JSON.

Document Text:
{}"#,
        text
    )
}

/// Remove a Markdown code fence the model may wrap its JSON in.
fn strip_fences(raw: &str) -> &str {
    let s = raw.trim();
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    let s = s.strip_suffix("```").unwrap_or(s);
    s.trim()
}

fn parse_response(raw: &str) -> Result<AnalysisResult, AnalyzeError> {
    let content = strip_fences(raw);
    serde_json::from_str(content).map_err(|source| AnalyzeError::MalformedResponse {
        content: content.to_string(),
        source,
    })
}

// ============ OpenAI-compatible client ============

/// Client for any endpoint implementing `POST {base_url}/chat/completions`.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &AnalyzerConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, CompletionError> {
        let api_key = self.api_key.as_deref().ok_or(CompletionError::MissingApiKey)?;

        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let json: Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(CompletionError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        reply: Result<String, u16>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(&self, _model: &str, prompt: &str) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(status) => Err(CompletionError::Status {
                    status: *status,
                    body: "upstream down".to_string(),
                }),
            }
        }
    }

    fn analyzer(client: Arc<dyn CompletionClient>, max_input_chars: usize) -> Analyzer {
        let config = AnalyzerConfig {
            max_input_chars,
            ..AnalyzerConfig::default()
        };
        Analyzer::new(client, &config)
    }

    #[test]
    fn strips_json_and_bare_fences() {
        assert_eq!(strip_fences("  ```json\n{\"a\":1}\n```  "), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("{}"), "{}");
    }

    #[test]
    fn null_or_missing_metadata_becomes_empty_object() {
        let r = parse_response(r#"{"summary":"s","type":"Other","metadata":null}"#).unwrap();
        assert!(r.metadata.is_empty());
        let r = parse_response(r#"{"summary":"s","type":"Other"}"#).unwrap();
        assert!(r.metadata.is_empty());
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn parses_fenced_reply_with_one_call() {
        let client = Scripted::ok(
            "```json\n{\"summary\":\"An invoice.\",\"type\":\"Invoice\",\"metadata\":{\"total_amount\":\"42.00\"}}\n```",
        );
        let result = analyzer(client.clone(), 100)
            .analyze_text("Invoice #7", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.doc_type, "Invoice");
        assert_eq!(result.metadata["total_amount"], "42.00");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(client.prompts.lock().unwrap()[0].ends_with("Invoice #7"));
    }

    #[tokio::test]
    async fn prompt_carries_truncated_text() {
        let client = Scripted::ok(r#"{"summary":"","type":"Other","metadata":{}}"#);
        analyzer(client.clone(), 4)
            .analyze_text("abcdefgh", &CancellationToken::new())
            .await
            .unwrap();
        let prompt = client.prompts.lock().unwrap()[0].clone();
        assert!(prompt.ends_with("abcd"));
        assert!(!prompt.contains("abcde"));
    }

    #[tokio::test]
    async fn malformed_reply_keeps_raw_content() {
        let client = Scripted::ok("```json\nnot json at all\n```");
        let err = analyzer(client, 100)
            .analyze_text("text", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AnalyzeError::MalformedResponse { content, .. } => {
                assert_eq!(content, "not json at all")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn completion_failure_passes_through() {
        let client = Arc::new(Scripted {
            reply: Err(503),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        });
        let err = analyzer(client.clone(), 100)
            .analyze_text("text", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AnalyzeError::Completion(CompletionError::Status { status: 503, .. })
        ));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_call() {
        let client = Scripted::ok("{}");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = analyzer(client.clone(), 100)
            .analyze_text("text", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::Cancelled));
    }

    #[tokio::test]
    async fn openai_client_requires_api_key() {
        let client = OpenAiCompatibleClient::new(&AnalyzerConfig::default()).unwrap();
        let err = client.complete("gpt-4o-mini", "hi").await.unwrap_err();
        assert!(matches!(err, CompletionError::MissingApiKey));
    }

    #[tokio::test]
    async fn openai_client_reads_first_choice() {
        use axum::{routing::post, Json, Router};

        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                Json(serde_json::json!({
                    "choices": [{ "message": { "role": "assistant", "content": body["model"] } }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = AnalyzerConfig {
            base_url: format!("http://{}/v1/", addr),
            api_key: Some("sk-test".to_string()),
            ..AnalyzerConfig::default()
        };
        let client = OpenAiCompatibleClient::new(&config).unwrap();
        let reply = client.complete("echo-model", "hi").await.unwrap();
        assert_eq!(reply, "echo-model");
    }
}
