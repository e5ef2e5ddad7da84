// src/analyzer/client.rs

use std::time::Duration;

use hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::analyzer::prompt::{build_prompt, LlmPrompt};
use crate::analyzer::{AnalysisRequest, AnalysisText, Analyzer, AnalyzerError};
use crate::cancel::CancelToken;
use crate::config::AnalyzerConfig;

const PROMPT_ABI_VERSION: &str = "v1-failure-analysis";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn from_analyzer(cfg: &AnalyzerConfig) -> Self {
        Self {
            provider: cfg.provider,
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.clone(),
            timeout: cfg.timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRunResult {
    pub text: String,
    pub prompt_hash: String,
}

pub struct LlmClient {
    cfg: ProviderConfig,
    http: reqwest::blocking::Client,
}

impl LlmClient {
    pub fn new(cfg: ProviderConfig) -> Result<Self, AnalyzerError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        Ok(Self { cfg, http })
    }

    /// Execute LLM request
    pub fn run(&self, prompt: &LlmPrompt) -> Result<LlmRunResult, AnalyzerError> {
        let prompt_hash = hash_prompt(prompt);
        let (url, headers, body) = build_request(&self.cfg, prompt);

        debug!(url = %url, model = %self.cfg.model, prompt_hash = %prompt_hash, "analyzer request");

        let mut req = self.http.post(url).json(&body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                AnalyzerError::Timeout
            } else {
                AnalyzerError::Transport(e.to_string())
            }
        })?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        let text = decode_response(&self.cfg.provider, status.as_u16(), &body)?;

        Ok(LlmRunResult { text, prompt_hash })
    }
}

/// The status decides first, so an error page that is not JSON still
/// reports its status code.
fn decode_response(provider: &Provider, status: u16, body: &str) -> Result<String, AnalyzerError> {
    if !(200..300).contains(&status) {
        return Err(AnalyzerError::Status {
            code: status,
            body: body.to_string(),
        });
    }
    let json: Value = serde_json::from_str(body).map_err(|e| AnalyzerError::Parse(e.to_string()))?;
    extract_text(provider, &json)
}

/// Analyzer backed by an OpenAI-compatible or Anthropic chat endpoint.
pub struct LlmAnalyzer {
    client: LlmClient,
    system_prompt: Option<String>,
}

impl LlmAnalyzer {
    pub fn new(cfg: &AnalyzerConfig) -> Result<Self, AnalyzerError> {
        Ok(Self {
            client: LlmClient::new(ProviderConfig::from_analyzer(cfg))?,
            system_prompt: cfg.system_prompt.clone(),
        })
    }
}

impl Analyzer for LlmAnalyzer {
    fn name(&self) -> &str {
        match self.client.cfg.provider {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
        }
    }

    fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancelToken,
    ) -> Result<AnalysisText, AnalyzerError> {
        if cancel.is_cancelled() {
            return Err(AnalyzerError::Cancelled);
        }

        let prompt = build_prompt(request, self.system_prompt.as_deref());
        let out = self.client.run(&prompt)?;
        let mut text = parse_analysis(&out.text);
        text.request_hash = Some(out.prompt_hash);
        Ok(text)
    }
}

fn hash_prompt(prompt: &LlmPrompt) -> String {
    let mut h = Sha256::new();
    h.update(PROMPT_ABI_VERSION.as_bytes());
    h.update(prompt.system.as_bytes());
    h.update(prompt.user.as_bytes());
    hex::encode(h.finalize())
}

fn build_request(
    cfg: &ProviderConfig,
    prompt: &LlmPrompt,
) -> (String, Vec<(&'static str, String)>, Value) {
    match cfg.provider {
        Provider::OpenAI => {
            let base = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into());
            let url = format!("{}/chat/completions", base.trim_end_matches('/'));

            let body = serde_json::json!({
                "model": cfg.model,
                "temperature": 0.2,
                "messages": [
                    { "role": "system", "content": prompt.system },
                    { "role": "user", "content": prompt.user }
                ]
            });

            // Self-hosted gateways often run without a key.
            let headers = cfg
                .api_key
                .as_ref()
                .map(|key| vec![("Authorization", format!("Bearer {}", key))])
                .unwrap_or_default();

            (url, headers, body)
        }

        Provider::Anthropic => {
            let url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into());

            let body = serde_json::json!({
                "model": cfg.model,
                "max_tokens": 1024,
                "system": prompt.system,
                "messages": [
                    { "role": "user", "content": prompt.user }
                ]
            });

            (
                url,
                vec![
                    ("x-api-key", cfg.api_key.clone().unwrap_or_default()),
                    ("anthropic-version", "2023-06-01".into()),
                ],
                body,
            )
        }
    }
}

fn extract_text(provider: &Provider, v: &Value) -> Result<String, AnalyzerError> {
    let text = match provider {
        Provider::OpenAI => v.pointer("/choices/0/message/content"),
        Provider::Anthropic => v.pointer("/content/0/text"),
    };

    text.and_then(|t| t.as_str())
        .map(str::to_owned)
        .ok_or_else(|| AnalyzerError::Parse(format!("{:?} response has no text", provider)))
}

/// Reads the JSON answer; anything else is kept whole as the root cause.
pub fn parse_analysis(raw: &str) -> AnalysisText {
    #[derive(Deserialize)]
    struct Reply {
        root_cause: Option<String>,
        suggested_fix: Option<String>,
        confidence: Option<f64>,
    }

    let parsed = sanitize_json(raw).and_then(|slice| serde_json::from_str::<Reply>(slice).ok());

    match parsed {
        Some(reply) => AnalysisText {
            root_cause: reply.root_cause.unwrap_or_default(),
            suggested_fix: reply.suggested_fix.unwrap_or_default(),
            confidence: reply.confidence.map(|c| c.clamp(0.0, 1.0)),
            request_hash: None,
        },
        None => AnalysisText {
            root_cause: raw.trim().to_string(),
            suggested_fix: String::new(),
            confidence: None,
            request_hash: None,
        },
    }
}

fn sanitize_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
