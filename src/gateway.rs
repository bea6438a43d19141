use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::db::{self, AuditRow};

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Text generation capability. One trait per backend lets tests run a
/// scripted provider and keeps the HTTP client out of the callers.
#[async_trait]
pub trait Generate: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String>;
}

/// Embedding capability, used by retrieval to blend semantic similarity.
#[async_trait]
pub trait Embed: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ── OpenAI-compatible provider ──

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    embed_model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable must be set"))?;
        let model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let embed_model = std::env::var("OPENAI_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, api_key, model, embed_model, base_url })
    }
}

#[async_trait]
impl Generate for OpenAiProvider {
    async fn generate(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.1,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let v: serde_json::Value = resp.json().await?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(content)
    }
}

#[async_trait]
impl Embed for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.embed_model, "input": texts });
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let v: serde_json::Value = resp.json().await?;
        let data = v
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow!("No data in embeddings response"))?;
        data.iter()
            .map(|item| {
                item.get("embedding")
                    .and_then(|e| e.as_array())
                    .map(|xs| xs.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
                    .ok_or_else(|| anyhow!("Malformed embedding in response"))
            })
            .collect()
    }
}

// ── Gateway ──

/// Failure of a gateway call. `Schema` carries the raw response so nothing is
/// ever silently discarded; callers must handle it, not swallow it.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("generation transport failed: {0}")]
    Transport(#[source] anyhow::Error),
    #[error("empty response from generation provider")]
    EmptyResponse,
    #[error("response failed schema validation after repair: {message}")]
    Schema { message: String, raw: String },
}

/// The single chokepoint for generation-backed corrections: schema-validated
/// output, one repair retry, and an audit row for every provider request.
pub struct Gateway<'a> {
    provider: &'a dyn Generate,
    conn: &'a rusqlite::Connection,
    pipeline_version: String,
}

impl<'a> Gateway<'a> {
    pub fn new(provider: &'a dyn Generate, conn: &'a rusqlite::Connection) -> Self {
        Self { provider, conn, pipeline_version: env!("CARGO_PKG_VERSION").to_string() }
    }

    /// Request a `T`-shaped result. Policy: one request; on validation
    /// failure, one repair-only follow-up carrying the invalid output and the
    /// error; then a typed failure with the raw response attached.
    pub async fn call<T>(&self, task: &str, system: &str, prompt: &str) -> Result<T, GatewayError>
    where
        T: DeserializeOwned + Serialize,
    {
        let hash = input_hash(task, prompt);
        let request = serde_json::json!({ "task": task, "prompt": prompt }).to_string();

        let raw = match self.provider.generate(system, prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                self.audit(&hash, task, &request, None, None, Some(&e.to_string()));
                return Err(GatewayError::Transport(e));
            }
        };
        if raw.is_empty() {
            self.audit(&hash, task, &request, Some(&raw), None, Some("empty response"));
            return Err(GatewayError::EmptyResponse);
        }

        match parse_structured::<T>(&raw) {
            Ok(value) => {
                let parsed = serde_json::to_string(&value).ok();
                self.audit(&hash, task, &request, Some(&raw), parsed.as_deref(), None);
                Ok(value)
            }
            Err(parse_err) => {
                self.audit(&hash, task, &request, Some(&raw), None, Some(&parse_err));
                warn!("Gateway {} failed validation, sending repair request", task);
                let repair_prompt = format!(
                    "The previous output failed validation.\nValidation error: {}\n\
                     Invalid output:\n{}\n\
                     Return ONLY the corrected JSON, no commentary.",
                    parse_err, raw
                );
                let raw2 = match self.provider.generate(system, &repair_prompt).await {
                    Ok(raw2) => raw2,
                    Err(e) => {
                        self.audit(&hash, task, &request, None, None, Some(&e.to_string()));
                        return Err(GatewayError::Transport(e));
                    }
                };
                match parse_structured::<T>(&raw2) {
                    Ok(value) => {
                        let parsed = serde_json::to_string(&value).ok();
                        self.audit(&hash, task, &request, Some(&raw2), parsed.as_deref(), None);
                        Ok(value)
                    }
                    Err(e2) => {
                        self.audit(&hash, task, &request, Some(&raw2), None, Some(&e2));
                        Err(GatewayError::Schema { message: e2, raw: raw2 })
                    }
                }
            }
        }
    }

    fn audit(
        &self,
        hash: &str,
        task: &str,
        request: &str,
        raw: Option<&str>,
        parsed: Option<&str>,
        error: Option<&str>,
    ) {
        let row = AuditRow {
            input_hash: hash.to_string(),
            task: task.to_string(),
            request: request.to_string(),
            raw_response: raw.map(String::from),
            parsed_result: parsed.map(String::from),
            error: error.map(String::from),
            pipeline_version: self.pipeline_version.clone(),
        };
        if let Err(e) = db::save_audit(self.conn, &row) {
            // The audit trail is the reproducibility record; a write failure
            // is loud, not fatal to the document.
            warn!("Failed to write audit entry {}: {}", hash, e);
        }
    }
}

fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    match serde_json::from_str::<T>(raw) {
        Ok(v) => Ok(v),
        Err(first) => {
            let repaired = repair_json(raw);
            if repaired != raw {
                serde_json::from_str::<T>(&repaired).map_err(|_| first.to_string())
            } else {
                Err(first.to_string())
            }
        }
    }
}

/// Mechanical local repair before the model gets a second chance: strip
/// markdown fences, close brackets a truncated response left open.
pub fn repair_json(raw: &str) -> String {
    let mut s = raw.trim().to_string();
    if s.starts_with("```") {
        s = s
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }
    let open_braces = s.matches('{').count() as i64 - s.matches('}').count() as i64;
    let open_brackets = s.matches('[').count() as i64 - s.matches(']').count() as i64;
    for _ in 0..open_brackets.max(0) {
        s.push(']');
    }
    for _ in 0..open_braces.max(0) {
        s.push('}');
    }
    s
}

pub fn input_hash(task: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.as_bytes());
    hasher.update(b"\n");
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted provider: returns canned responses in order.
    struct ScriptedProvider {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl Generate for ScriptedProvider {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow!("no scripted response left"))
        }
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Vote {
        span_type: String,
        confidence: f64,
    }

    fn test_conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    #[tokio::test]
    async fn success_first_try_one_audit_entry() {
        let conn = test_conn();
        let provider =
            ScriptedProvider::new(&[r#"{"span_type": "answers", "confidence": 0.9}"#]);
        let gw = Gateway::new(&provider, &conn);
        let vote: Vote = gw.call("retype_span", "sys", "prompt-a").await.unwrap();
        assert_eq!(vote.span_type, "answers");
        let hash = input_hash("retype_span", "prompt-a");
        assert_eq!(db::audit_count(&conn, &hash).unwrap(), 1);
    }

    #[tokio::test]
    async fn one_failure_then_repair_two_audit_entries() {
        let conn = test_conn();
        let provider = ScriptedProvider::new(&[
            "this is not json at all",
            r#"{"span_type": "toc", "confidence": 0.7}"#,
        ]);
        let gw = Gateway::new(&provider, &conn);
        let vote: Vote = gw.call("retype_span", "sys", "prompt-b").await.unwrap();
        assert_eq!(vote.span_type, "toc");
        let hash = input_hash("retype_span", "prompt-b");
        assert_eq!(db::audit_count(&conn, &hash).unwrap(), 2);
    }

    #[tokio::test]
    async fn second_failure_is_typed_and_carries_raw() {
        let conn = test_conn();
        let provider = ScriptedProvider::new(&["garbage one", "garbage two"]);
        let gw = Gateway::new(&provider, &conn);
        let err = gw.call::<Vote>("retype_span", "sys", "prompt-c").await.unwrap_err();
        match err {
            GatewayError::Schema { raw, .. } => assert_eq!(raw, "garbage two"),
            other => panic!("expected Schema error, got {:?}", other),
        }
        let hash = input_hash("retype_span", "prompt-c");
        assert_eq!(db::audit_count(&conn, &hash).unwrap(), 2);
    }

    #[tokio::test]
    async fn fenced_json_is_repaired_locally() {
        let conn = test_conn();
        let provider = ScriptedProvider::new(&[
            "```json\n{\"span_type\": \"index\", \"confidence\": 0.8}\n```",
        ]);
        let gw = Gateway::new(&provider, &conn);
        let vote: Vote = gw.call("retype_span", "sys", "prompt-d").await.unwrap();
        assert_eq!(vote.span_type, "index");
        // local repair counts as a success on the first request
        let hash = input_hash("retype_span", "prompt-d");
        assert_eq!(db::audit_count(&conn, &hash).unwrap(), 1);
    }

    #[test]
    fn repair_json_closes_truncation() {
        assert_eq!(repair_json(r#"{"a": [1, 2"#), r#"{"a": [1, 2]}"#);
        assert_eq!(repair_json("```json\n{}\n```"), "{}");
        assert_eq!(repair_json(r#"{"ok": true}"#), r#"{"ok": true}"#);
    }

    #[test]
    fn input_hash_is_stable() {
        assert_eq!(input_hash("t", "p"), input_hash("t", "p"));
        assert_ne!(input_hash("t", "p"), input_hash("t", "q"));
    }
}
