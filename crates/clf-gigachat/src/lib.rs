//! GigaChat adapter (OAuth + chat completions).
//!
//! Implements the core `ChatClient` port against the Sber GigaChat HTTP API.
//! A Basic-auth OAuth exchange yields a short-lived access token which is
//! cached until shortly before expiry, then reused for completion calls.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use clf_core::{
    errors::Error,
    model::{
        client::ChatClient,
        types::{ChatCompletion, ChatRequest, TokenUsage},
    },
    Result,
};
use serde_json::json;
use tokio::sync::Mutex;

/// Refresh the cached token this long before the server-side expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct GigaChatConfig {
    pub auth_url: String,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub oauth_scope: String,
    pub model: String,
    pub temperature: f64,
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
}

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    expires_at_ms: u64,
}

pub struct GigaChatClient {
    cfg: GigaChatConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl GigaChatClient {
    pub fn new(cfg: GigaChatConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .user_agent("clf/0.1")
            .build()
            .expect("reqwest client build");

        Self {
            cfg,
            http,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(tok) = guard.as_ref() {
            if now_ms() + (EXPIRY_SLACK.as_millis() as u64) < tok.expires_at_ms {
                return Ok(tok.access_token.clone());
            }
        }

        let resp = self
            .http
            .post(&self.cfg.auth_url)
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .form(&[("scope", self.cfg.oauth_scope.as_str())])
            .send()
            .await
            .map_err(|e| Error::Api(format!("gigachat auth request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!(
                "gigachat auth failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Api(format!("gigachat auth json error: {e}")))?;

        let token = parse_auth_response(&v)?;
        let access = token.access_token.clone();
        *guard = Some(token);
        Ok(access)
    }
}

#[async_trait]
impl ChatClient for GigaChatClient {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion> {
        let token = self.access_token().await?;

        let body = json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "system", "content": req.system_prompt },
                { "role": "user", "content": req.user_text },
            ],
            "temperature": self.cfg.temperature,
            "max_tokens": req.max_tokens,
        });

        let resp = self
            .http
            .post(&self.cfg.api_url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Api(format!("gigachat request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!(
                "gigachat completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Api(format!("gigachat json error: {e}")))?;

        parse_chat_response(&v)
    }
}

fn parse_auth_response(v: &serde_json::Value) -> Result<CachedToken> {
    let access = v
        .get("access_token")
        .and_then(|x| x.as_str())
        .ok_or_else(|| Error::Api("gigachat auth response missing access_token".to_string()))?;

    // `expires_at` is epoch millis; when absent the token is used once.
    let expires_at_ms = v.get("expires_at").and_then(|x| x.as_u64()).unwrap_or(0);

    Ok(CachedToken {
        access_token: access.to_string(),
        expires_at_ms,
    })
}

fn parse_chat_response(v: &serde_json::Value) -> Result<ChatCompletion> {
    let text = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::Api("gigachat response missing message content".to_string()))?;

    let usage = v.get("usage").map(parse_usage).unwrap_or_default();

    Ok(ChatCompletion {
        text: text.to_string(),
        usage,
    })
}

fn parse_usage(v: &serde_json::Value) -> TokenUsage {
    let get = |k: &str| v.get(k).and_then(|x| x.as_u64()).unwrap_or(0);
    TokenUsage {
        prompt_tokens: get("prompt_tokens"),
        completion_tokens: get("completion_tokens"),
        total_tokens: get("total_tokens"),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completion_text_and_usage() {
        let v = json!({
          "choices": [
            { "message": { "role": "assistant", "content": "1. Make: BMW\n2. Model: X3 30i" } }
          ],
          "usage": {
            "prompt_tokens": 321,
            "completion_tokens": 87,
            "total_tokens": 408
          }
        });

        let out = parse_chat_response(&v).unwrap();
        assert!(out.text.starts_with("1. Make: BMW"));
        assert_eq!(out.usage.prompt_tokens, 321);
        assert_eq!(out.usage.completion_tokens, 87);
        assert_eq!(out.usage.total_tokens, 408);
    }

    #[test]
    fn missing_choices_is_an_api_error() {
        let v = json!({ "usage": { "total_tokens": 10 } });
        assert!(matches!(parse_chat_response(&v), Err(Error::Api(_))));
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let v = json!({
          "choices": [ { "message": { "content": "text" } } ]
        });
        let out = parse_chat_response(&v).unwrap();
        assert_eq!(out.usage.total_tokens, 0);
    }

    #[test]
    fn parses_auth_token_with_expiry() {
        let v = json!({ "access_token": "tok", "expires_at": 1_767_225_600_000u64 });
        let tok = parse_auth_response(&v).unwrap();
        assert_eq!(tok.access_token, "tok");
        assert_eq!(tok.expires_at_ms, 1_767_225_600_000);
    }

    #[test]
    fn auth_response_without_token_is_an_api_error() {
        let v = json!({ "expires_at": 123 });
        assert!(matches!(parse_auth_response(&v), Err(Error::Api(_))));
    }
}
