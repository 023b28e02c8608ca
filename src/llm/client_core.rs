use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::llm::types::{ModelListing, ModelPricing};
use crate::llm::{BackendCategory, LlmError};

pub const REFERER: &str = "https://github.com/browser-agent/browser-agent";
pub const APP_TITLE: &str = "browser-agent";

#[derive(Debug, Clone)]
pub struct ChatClient {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let inner = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            inner,
            llm_cfg: LlmConfig::default(),
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .read_timeout(Duration::from_millis(cfg.read_idle_timeout_ms));
        // keep the existing client if the builder rejects the settings
        if let Ok(c) = builder.build() {
            self.inner = c;
        }
        self.llm_cfg = cfg;
        self
    }

    fn api_root(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1")
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_root())
    }

    pub(crate) fn models_endpoint(&self) -> String {
        format!("{}/models", self.api_root())
    }

    pub(crate) fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|_| {
            LlmError::Backend {
                category: BackendCategory::Auth,
                status: None,
                message: "api key contains characters not allowed in a header".into(),
                retry_after: None,
            }
        })?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert("HTTP-Referer", HeaderValue::from_static(REFERER));
        headers.insert("X-Title", HeaderValue::from_static(APP_TITLE));
        Ok(headers)
    }

    /// Look up per-token pricing for the configured model in the `/models` listing.
    pub async fn fetch_model_pricing(&self) -> Result<Option<ModelPricing>, LlmError> {
        let url = self.models_endpoint();
        let resp = self
            .inner
            .get(url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(|e| LlmError::Transport(format!("fetch models: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Backend {
                category: BackendCategory::from_status(status),
                status: Some(status.as_u16()),
                message,
                retry_after: None,
            });
        }
        let listing: ModelListing = resp
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("decode models listing: {e}")))?;
        let Some(entry) = listing.data.into_iter().find(|m| m.id == self.model) else {
            debug!(model=%self.model, "model not present in listing");
            return Ok(None);
        };
        let Some(pricing) = entry.pricing else {
            return Ok(None);
        };
        let parse = |v: Option<String>| -> f64 {
            v.and_then(|s| s.parse::<f64>().ok()).unwrap_or_else(|| {
                warn!(model=%self.model, "unparseable price in models listing");
                0.0
            })
        };
        Ok(Some(ModelPricing {
            prompt: parse(pricing.prompt),
            completion: parse(pricing.completion),
        }))
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(cfg: &LlmConfig, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
    if cfg.respect_retry_after
        && let Some(secs) = retry_after_secs
    {
        return Duration::from_secs(secs);
    }
    let shift = attempt.saturating_sub(1).min(16) as u32;
    let exp = cfg.retry_base_ms.saturating_mul(1u64 << shift);
    let jitter = if cfg.retry_jitter_ms == 0 {
        0
    } else {
        fastrand::u64(0..=cfg.retry_jitter_ms)
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};

    #[test]
    fn endpoint_normalization() {
        let c = ChatClient::new("https://api.example.com/v1/", "x", "m").unwrap();
        assert_eq!(c.endpoint(), "https://api.example.com/v1/chat/completions");
        let c2 = ChatClient::new("https://api.example.com/", "x", "m").unwrap();
        assert_eq!(c2.endpoint(), "https://api.example.com/v1/chat/completions");
        let c3 = ChatClient::new("https://openrouter.ai/api/v1", "x", "m").unwrap();
        assert_eq!(c3.endpoint(), "https://openrouter.ai/api/v1/chat/completions");
        assert_eq!(c3.models_endpoint(), "https://openrouter.ai/api/v1/models");
    }

    #[test]
    fn backoff_grows_and_honors_retry_after() {
        let cfg = LlmConfig {
            retry_base_ms: 100,
            retry_jitter_ms: 0,
            ..LlmConfig::default()
        };
        assert_eq!(backoff_delay(&cfg, 1, None), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 2, None), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 3, None), Duration::from_millis(400));
        assert_eq!(backoff_delay(&cfg, 0, None), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 2, Some(7)), Duration::from_secs(7));

        let ignore = LlmConfig {
            respect_retry_after: false,
            ..cfg
        };
        assert_eq!(backoff_delay(&ignore, 1, Some(7)), Duration::from_millis(100));
    }

    #[test]
    fn attribution_headers_present() {
        let c = ChatClient::new("https://api.example.com/", "secret", "m").unwrap();
        let h = c.headers().unwrap();
        assert_eq!(h.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert!(h.contains_key("HTTP-Referer"));
        assert_eq!(h.get("X-Title").unwrap(), APP_TITLE);
    }

    #[tokio::test]
    async fn fetch_model_pricing_finds_model() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/v1/models"),
                request::headers(contains(key("authorization"))),
            ])
            .respond_with(json_encoded(serde_json::json!({
                "data": [
                    {"id": "other/model", "pricing": {"prompt": "1", "completion": "1"}},
                    {"id": "anthropic/claude-sonnet-4", "pricing": {"prompt": "0.000003", "completion": "0.000015"}}
                ]
            }))),
        );
        let client = ChatClient::new(
            format!("{}/", server.url_str("")),
            "k",
            "anthropic/claude-sonnet-4",
        )
        .unwrap();
        let p = client.fetch_model_pricing().await.unwrap().unwrap();
        assert!((p.prompt - 0.000003).abs() < 1e-12);
        assert!((p.completion - 0.000015).abs() < 1e-12);
    }

    #[tokio::test]
    async fn fetch_model_pricing_unknown_model_is_none() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/models"))
                .respond_with(json_encoded(serde_json::json!({"data": []}))),
        );
        let client = ChatClient::new(server.url_str("/v1"), "k", "missing/model").unwrap();
        assert_eq!(client.fetch_model_pricing().await.unwrap(), None);
    }
}
