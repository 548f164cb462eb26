//! HTTP client for the chat-completions endpoint

use std::time::Duration;

use commentline_core::http::{error_from_response, http_client};
use commentline_core::{
    CancelToken, Classifier, ClassifyResponse, ServiceError, block_on_cancellable,
};

use crate::prompt::{build_request, parse_response};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            anyhow::bail!("OpenAI API key is empty (set OPENAI_API_KEY)");
        }
        Ok(Self {
            client: http_client(timeout)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// `insufficient_quota` comes back as a 429 but will not clear by waiting
fn is_billing_error(body: &str) -> bool {
    body.contains("insufficient_quota")
}

impl Classifier for OpenAiClassifier {
    fn model(&self) -> &str {
        &self.model
    }

    fn classify(
        &self,
        texts: &[&str],
        cancel: &CancelToken,
    ) -> Result<ClassifyResponse, ServiceError> {
        if texts.is_empty() {
            return Ok(ClassifyResponse {
                model_version: self.model.clone(),
                results: Vec::new(),
            });
        }

        let body = build_request(&self.model, texts);
        let req = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body);
        let expected = texts.len();
        let model = self.model.as_str();

        log::debug!("classify {expected} texts with {model}");
        block_on_cancellable(cancel, async move {
            let resp = req.send().await.map_err(ServiceError::from_reqwest)?;
            if !resp.status().is_success() {
                let err = error_from_response(resp).await;
                return Err(match err {
                    ServiceError::RateLimited { message, .. } if is_billing_error(&message) => {
                        ServiceError::Auth(message)
                    }
                    other => other,
                });
            }
            let text = resp.text().await.map_err(ServiceError::from_reqwest)?;
            parse_response(&text, model, expected)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_rejected() {
        assert!(OpenAiClassifier::new("", DEFAULT_MODEL, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn endpoint_joins_base() {
        let c = OpenAiClassifier::new("sk-x", DEFAULT_MODEL, Duration::from_secs(5))
            .unwrap()
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(c.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(c.model(), DEFAULT_MODEL);
    }

    #[test]
    fn empty_batch_skips_request() {
        let c = OpenAiClassifier::new("sk-x", "m", Duration::from_secs(5))
            .unwrap()
            .with_base_url("http://127.0.0.1:1");
        let resp = c.classify(&[], &CancelToken::new()).unwrap();
        assert!(resp.results.is_empty());
        assert_eq!(resp.model_version, "m");
    }

    #[test]
    fn billing_errors_detected() {
        assert!(is_billing_error(r#"{"error":{"code":"insufficient_quota"}}"#));
        assert!(!is_billing_error(r#"{"error":{"code":"rate_limit_exceeded"}}"#));
    }

    #[test]
    #[ignore] // requires OPENAI_API_KEY and network
    fn live_classify() {
        let key = std::env::var("OPENAI_API_KEY").unwrap();
        let c = OpenAiClassifier::new(key, DEFAULT_MODEL, Duration::from_secs(30)).unwrap();
        let resp = c
            .classify(&["I love this", "worst video ever"], &CancelToken::new())
            .unwrap();
        assert_eq!(resp.results.len(), 2);
    }
}
