//! Advisory LLM client.
//!
//! Strictly advisory: the macro-trend evaluator may ask for a qualitative
//! summary of the scored indicator table, but the result only ever gets
//! appended to a decision's `reason` string. It can never change `action` or
//! `conviction`. Best-effort — failures and timeouts are swallowed by the
//! caller, not surfaced as evaluation errors.

use async_trait::async_trait;
use std::time::Duration;

pub const ADVISORY_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait LlmAdvisor: Send + Sync {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Default advisor when no external endpoint is configured. Always fails
/// fast so callers fall back to their non-LLM reason string.
pub struct DisabledAdvisor;

#[async_trait]
impl LlmAdvisor for DisabledAdvisor {
    async fn summarize(&self, _prompt: &str) -> anyhow::Result<String> {
        anyhow::bail!("advisory client disabled")
    }
}

/// Posts the prompt to a generic `{prompt} -> {summary}` HTTP endpoint,
/// bearer-authenticated. Same GET-and-parse posture as
/// `cache::fetchers::ConfigurableJsonFetcher`, just a POST with a body.
pub struct HttpLlmAdvisor {
    client: std::sync::Arc<reqwest::Client>,
    endpoint: String,
    api_token: String,
}

impl HttpLlmAdvisor {
    pub fn new(client: std::sync::Arc<reqwest::Client>, endpoint: String, api_token: String) -> Self {
        Self { client, endpoint, api_token }
    }
}

#[async_trait]
impl LlmAdvisor for HttpLlmAdvisor {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String> {
        let body: serde_json::Value = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?
            .json()
            .await?;
        body["summary"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("advisory response missing `summary` field"))
    }
}

/// Call `advisor` with the shared timeout, treating any failure or timeout as
/// "no summary available" rather than propagating an error.
pub async fn advise(advisor: &dyn LlmAdvisor, prompt: &str) -> Option<String> {
    match tokio::time::timeout(ADVISORY_TIMEOUT, advisor.summarize(prompt)).await {
        Ok(Ok(summary)) => Some(summary),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "advisory summary failed");
            None
        }
        Err(_) => {
            tracing::warn!("advisory summary timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAdvisor;

    #[async_trait]
    impl LlmAdvisor for EchoAdvisor {
        async fn summarize(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("summary: {prompt}"))
        }
    }

    #[tokio::test]
    async fn disabled_advisor_yields_no_summary() {
        assert_eq!(advise(&DisabledAdvisor, "hello").await, None);
    }

    #[tokio::test]
    async fn working_advisor_returns_summary() {
        assert_eq!(
            advise(&EchoAdvisor, "hello").await,
            Some("summary: hello".to_string())
        );
    }
}
