use crate::{config::UpstreamConfig, routing::Universe};
use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode, header};
use serde_json::Value;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// HTTP client for the chat endpoints of both universes.
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pollinations-proxy/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_secs))
            .read_timeout(Duration::from_secs(upstream.read_timeout_secs))
            .build()
            .context("failed to build upstream client")?;
        Ok(Self { client })
    }

    /// POSTs a chat body, retrying transient failures with a fixed delay.
    /// Exactly `MAX_ATTEMPTS` attempts; the final response is returned even
    /// when non-2xx so the caller can relay or reroute it.
    pub async fn send_chat(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<Response> {
        let mut attempt = 1u32;
        loop {
            let mut request = self
                .client
                .post(url)
                .header(header::ACCEPT, "application/json, text/event-stream")
                .json(body);
            if let Some(key) = api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || !should_retry(status) || attempt >= MAX_ATTEMPTS {
                        return Ok(response);
                    }
                    tracing::warn!(%status, attempt, url, "retryable upstream status");
                }
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err).with_context(|| {
                            format!("request to {url} failed after {MAX_ATTEMPTS} attempts")
                        });
                    }
                    tracing::warn!(error = %err, attempt, url, "upstream request error, retrying");
                }
            }

            tokio::time::sleep(RETRY_DELAY).await;
            attempt += 1;
        }
    }
}

/// Rate limiting, origin-unreachable (Cloudflare 520) and server errors are
/// transient; definitive client errors are not.
pub fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 520 || status.is_server_error()
}

/// A definitive rejection that warrants rerouting the request instead of
/// surfacing the error to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTrigger {
    /// Enterprise refused on quota or credential grounds.
    EnterpriseRejected(StatusCode),
    /// The free gemini endpoint rejects tool-bearing requests with 401;
    /// a tools-capable free model can serve them instead.
    GeminiToolsRejected,
}

impl FallbackTrigger {
    pub fn reason(&self) -> String {
        match self {
            FallbackTrigger::EnterpriseRejected(status) => match status.as_u16() {
                402 => "Insufficient Funds (Upstream 402)".to_string(),
                429 => "Rate Limit (Upstream 429)".to_string(),
                401 => "Invalid API Key (Upstream 401)".to_string(),
                other => format!("Access Denied ({other})"),
            },
            FallbackTrigger::GeminiToolsRejected => {
                "Gemini Tools Auth Failed (Fallback to OpenAI)".to_string()
            }
        }
    }
}

pub fn classify_rejection(
    status: StatusCode,
    universe: Universe,
    model: &str,
    has_tools: bool,
) -> Option<FallbackTrigger> {
    match universe {
        Universe::Enterprise => matches!(status.as_u16(), 401 | 402 | 403 | 429)
            .then_some(FallbackTrigger::EnterpriseRejected(status)),
        Universe::Free => {
            (status == StatusCode::UNAUTHORIZED && model.contains("gemini") && has_tools)
                .then_some(FallbackTrigger::GeminiToolsRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::post};
    use serde_json::json;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    async fn spawn_mock(failures_before_ok: usize, fail_status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/chat",
            post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures_before_ok {
                        (fail_status, "try later".to_string())
                    } else {
                        (StatusCode::OK, "{}".to_string())
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/chat"), hits)
    }

    fn client() -> UpstreamClient {
        UpstreamClient::new(&crate::config::UpstreamConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn transient_errors_are_retried_up_to_three_attempts() {
        let (url, hits) = spawn_mock(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let response = client()
            .send_chat(&url, None, &json!({"model": "mistral"}))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_exactly_three() {
        let (url, hits) = spawn_mock(10, StatusCode::TOO_MANY_REQUESTS).await;
        let response = client()
            .send_chat(&url, None, &json!({"model": "mistral"}))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn definitive_client_errors_are_not_retried() {
        let (url, hits) = spawn_mock(10, StatusCode::UNAUTHORIZED).await;
        let response = client()
            .send_chat(&url, None, &json!({"model": "mistral"}))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_predicate_matches_transient_statuses() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry(StatusCode::from_u16(520).unwrap()));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
        assert!(!should_retry(StatusCode::NOT_FOUND));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn enterprise_rejections_trigger_fallback() {
        for code in [401u16, 402, 403, 429] {
            let status = StatusCode::from_u16(code).unwrap();
            let trigger = classify_rejection(status, Universe::Enterprise, "gemini-pro", false);
            assert_eq!(trigger, Some(FallbackTrigger::EnterpriseRejected(status)));
        }
        assert!(classify_rejection(StatusCode::NOT_FOUND, Universe::Enterprise, "x", false).is_none());
    }

    #[test]
    fn gemini_tools_fallback_needs_all_three_conditions() {
        assert_eq!(
            classify_rejection(StatusCode::UNAUTHORIZED, Universe::Free, "gemini-fast", true),
            Some(FallbackTrigger::GeminiToolsRejected)
        );
        assert!(classify_rejection(StatusCode::UNAUTHORIZED, Universe::Free, "gemini-fast", false).is_none());
        assert!(classify_rejection(StatusCode::UNAUTHORIZED, Universe::Free, "mistral", true).is_none());
        assert!(classify_rejection(StatusCode::FORBIDDEN, Universe::Free, "gemini-fast", true).is_none());
    }

    #[test]
    fn reasons_name_the_upstream_status() {
        assert_eq!(
            FallbackTrigger::EnterpriseRejected(StatusCode::PAYMENT_REQUIRED).reason(),
            "Insufficient Funds (Upstream 402)"
        );
        assert_eq!(
            FallbackTrigger::EnterpriseRejected(StatusCode::FORBIDDEN).reason(),
            "Access Denied (403)"
        );
        assert_eq!(
            FallbackTrigger::GeminiToolsRejected.reason(),
            "Gemini Tools Auth Failed (Fallback to OpenAI)"
        );
    }
}
