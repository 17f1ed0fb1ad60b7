use crate::{
    commands,
    config::{ConfigProvider, Mode},
    error::ProxyError,
    quota::{self, QuotaOracle},
    routing::{self, RoutingDecision, Universe},
    signature::SignatureStore,
    stream::{self, FallbackNotice, RelayContext},
    toast::{Notifier, Severity},
    transform,
    upstream::{self, FallbackTrigger, UpstreamClient},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, header::HeaderName},
    response::Response,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tower_http::cors::CorsLayer;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

// Hop-by-hop headers plus the entity headers invalidated by rewriting the
// stream.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "content-length",
    "content-encoding",
];

#[derive(Clone)]
pub struct ServerState {
    pub provider: Arc<ConfigProvider>,
    pub oracle: Arc<QuotaOracle>,
    pub signatures: Arc<SignatureStore>,
    pub notifier: Arc<Notifier>,
    pub upstream: Arc<UpstreamClient>,
}

pub struct ProxyHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

pub async fn spawn(state: ServerState, listen_addr: &str) -> Result<ProxyHandle> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| "failed to parse listen_addr")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind proxy listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(state);
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %addr, "proxy listener started");

    Ok(ProxyHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

impl ProxyHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_handler))
        .route("/chat/completions", post(chat_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn health_handler(State(state): State<ServerState>) -> Json<Value> {
    let config = state.provider.current();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": config.routing.mode.to_string(),
    }))
}

async fn chat_handler(
    State(state): State<ServerState>,
    raw: Bytes,
) -> Result<Response, ProxyError> {
    let mut body: Value = serde_json::from_slice(&raw).map_err(ProxyError::MalformedRequest)?;
    let config = state.provider.current();

    // Slash commands ride in as ordinary user messages and are answered
    // locally without ever reaching an upstream.
    if let Some(text) = commands::trailing_user_text(&body) {
        if commands::is_command(&text) {
            tracing::info!(command = %text, "intercepting command");
            let result =
                commands::handle_command(&text, &state.provider, &state.oracle, &state.notifier)
                    .await;
            if result.handled {
                let model = body
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or("pollinations-proxy");
                return Ok(commands::synthesized_stream_response(model, result.text()));
            }
        }
    }

    let quota = state
        .oracle
        .snapshot(
            config.routing.api_key.as_deref(),
            config.routing.thresholds.tier_percent,
            false,
        )
        .await;

    let model_field = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let mut decision = routing::resolve_route(&model_field, &config.routing, &quota);
    let originally_enterprise = decision.universe == Universe::Enterprise;

    if decision.needs_auth() && config.routing.api_key.is_none() {
        return Err(ProxyError::AuthRequired);
    }

    if let Some(reason) = &decision.fallback_reason {
        state.notifier.emit_status(
            Severity::Warning,
            format!("⚠️ Safety Net: {} ({reason})", decision.model),
            "Pollinations Safety",
        );
    }

    let mut rules = routing::rules_for(&decision.model);
    let outcome = transform::transform_body(&mut body, &decision, &rules, &state.signatures);

    let api_key = decision
        .needs_auth()
        .then(|| config.routing.api_key.clone())
        .flatten();
    let mut response = state
        .upstream
        .send_chat(
            decision.chat_url(&config.upstream),
            api_key.as_deref(),
            &body,
        )
        .await
        .map_err(ProxyError::Upstream)?;

    // Transparent fallback on definitive rejections. Manual mode relays the
    // error untouched.
    if !response.status().is_success() && config.routing.mode != Mode::Manual {
        let has_tools = body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|tools| !tools.is_empty());
        if let Some(trigger) = upstream::classify_rejection(
            response.status(),
            decision.universe,
            &decision.model,
            has_tools,
        ) {
            let reason = trigger.reason();
            let fallback_model = match trigger {
                FallbackTrigger::EnterpriseRejected(_) => {
                    routing::strip_namespace(&config.routing.fallbacks.free_main).to_string()
                }
                FallbackTrigger::GeminiToolsRejected => {
                    routing::strip_namespace(&config.routing.fallbacks.tools_capable).to_string()
                }
            };
            tracing::warn!(
                status = %response.status(),
                reason = %reason,
                fallback = %fallback_model,
                "upstream rejection, attempting transparent fallback"
            );
            state.notifier.emit_status(
                Severity::Warning,
                format!("⚠️ Safety Net: {fallback_model} ({reason})"),
                "Pollinations Safety",
            );
            state.notifier.emit_log(
                Severity::Warning,
                format!(
                    "Recovering from {} -> switching to {fallback_model}",
                    response.status()
                ),
                "Safety Net",
            );

            decision = RoutingDecision {
                universe: Universe::Free,
                model: fallback_model,
                is_fallback_active: true,
                fallback_reason: Some(reason),
            };
            rules = routing::rules_for(&decision.model);
            transform::transform_body(&mut body, &decision, &rules, &state.signatures);

            match state
                .upstream
                .send_chat(decision.chat_url(&config.upstream), None, &body)
                .await
            {
                Ok(retry) if retry.status().is_success() => response = retry,
                Ok(retry) => {
                    tracing::warn!(
                        status = %retry.status(),
                        "fallback attempt also rejected, relaying original response"
                    );
                }
                Err(err) => {
                    tracing::warn!(error = %err, "fallback request failed, relaying original response");
                }
            }
        }
    }

    let status = response.status();
    let headers = filter_response_headers(response.headers());

    let status_toast = (originally_enterprise || decision.is_fallback_active).then(|| {
        let mut label = config.routing.mode.to_string().to_uppercase();
        if decision.is_fallback_active {
            label.push_str(" (FALLBACK)");
        }
        format!("{} | ⚙️ {label}", quota::format_for_toast(&quota))
    });
    let fallback = decision.is_fallback_active.then(|| FallbackNotice {
        model: decision.model.clone(),
        reason: decision.fallback_reason.clone().unwrap_or_default(),
    });

    let relay_body = stream::relay(
        response,
        RelayContext {
            fallback,
            request_hash: outcome.request_hash,
            store: state.signatures.clone(),
            notifier: state.notifier.clone(),
            status_toast,
        },
    );

    let mut out = Response::builder()
        .status(status)
        .body(relay_body)
        .map_err(|err| ProxyError::Internal(anyhow!(err)))?;
    *out.headers_mut() = headers;
    Ok(out)
}

fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        if is_stripped_response_header(name) {
            continue;
        }
        let _ = out.append(name.clone(), value.clone());
    }
    out
}

fn is_stripped_response_header(name: &HeaderName) -> bool {
    STRIPPED_RESPONSE_HEADERS
        .iter()
        .any(|stripped| name.as_str().eq_ignore_ascii_case(stripped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::{http::StatusCode, response::IntoResponse};

    const FREE_SSE: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"hello from free\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"end_turn\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    async fn spawn_upstream_mock() -> String {
        async fn free() -> impl IntoResponse {
            ([("content-type", "text/event-stream")], FREE_SSE)
        }
        async fn enterprise() -> impl IntoResponse {
            (StatusCode::PAYMENT_REQUIRED, "quota exhausted")
        }
        async fn profile() -> Json<Value> {
            Json(json!({"tier": "flower", "nextResetAt": "2026-08-23 06:00:00"}))
        }
        async fn balance() -> Json<Value> {
            Json(json!({"balance": 15.0}))
        }
        async fn usage() -> Json<Value> {
            Json(json!({"usage": []}))
        }

        let app = Router::new()
            .route("/free/chat", post(free))
            .route("/enterprise/chat", post(enterprise))
            .route("/account/profile", get(profile))
            .route("/account/balance", get(balance))
            .route("/account/usage", get(usage));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn spawn_proxy(configure: impl FnOnce(&mut AppConfig)) -> (String, tempfile::TempDir) {
        let base = spawn_upstream_mock().await;
        let dir = tempfile::tempdir().unwrap();

        let mut config = AppConfig::default();
        config.upstream.free_chat_url = format!("{base}/free/chat");
        config.upstream.enterprise_chat_url = format!("{base}/enterprise/chat");
        config.upstream.account_base_url = base;
        config.signatures.cache_path = dir.path().join("signatures.json");
        configure(&mut config);

        let provider = Arc::new(ConfigProvider::new(dir.path().join("config.toml"), config.clone()));
        let state = ServerState {
            oracle: Arc::new(QuotaOracle::new(&config.upstream).unwrap()),
            signatures: Arc::new(SignatureStore::load(config.signatures.cache_path.clone())),
            notifier: Arc::new(Notifier::new(provider.clone())),
            upstream: Arc::new(UpstreamClient::new(&config.upstream).unwrap()),
            provider,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), dir)
    }

    #[tokio::test]
    async fn health_reports_mode_and_version() {
        let (proxy, _dir) = spawn_proxy(|_| {}).await;
        let response: Value = reqwest::get(format!("{proxy}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["status"], "ok");
        assert_eq!(response["mode"], "manual");
        assert_eq!(response["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn malformed_body_returns_400() {
        let (proxy, _dir) = spawn_proxy(|_| {}).await;
        let response = reqwest::Client::new()
            .post(format!("{proxy}/v1/chat/completions"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enterprise_without_key_returns_401() {
        let (proxy, _dir) = spawn_proxy(|_| {}).await;
        let response = reqwest::Client::new()
            .post(format!("{proxy}/v1/chat/completions"))
            .json(&json!({"model": "enter/gemini-pro", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"]["message"].as_str().unwrap().contains("API key"));
    }

    #[tokio::test]
    async fn free_request_streams_normalized_chunks() {
        let (proxy, _dir) = spawn_proxy(|_| {}).await;
        let text = reqwest::Client::new()
            .post(format!("{proxy}/v1/chat/completions"))
            .json(&json!({
                "model": "free/mistral",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("hello from free"));
        assert!(text.contains(r#""finish_reason": "stop""#));
        assert!(!text.contains("end_turn"));
    }

    #[tokio::test]
    async fn enterprise_rejection_falls_back_transparently() {
        let (proxy, _dir) = spawn_proxy(|config| {
            config.routing.mode = Mode::Pro;
            config.routing.api_key = Some("sk-test".to_string());
        })
        .await;

        let response = reqwest::Client::new()
            .post(format!("{proxy}/v1/chat/completions"))
            .json(&json!({
                "model": "enter/gemini-pro",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(text.contains("hello from free"));
        assert!(text.contains("Safety Net"));
        assert!(text.contains("Insufficient Funds (Upstream 402)"));
        assert!(text.contains("Switched to `mistral`"));
    }

    #[tokio::test]
    async fn manual_mode_relays_rejection_untouched() {
        let (proxy, _dir) = spawn_proxy(|config| {
            config.routing.mode = Mode::Manual;
            config.routing.api_key = Some("sk-test".to_string());
        })
        .await;

        let response = reqwest::Client::new()
            .post(format!("{proxy}/v1/chat/completions"))
            .json(&json!({
                "model": "enter/gemini-pro",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn slash_command_is_answered_locally() {
        let (proxy, _dir) = spawn_proxy(|_| {}).await;
        let response = reqwest::Client::new()
            .post(format!("{proxy}/v1/chat/completions"))
            .json(&json!({
                "model": "free/mistral",
                "messages": [{"role": "user", "content": "/pollinations help"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );
        let text = response.text().await.unwrap();
        assert!(text.contains("Pollinations Proxy Commands"));
        assert!(text.contains("data: [DONE]"));
    }
}
