use crate::{
    signature::SignatureStore,
    toast::{Notifier, Severity},
};
use axum::body::Body;
use bytes::Bytes;
use regex::Regex;
use serde_json::json;
use std::{io, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

pub enum ChunkAction {
    Forward(String),
    /// Hard stop for runaway generations; the connection is closed without
    /// a terminator so the client treats the turn as finished.
    Terminate,
}

/// Chunk-level rewriter for upstream SSE. Works on raw text rather than
/// parsed JSON so partial frames split across read boundaries pass through
/// untouched.
pub struct StreamNormalizer {
    finish_tool_calls: Regex,
    null_tool_calls: Regex,
    stop_spelling: Regex,
    tool_calls_array: Regex,
    signature: Regex,
    loop_guard: Regex,
    harvested: Option<String>,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self {
            finish_tool_calls: Regex::new(r#""finish_reason"\s*:\s*"tool_calls""#)
                .expect("static regex"),
            null_tool_calls: Regex::new(r#""tool_calls"\s*:\s*null"#).expect("static regex"),
            stop_spelling: Regex::new(
                r#""finish_reason"\s*:\s*"(stop|STOP|did_not_finish|finished|end_turn|MAX_TOKENS)""#,
            )
            .expect("static regex"),
            tool_calls_array: Regex::new(r#""tool_calls"\s*:\s*\["#).expect("static regex"),
            signature: Regex::new(r#""thought_signature"\s*:\s*"([^"]+)""#).expect("static regex"),
            loop_guard: Regex::new(r"(?m)^\s*(User|user)\s*:").expect("static regex"),
            harvested: None,
        }
    }

    pub fn process(&mut self, chunk: &str) -> ChunkAction {
        let mut text = chunk.to_string();

        // A "tool_calls" finish reason paired with a null tool_calls field is
        // a lie some models tell; downgrade it before the client hangs
        // waiting for calls that never come.
        if self.null_tool_calls.is_match(&text) && self.finish_tool_calls.is_match(&text) {
            text = self
                .finish_tool_calls
                .replace_all(&text, r#""finish_reason": "stop""#)
                .into_owned();
        }

        if text.contains("finish_reason") && self.stop_spelling.is_match(&text) {
            let replacement = if self.tool_calls_array.is_match(&text) {
                r#""finish_reason": "tool_calls""#
            } else {
                r#""finish_reason": "stop""#
            };
            text = self.stop_spelling.replace_all(&text, replacement).into_owned();
        }

        if self.harvested.is_none() {
            if let Some(caps) = self.signature.captures(&text) {
                self.harvested = Some(caps[1].to_string());
            }
        }

        if self.loop_guard.is_match(&text) {
            return ChunkAction::Terminate;
        }

        ChunkAction::Forward(text)
    }

    pub fn harvested_signature(&self) -> Option<&str> {
        self.harvested.as_deref()
    }
}

impl Default for StreamNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Appended as a final delta chunk when a transparent fallback served the
/// request, so the switch is disclosed in the conversation itself.
pub struct FallbackNotice {
    pub model: String,
    pub reason: String,
}

pub struct RelayContext {
    pub fallback: Option<FallbackNotice>,
    pub request_hash: Option<String>,
    pub store: Arc<SignatureStore>,
    pub notifier: Arc<Notifier>,
    pub status_toast: Option<String>,
}

/// Pipes an upstream response to the client through the normalizer. The
/// pump runs in its own task; a closed client side stops it via channel
/// send failure, which drops the upstream response and aborts the transfer.
pub fn relay(response: reqwest::Response, ctx: RelayContext) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);

    tokio::spawn(async move {
        let mut normalizer = StreamNormalizer::new();
        let mut upstream = response.bytes_stream();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    match normalizer.process(&text) {
                        ChunkAction::Forward(out) => {
                            if tx.send(Ok(Bytes::from(out))).await.is_err() {
                                return;
                            }
                        }
                        ChunkAction::Terminate => {
                            tracing::warn!("loop pattern in stream, closing connection");
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream error");
                    let _ = tx.send(Err(io::Error::other(err))).await;
                    return;
                }
            }
        }

        if let Some(notice) = &ctx.fallback {
            let _ = tx.send(Ok(Bytes::from(fallback_notice_chunk(notice)))).await;
        }

        if let (Some(signature), Some(hash)) =
            (normalizer.harvested_signature(), ctx.request_hash.as_deref())
        {
            ctx.store.record(hash, signature);
        }

        if let Some(message) = ctx.status_toast {
            ctx.notifier
                .emit_status(Severity::Info, message, "Pollinations Status");
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

fn fallback_notice_chunk(notice: &FallbackNotice) -> String {
    let content = format!(
        "\n\n> ⚠️ **Safety Net**: {}. Switched to `{}`.",
        notice.reason, notice.model
    );
    let now = chrono::Utc::now();
    let chunk = json!({
        "id": format!("fallback-{}", now.timestamp_millis()),
        "object": "chat.completion.chunk",
        "created": now.timestamp(),
        "model": notice.model,
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant", "content": content },
            "finish_reason": null
        }]
    });
    format!("data: {chunk}\n\n")
}
