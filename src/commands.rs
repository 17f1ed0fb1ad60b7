use crate::{
    config::{ConfigProvider, LogVerbosity, Mode, StatusVerbosity},
    quota::{QuotaOracle, UsageEntry, parse_usage_timestamp},
    toast::{Notifier, Severity},
};
use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Outcome of an intercepted chat message. `handled == false` means the text
/// was not addressed to the proxy and must be forwarded upstream.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub handled: bool,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl CommandResult {
    fn response(text: impl Into<String>) -> Self {
        Self {
            handled: true,
            response: Some(text.into()),
            error: None,
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            handled: true,
            response: None,
            error: Some(text.into()),
        }
    }

    pub fn text(&self) -> &str {
        self.response
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("Command executed.")
    }
}

pub fn is_command(text: &str) -> bool {
    text.starts_with("/pollinations") || text.starts_with("/poll")
}

/// Extracts the trimmed text of the trailing user message, handling both
/// plain-string and multimodal part-array content.
pub fn trailing_user_text(body: &Value) -> Option<String> {
    let last = body.get("messages")?.as_array()?.last()?;
    if last.get("role").and_then(Value::as_str) != Some("user") {
        return None;
    }
    let text = match last.get("content")? {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| {
                part.get("text")
                    .or_else(|| part.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
            })
            .collect(),
        _ => return None,
    };
    Some(text.trim().to_string())
}

pub async fn handle_command(
    command: &str,
    provider: &ConfigProvider,
    oracle: &QuotaOracle,
    notifier: &Notifier,
) -> CommandResult {
    let parts: Vec<&str> = command.split_whitespace().collect();
    let Some(first) = parts.first() else {
        return CommandResult::default();
    };
    if !first.starts_with("/poll") {
        return CommandResult::default();
    }

    let args = parts.get(2..).unwrap_or(&[]);
    match parts.get(1).copied() {
        Some("mode") => handle_mode(args, provider, notifier),
        Some("usage") => handle_usage(args, provider, oracle).await,
        Some("connect") => handle_connect(args, provider, notifier),
        Some("fallback") => handle_fallback(args, provider),
        Some("config") => handle_config(args, provider),
        Some("help") | None => handle_help(),
        Some(other) => {
            CommandResult::error(format!("Unknown command: {other}. See /pollinations help"))
        }
    }
}

fn handle_mode(args: &[&str], provider: &ConfigProvider, notifier: &Notifier) -> CommandResult {
    let Some(&value) = args.first() else {
        let config = provider.current();
        return CommandResult::response(format!("Current mode: {}", config.routing.mode));
    };

    let Ok(mode) = value.parse::<Mode>() else {
        return CommandResult::error(format!(
            "Invalid mode: {value}. Expected manual, alwaysfree or pro"
        ));
    };

    match provider.update(|config| config.routing.mode = mode) {
        Ok(updated) => {
            // Pro without a key degrades to manual on save.
            let effective = updated.routing.mode;
            notifier.emit_status(
                Severity::Success,
                format!("Mode changed to: {effective}"),
                "Pollinations Config",
            );
            if effective == mode {
                CommandResult::response(format!("✅ Mode changed: {effective}"))
            } else {
                CommandResult::response(format!(
                    "✅ Mode changed: {effective} (pro requires an API key, use /pollinations connect)"
                ))
            }
        }
        Err(err) => CommandResult::error(format!("Failed to save config: {err}")),
    }
}

async fn handle_usage(
    args: &[&str],
    provider: &ConfigProvider,
    oracle: &QuotaOracle,
) -> CommandResult {
    let full = args.first() == Some(&"full");
    let config = provider.current();
    let quota = oracle
        .snapshot(
            config.routing.api_key.as_deref(),
            config.routing.thresholds.tier_percent,
            true,
        )
        .await;

    let until_reset = (quota.next_reset_at - Utc::now()).max(Duration::zero());
    let hours = until_reset.num_hours();
    let minutes = until_reset.num_minutes() - hours * 60;
    let used = (quota.tier_limit - quota.tier_remaining).max(0.0);

    let mut response = format!(
        "### 🌸 Pollinations Dashboard ({})\n\n",
        config.routing.mode.to_string().to_uppercase()
    );
    response.push_str("**Resources**\n");
    response.push_str(&format!(
        "- **Tier**: {} {} ({} pollen/day)\n",
        quota.tier_emoji,
        quota.tier.to_uppercase(),
        quota.tier_limit
    ));
    response.push_str(&format!(
        "- **Quota**: {} / {}\n",
        format_pollen(used),
        format_pollen(quota.tier_limit)
    ));
    response.push_str(&format!(
        "- **Usage**: {}\n",
        progress_bar(used, quota.tier_limit)
    ));
    response.push_str(&format!("- **Wallet**: ${:.2}\n", quota.wallet_balance));
    response.push_str(&format!(
        "- **Reset**: {} (in {hours}h {minutes}m)\n",
        quota.next_reset_at.format("%H:%M")
    ));

    if full {
        match config.routing.api_key.as_deref() {
            Some(key) => match oracle.detailed_usage(key).await {
                Ok(usage) => {
                    let last_reset = quota.next_reset_at - Duration::hours(24);
                    response.push_str(&period_breakdown(&usage, last_reset));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "detailed usage fetch failed");
                    response.push_str("\n> ⚠️ *Could not fetch the detailed usage history.*\n");
                }
            },
            None => response.push_str("\n> ⚠️ *Full mode requires an API key.*\n"),
        }
    } else {
        response.push_str("\n_Type_ `/pollinations usage full` _for the breakdown._\n");
    }

    CommandResult::response(response.trim().to_string())
}

fn handle_connect(args: &[&str], provider: &ConfigProvider, notifier: &Notifier) -> CommandResult {
    let Some(&key) = args.first() else {
        return CommandResult::error("Usage: /pollinations connect <sk-xxxx>");
    };
    if !key.starts_with("sk-") {
        return CommandResult::error("Invalid key. It must start with 'sk-'.");
    }

    match provider.update(|config| config.routing.api_key = Some(key.to_string())) {
        Ok(_) => {
            notifier.emit_status(Severity::Success, "API key saved", "Pollinations Config");
            CommandResult::response(
                "✅ API key connected. (Use /pollinations mode pro to activate it)",
            )
        }
        Err(err) => CommandResult::error(format!("Failed to save config: {err}")),
    }
}

fn handle_fallback(args: &[&str], provider: &ConfigProvider) -> CommandResult {
    let Some(&main) = args.first() else {
        let config = provider.current();
        return CommandResult::response(format!(
            "Current fallbacks:\nFree: main={}, agent={}\nTools-capable: {}",
            config.routing.fallbacks.free_main,
            config.routing.fallbacks.free_agent,
            config.routing.fallbacks.tools_capable
        ));
    };
    let agent = args.get(1).copied();

    match provider.update(|config| {
        config.routing.fallbacks.free_main = main.to_string();
        if let Some(agent) = agent {
            config.routing.fallbacks.free_agent = agent.to_string();
        }
    }) {
        Ok(updated) => CommandResult::response(format!(
            "✅ Fallback (free) configured: main={}, agent={}",
            updated.routing.fallbacks.free_main, updated.routing.fallbacks.free_agent
        )),
        Err(err) => CommandResult::error(format!("Failed to save config: {err}")),
    }
}

fn handle_config(args: &[&str], provider: &ConfigProvider) -> CommandResult {
    let Some(&key) = args.first() else {
        let config = provider.current();
        return match toml::to_string_pretty(&config) {
            Ok(dump) => CommandResult::response(format!("```toml\n{dump}```")),
            Err(err) => CommandResult::error(format!("Failed to render config: {err}")),
        };
    };
    let Some(&value) = args.get(1) else {
        return CommandResult::error(format!("Usage: /pollinations config {key} <value>"));
    };

    let result = match key {
        "status_gui" => match StatusVerbosity::parse(value) {
            Some(verbosity) => provider.update(|config| config.gui.status = verbosity),
            None => return CommandResult::error("Values: none, alert, all"),
        },
        "logs_gui" => match LogVerbosity::parse(value) {
            Some(verbosity) => provider.update(|config| config.gui.logs = verbosity),
            None => return CommandResult::error("Values: none, error, verbose"),
        },
        "threshold_tier" => match value.parse::<f64>() {
            Ok(percent) if (0.0..=100.0).contains(&percent) => {
                provider.update(|config| config.routing.thresholds.tier_percent = percent)
            }
            _ => return CommandResult::error("A value between 0 and 100 is required"),
        },
        "threshold_wallet" => match value.parse::<f64>() {
            Ok(usd) if usd >= 0.0 => {
                provider.update(|config| config.routing.thresholds.wallet_usd = usd)
            }
            _ => return CommandResult::error("A non-negative dollar amount is required"),
        },
        other => {
            return CommandResult::error(format!(
                "Unknown key: {other}. Keys: status_gui, logs_gui, threshold_tier, threshold_wallet"
            ));
        }
    };

    match result {
        Ok(_) => CommandResult::response(format!("✅ {key} = {value}")),
        Err(err) => CommandResult::error(format!("Failed to save config: {err}")),
    }
}

fn handle_help() -> CommandResult {
    CommandResult::response(
        r"### 🌸 Pollinations Proxy Commands

- **`/pollinations mode [mode]`**: Show or change the mode (manual, alwaysfree, pro).
- **`/pollinations usage [full]`**: Show the quota dashboard (full = per-model breakdown).
- **`/pollinations connect <sk-xxxx>`**: Save the enterprise API key.
- **`/pollinations fallback <main> [agent]`**: Configure the free safety-net models.
- **`/pollinations config [key] [value]`**:
  - `status_gui`: none, alert, all (status dashboard).
  - `logs_gui`: none, error, verbose (technical logs).
  - `threshold_tier`: 0-100 (safety-net tier %).
  - `threshold_wallet`: dollars (pro-mode wallet floor).",
    )
}

#[derive(Default)]
struct ModelStats {
    requests: u64,
    cost: f64,
    tokens: u64,
}

fn period_breakdown(usage: &[UsageEntry], last_reset: DateTime<Utc>) -> String {
    let mut total_requests = 0u64;
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut models: BTreeMap<String, ModelStats> = BTreeMap::new();

    for entry in usage {
        let in_period = parse_usage_timestamp(&entry.timestamp)
            .map(|ts| ts >= last_reset)
            .unwrap_or(false);
        if !in_period {
            continue;
        }
        total_requests += 1;
        input_tokens += entry.input_text_tokens.unwrap_or(0);
        output_tokens += entry.output_text_tokens.unwrap_or(0);

        let stats = models
            .entry(entry.model.clone().unwrap_or_else(|| "unknown".to_string()))
            .or_default();
        stats.requests += 1;
        stats.cost += entry.cost_usd;
        stats.tokens +=
            entry.input_text_tokens.unwrap_or(0) + entry.output_text_tokens.unwrap_or(0);
    }

    let mut sorted: Vec<(String, ModelStats)> = models.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cost.total_cmp(&a.1.cost));

    let mut out = format!(
        "\n### 📊 Period Detail (since {})\n**Total Requests**: {total_requests} | **Tokens**: In {} / Out {}\n\n",
        last_reset.format("%H:%M"),
        format_tokens(input_tokens),
        format_tokens(output_tokens)
    );
    out.push_str("| Model | Reqs | Cost | Tokens |\n");
    out.push_str("| :--- | :---: | :---: | :---: |\n");
    for (model, stats) in sorted {
        out.push_str(&format!(
            "| `{model}` | {} | {} | {} |\n",
            stats.requests,
            format_pollen(stats.cost),
            format_tokens(stats.tokens)
        ));
    }
    out
}

fn format_pollen(amount: f64) -> String {
    format!("{amount:.2} 🌼")
}

fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.2}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

fn progress_bar(value: f64, max: f64) -> String {
    let (filled, percent) = if max > 0.0 {
        (
            ((value / max) * 10.0).round().clamp(0.0, 10.0) as usize,
            (value / max * 100.0).round() as i64,
        )
    } else {
        (0, 0)
    };
    format!("`{}{}` ({percent}%)", "█".repeat(filled), "░".repeat(10 - filled))
}

/// Chat clients expect an SSE answer even for intercepted commands, so the
/// result is synthesized as a two-chunk completion stream.
pub fn synthesized_stream_response(model: &str, content: &str) -> Response {
    let now = Utc::now();
    let id = format!("pollinations-cmd-{}", now.timestamp_millis());
    let created = now.timestamp();

    let content_chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant", "content": content },
            "finish_reason": null
        }]
    });
    let stop_chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }]
    });

    let body = format!("data: {content_chunk}\n\ndata: {stop_chunk}\n\ndata: [DONE]\n\n");
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
