use crate::config::UpstreamConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Timelike, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const CACHE_TTL: Duration = Duration::from_secs(30);

/// Consumption state for a credential. `tier == "error"` is the sentinel for
/// "oracle unreachable" and must bias routing toward the free universe.
#[derive(Debug, Clone)]
pub struct QuotaSnapshot {
    pub tier: String,
    pub tier_emoji: &'static str,
    pub tier_limit: f64,
    pub tier_used: f64,
    pub tier_remaining: f64,
    pub wallet_balance: f64,
    pub next_reset_at: DateTime<Utc>,
    pub can_use_enterprise: bool,
    pub is_using_wallet: bool,
    pub needs_alert: bool,
}

impl QuotaSnapshot {
    pub fn is_error(&self) -> bool {
        self.tier == "error"
    }

    pub fn tier_ratio(&self) -> f64 {
        if self.tier_limit > 0.0 {
            self.tier_remaining / self.tier_limit
        } else {
            0.0
        }
    }

    fn missing_key() -> Self {
        Self {
            tier: "none".to_string(),
            tier_emoji: "❌",
            tier_limit: 0.0,
            tier_used: 0.0,
            tier_remaining: 0.0,
            wallet_balance: 0.0,
            next_reset_at: Utc::now(),
            can_use_enterprise: false,
            is_using_wallet: false,
            needs_alert: false,
        }
    }

    fn unreachable() -> Self {
        Self {
            tier: "error".to_string(),
            tier_emoji: "⚠️",
            tier_limit: 1.0,
            tier_used: 0.0,
            tier_remaining: 0.0,
            wallet_balance: 0.0,
            next_reset_at: Utc::now(),
            can_use_enterprise: false,
            is_using_wallet: false,
            needs_alert: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    tier: String,
    next_reset_at: String,
}

#[derive(Debug, Deserialize)]
struct Balance {
    balance: f64,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    usage: Vec<UsageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageEntry {
    pub timestamp: String,
    #[serde(default)]
    pub model: Option<String>,
    pub meter_source: String,
    pub cost_usd: f64,
    #[serde(default)]
    pub input_text_tokens: Option<u64>,
    #[serde(default)]
    pub output_text_tokens: Option<u64>,
}

fn tier_limit_for(tier: &str) -> (f64, &'static str) {
    match tier {
        "spore" => (1.0, "🦠"),
        "seed" => (3.0, "🌱"),
        "flower" => (10.0, "🌸"),
        "nectar" => (20.0, "🍯"),
        _ => (1.0, "❓"),
    }
}

/// Client for the account endpoints on the enterprise host, with a short
/// time-bounded memo so per-request routing checks don't hammer the API.
/// Never fails: errors degrade to the cached value, then to the "error"
/// sentinel snapshot.
pub struct QuotaOracle {
    client: Client,
    base_url: String,
    cache: Mutex<Option<(Instant, QuotaSnapshot)>>,
}

impl QuotaOracle {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pollinations-proxy/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build quota oracle client")?;
        Ok(Self {
            client,
            base_url: upstream.account_base_url.trim_end_matches('/').to_string(),
            cache: Mutex::new(None),
        })
    }

    pub async fn snapshot(
        &self,
        api_key: Option<&str>,
        tier_alert_percent: f64,
        force_refresh: bool,
    ) -> QuotaSnapshot {
        let Some(api_key) = api_key else {
            return QuotaSnapshot::missing_key();
        };

        let mut cache = self.cache.lock().await;
        if !force_refresh {
            if let Some((fetched_at, snapshot)) = cache.as_ref() {
                if fetched_at.elapsed() < CACHE_TTL {
                    return snapshot.clone();
                }
            }
        }

        match self.fetch_fresh(api_key, tier_alert_percent).await {
            Ok(snapshot) => {
                *cache = Some((Instant::now(), snapshot.clone()));
                snapshot
            }
            Err(err) => {
                tracing::warn!(error = %err, "quota fetch failed");
                match cache.as_ref() {
                    Some((_, stale)) => stale.clone(),
                    None => QuotaSnapshot::unreachable(),
                }
            }
        }
    }

    async fn fetch_fresh(&self, api_key: &str, tier_alert_percent: f64) -> Result<QuotaSnapshot> {
        let (profile, balance, usage) = tokio::try_join!(
            self.get_json::<Profile>("/account/profile", api_key),
            self.get_json::<Balance>("/account/balance", api_key),
            self.get_json::<UsageResponse>("/account/usage", api_key),
        )?;

        let (tier_limit, tier_emoji) = tier_limit_for(&profile.tier);
        let next_reset_hint = parse_reset_timestamp(&profile.next_reset_at)
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(24));
        let now = Utc::now();
        let (last_reset, next_reset) = reset_window(next_reset_hint, now);

        let tier_used = current_period_tier_usage(&usage.usage, last_reset);
        let tier_remaining = round4((tier_limit - tier_used).max(0.0));
        // Wallet is whatever the total balance holds beyond the unconsumed
        // free tier.
        let wallet_balance = round4((balance.balance - tier_remaining).max(0.0));

        Ok(QuotaSnapshot {
            tier: profile.tier,
            tier_emoji,
            tier_limit,
            tier_used,
            tier_remaining,
            wallet_balance,
            next_reset_at: next_reset,
            can_use_enterprise: tier_remaining > 0.05 || wallet_balance > 0.05,
            is_using_wallet: tier_remaining <= 0.05 && wallet_balance > 0.05,
            needs_alert: tier_limit > 0.0
                && (tier_remaining / tier_limit * 100.0) <= tier_alert_percent,
        })
    }

    pub async fn detailed_usage(&self, api_key: &str) -> Result<Vec<UsageEntry>> {
        let response = self
            .get_json::<UsageResponse>("/account/usage", api_key)
            .await?;
        Ok(response.usage)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, api_key: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .with_context(|| format!("account request to {path} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("account API returned {status} for {path}");
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("account response from {path} was not valid JSON"))
    }
}

/// The API reports the user's next reset time; the reset hour varies per
/// user. Project that hour onto today to find the current window.
pub fn reset_window(
    next_reset_hint: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let today_reset = now
        .date_naive()
        .and_hms_opt(
            next_reset_hint.hour(),
            next_reset_hint.minute(),
            next_reset_hint.second(),
        )
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);

    if now >= today_reset {
        (today_reset, today_reset + ChronoDuration::hours(24))
    } else {
        (today_reset - ChronoDuration::hours(24), today_reset)
    }
}

pub fn current_period_tier_usage(usage: &[UsageEntry], last_reset: DateTime<Utc>) -> f64 {
    usage
        .iter()
        .filter(|entry| entry.meter_source == "tier")
        .filter(|entry| {
            parse_usage_timestamp(&entry.timestamp)
                .map(|ts| ts >= last_reset)
                .unwrap_or(false)
        })
        .map(|entry| entry.cost_usd)
        .sum()
}

fn parse_reset_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_usage_timestamp(value))
}

/// Usage entries arrive as `"2026-01-23 01:11:21"` with an implied UTC zone.
pub fn parse_usage_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub fn format_for_toast(quota: &QuotaSnapshot) -> String {
    let tier_percent = if quota.tier_limit > 0.0 {
        (quota.tier_remaining / quota.tier_limit * 100.0).round() as i64
    } else {
        0
    };
    let until_reset = quota.next_reset_at - Utc::now();
    let hours = until_reset.num_hours().max(0);
    let minutes = (until_reset.num_minutes() - hours * 60).max(0);

    format!(
        "{} Tier: {:.2}/{} ({}%) | 💎 Wallet: ${:.2} | ⏰ Reset: {}h{}m",
        quota.tier_emoji, quota.tier_remaining, quota.tier_limit, tier_percent,
        quota.wallet_balance, hours, minutes
    )
}
