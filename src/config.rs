use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub gui: GuiConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(_) | None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("POLLINATIONS_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(key) = env::var("POLLINATIONS_API_KEY") {
            if !key.is_empty() {
                self.routing.api_key = Some(key);
            }
        }
        if let Ok(mode) = env::var("POLLINATIONS_MODE") {
            if let Ok(mode) = mode.parse() {
                self.routing.mode = mode;
            }
        }
        if let Ok(path) = env::var("POLLINATIONS_SIGNATURE_CACHE") {
            self.signatures.cache_path = PathBuf::from(path);
        }
    }

    /// Pro mode is meaningless without a credential; degrade to manual.
    fn normalize(&mut self) {
        if self.routing.api_key.is_none() && self.routing.mode == Mode::Pro {
            self.routing.mode = Mode::Manual;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_enterprise_chat_url")]
    pub enterprise_chat_url: String,
    #[serde(default = "default_free_chat_url")]
    pub free_chat_url: String,
    #[serde(default = "default_account_base_url")]
    pub account_base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enterprise_chat_url: default_enterprise_chat_url(),
            free_chat_url: default_free_chat_url(),
            account_base_url: default_account_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub fallbacks: Fallbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Manual,
    Alwaysfree,
    Pro,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mode::Manual => "manual",
            Mode::Alwaysfree => "alwaysfree",
            Mode::Pro => "pro",
        };
        f.write_str(label)
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Mode::Manual),
            "alwaysfree" => Ok(Mode::Alwaysfree),
            "pro" => Ok(Mode::Pro),
            other => Err(anyhow::anyhow!("unknown mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    /// Percentage of the daily tier budget at or below which the safety net fires.
    #[serde(default = "default_tier_threshold")]
    pub tier_percent: f64,
    /// Absolute wallet balance (USD) below which pro mode gives up enterprise.
    #[serde(default = "default_wallet_threshold")]
    pub wallet_usd: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            tier_percent: default_tier_threshold(),
            wallet_usd: default_wallet_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fallbacks {
    /// Target model when a safety net forces the free universe.
    #[serde(default = "default_free_main")]
    pub free_main: String,
    #[serde(default = "default_free_agent")]
    pub free_agent: String,
    /// Generic tools-capable free model for the Gemini tools workaround.
    #[serde(default = "default_tools_capable")]
    pub tools_capable: String,
}

impl Default for Fallbacks {
    fn default() -> Self {
        Self {
            free_main: default_free_main(),
            free_agent: default_free_agent(),
            tools_capable: default_tools_capable(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuiConfig {
    #[serde(default)]
    pub status: StatusVerbosity,
    #[serde(default)]
    pub logs: LogVerbosity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusVerbosity {
    None,
    #[default]
    Alert,
    All,
}

impl StatusVerbosity {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "alert" => Some(Self::Alert),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    #[default]
    None,
    Error,
    Verbose,
}

impl LogVerbosity {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "error" => Some(Self::Error),
            "verbose" => Some(Self::Verbose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
        }
    }
}

/// Re-reads the config file on every request so manual edits and
/// slash-command updates take effect without a restart. Falls back to the
/// last good parse when the file is mid-edit or malformed.
pub struct ConfigProvider {
    path: PathBuf,
    last_good: Mutex<AppConfig>,
}

impl ConfigProvider {
    pub fn new(path: PathBuf, initial: AppConfig) -> Self {
        Self {
            path,
            last_good: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> AppConfig {
        if self.path.exists() {
            match AppConfig::load(Some(&self.path)) {
                Ok(config) => {
                    *self.last_good.lock().expect("config lock poisoned") = config.clone();
                    return config;
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        path = %self.path.display(),
                        "config reload failed, keeping last good"
                    );
                }
            }
        }
        self.last_good.lock().expect("config lock poisoned").clone()
    }

    pub fn update<F>(&self, apply: F) -> Result<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.current();
        apply(&mut config);
        config.normalize();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let serialized =
            toml::to_string_pretty(&config).with_context(|| "failed to serialize config")?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write config file {}", self.path.display()))?;

        *self.last_good.lock().expect("config lock poisoned") = config.clone();
        Ok(config)
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn default_config_path() -> PathBuf {
    config_root().join("config.toml")
}

fn config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pollinations-proxy")
}

fn default_listen_addr() -> String {
    "127.0.0.1:10001".to_string()
}

fn default_enterprise_chat_url() -> String {
    "https://gen.pollinations.ai/v1/chat/completions".to_string()
}

fn default_free_chat_url() -> String {
    "https://text.pollinations.ai/openai/chat/completions".to_string()
}

fn default_account_base_url() -> String {
    "https://gen.pollinations.ai".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    8
}

fn default_tier_threshold() -> f64 {
    10.0
}

fn default_wallet_threshold() -> f64 {
    5.0
}

fn default_free_main() -> String {
    "free/mistral".to_string()
}

fn default_free_agent() -> String {
    "free/openai-fast".to_string()
}

fn default_tools_capable() -> String {
    "openai".to_string()
}

fn default_cache_path() -> PathBuf {
    config_root().join("signatures.json")
}
