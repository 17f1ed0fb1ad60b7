use crate::{
    cli::Cli,
    config::{self, AppConfig, ConfigProvider},
    quota::QuotaOracle,
    server::{self, ServerState},
    signature::SignatureStore,
    toast::Notifier,
    upstream::UpstreamClient,
};
use anyhow::Result;
use std::sync::Arc;

/// High-level application orchestrator.
pub struct App {
    listen_addr: String,
    state: ServerState,
}

impl App {
    pub fn new(cli: Cli) -> Result<Self> {
        let mut config = AppConfig::load(cli.config_path.as_deref())?;
        if let Some(addr) = cli.listen_addr {
            config.server.listen_addr = addr;
        }
        let config_path = cli
            .config_path
            .unwrap_or_else(config::default_config_path);

        let provider = Arc::new(ConfigProvider::new(config_path, config.clone()));
        let state = ServerState {
            oracle: Arc::new(QuotaOracle::new(&config.upstream)?),
            signatures: Arc::new(SignatureStore::load(config.signatures.cache_path.clone())),
            notifier: Arc::new(Notifier::new(provider.clone())),
            upstream: Arc::new(UpstreamClient::new(&config.upstream)?),
            provider,
        };

        Ok(Self {
            listen_addr: config.server.listen_addr,
            state,
        })
    }

    pub async fn run(self) -> Result<()> {
        let handle = server::spawn(self.state, &self.listen_addr).await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received");
        handle.shutdown().await
    }
}
