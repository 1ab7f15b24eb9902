use crate::core::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::ws::WsConfig;
use crate::core::kernel::{ReqwestRest, RestClientBuilder, RestClientConfig};
use crate::exchanges::okx::rest::{default_quota, OkxRest, DEFAULT_BASE_URL};
use crate::exchanges::okx::signer::OkxSigner;
use crate::exchanges::okx::stream_manager::WsStreamManager;
use governor::Quota;
use std::sync::Arc;

/// Builder for OKX REST clients and stream managers
#[derive(Debug, Clone)]
pub struct OkxBuilder {
    config: ExchangeConfig,
    ws_config: WsConfig,
    rest_timeout: u64,
    quota: Quota,
}

impl Default for OkxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OkxBuilder {
    pub fn new() -> Self {
        Self {
            config: ExchangeConfig::read_only(),
            ws_config: WsConfig::default(),
            rest_timeout: 30,
            quota: default_quota(),
        }
    }

    /// Credentials from `OKX_*` variables when present, WebSocket overrides from `OKX_WS_*`
    pub fn from_env() -> Self {
        let config = ExchangeConfig::from_env("OKX").unwrap_or_else(|_| ExchangeConfig::read_only());
        Self::new()
            .with_config(config)
            .with_ws_config(WsConfig::from_env("OKX"))
    }

    pub fn with_config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ws_config(mut self, ws_config: WsConfig) -> Self {
        self.ws_config = ws_config;
        self
    }

    /// REST request timeout in seconds
    pub fn with_rest_timeout(mut self, timeout: u64) -> Self {
        self.rest_timeout = timeout;
        self
    }

    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.quota = quota;
        self
    }

    pub fn build_rest(&self) -> Result<OkxRest<ReqwestRest>, ExchangeError> {
        let base_url = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let rest_config =
            RestClientConfig::new(base_url, "okx".to_string()).with_timeout(self.rest_timeout);
        let mut rest_builder = RestClientBuilder::new(rest_config);

        if self.config.has_credentials() {
            let signer = OkxSigner::new(
                self.config.api_key().to_string(),
                self.config.secret_key().to_string(),
                self.config.passphrase().to_string(),
            )
            .with_simulated_trading(self.config.testnet);
            rest_builder = rest_builder.with_signer(Arc::new(signer));
        }

        Ok(OkxRest::with_quota(rest_builder.build()?, self.quota))
    }

    pub fn build_stream_manager(&self) -> Result<WsStreamManager, ExchangeError> {
        WsStreamManager::new(self.ws_config.clone())
    }
}
