/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed connectivity configuration with defaulted sections
[POS]:    Configuration layer - component wiring
[UPDATE]: When adding new configuration options
*/

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use exlink_adapter::{ClientConfig, NonceConfig, SignerCommandConfig, TokenConfig, WsConfig};

use crate::balance::{ChannelConfig, QuoteAliases};
use crate::orders::OrderManagerConfig;
use crate::router::RouterConfig;

/// Top-level configuration for the connectivity core
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    pub exchange: ExchangeConfig,
    pub nonce: NonceConfig,
    pub token: TokenConfig,
    pub channel: ChannelConfig,
    pub router: RouterConfig,
    pub orders: OrderManagerConfig,
    /// External signer process. Required unless running `--dry-run`.
    pub signer: Option<SignerCommandConfig>,
}

/// Exchange endpoints and the public half of the API credentials
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest: ClientConfig,
    pub ws: WsConfig,
    pub api_key: String,
    /// Nonce namespace; defaults to the API key when empty.
    pub key_id: String,
}

impl ExchangeConfig {
    pub fn effective_key_id(&self) -> &str {
        if self.key_id.is_empty() {
            &self.api_key
        } else {
            &self.key_id
        }
    }
}

/// Directory for persisted nonce and token state.
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("exlink")
}

impl CoreConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.fill_state_paths(&default_state_dir());
        config.validate()?;
        Ok(config)
    }

    /// Point unset persistence paths at `dir`.
    pub fn fill_state_paths(&mut self, dir: &Path) {
        if self.nonce.state_path.is_none() {
            self.nonce.state_path = Some(dir.join("nonces.json"));
        }
        if self.token.token_path.is_none() {
            self.token.token_path = Some(dir.join("ws_token.json"));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.api_key.trim().is_empty() {
            bail!("exchange.api_key must be set");
        }
        if !(0.0..=1.0).contains(&self.router.push_ratio) {
            bail!(
                "router.push_ratio must be within [0, 1], got {}",
                self.router.push_ratio
            );
        }
        if self.router.failure_threshold == 0 {
            bail!("router.failure_threshold must be at least 1");
        }
        if self.router.quote_aliases.codes.is_empty() {
            bail!("router.quote_aliases.codes must not be empty");
        }
        Ok(())
    }

    pub fn quote_aliases(&self) -> &QuoteAliases {
        &self.router.quote_aliases
    }
}
