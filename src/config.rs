use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub open: OpenConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// Node REST endpoint (host:port, no scheme)
    pub rest_host: String,
    /// Admin macaroon, hex encoded
    pub macaroon_hex: String,
    /// Path to the node's TLS certificate
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the candidate/history SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bitcoin network
    #[serde(default = "default_network")]
    pub network: String,
    /// Dry-run mode: plan and report but execute nothing
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct OpenConfig {
    /// Total budget per batch in satoshis
    #[serde(default = "default_budget_sats")]
    pub budget_sats: u64,
    /// Default channel size in satoshis
    #[serde(default = "default_channel_sats")]
    pub default_channel_sats: u64,
    /// Maximum channel size in satoshis
    #[serde(default = "default_max_channel_sats")]
    pub max_channel_sats: u64,
    /// Funding transaction fee rate
    #[serde(default = "default_fee_rate")]
    pub fee_rate_sat_per_vb: u64,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("lnherder.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_network() -> String {
    "bitcoin".to_string()
}
fn default_budget_sats() -> u64 {
    1_000_000
}
fn default_channel_sats() -> u64 {
    100_000
}
fn default_max_channel_sats() -> u64 {
    16_777_215
}
fn default_fee_rate() -> u64 {
    2
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            network: default_network(),
            dry_run: false,
        }
    }
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            budget_sats: default_budget_sats(),
            default_channel_sats: default_channel_sats(),
            max_channel_sats: default_max_channel_sats(),
            fee_rate_sat_per_vb: default_fee_rate(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Hard limits (non-configurable safety rails)
        const ABS_MIN_CHANNEL_SATS: u64 = 20_000;
        const ABS_MAX_CHANNEL_SATS: u64 = 16_777_215;
        const ABS_MAX_FEE_RATE: u64 = 1000;

        if self.open.default_channel_sats < ABS_MIN_CHANNEL_SATS {
            anyhow::bail!(
                "default_channel_sats ({}) below absolute minimum ({})",
                self.open.default_channel_sats,
                ABS_MIN_CHANNEL_SATS
            );
        }
        if self.open.max_channel_sats > ABS_MAX_CHANNEL_SATS {
            anyhow::bail!(
                "max_channel_sats ({}) above absolute maximum ({})",
                self.open.max_channel_sats,
                ABS_MAX_CHANNEL_SATS
            );
        }
        if self.open.default_channel_sats > self.open.max_channel_sats {
            anyhow::bail!("default_channel_sats > max_channel_sats");
        }
        if self.open.budget_sats < self.open.default_channel_sats {
            anyhow::bail!(
                "budget_sats ({}) cannot fund a single default-size channel ({})",
                self.open.budget_sats,
                self.open.default_channel_sats
            );
        }
        if self.open.fee_rate_sat_per_vb == 0 || self.open.fee_rate_sat_per_vb > ABS_MAX_FEE_RATE {
            anyhow::bail!(
                "fee_rate_sat_per_vb ({}) must be between 1 and {}",
                self.open.fee_rate_sat_per_vb,
                ABS_MAX_FEE_RATE
            );
        }
        if !self.node.tls_cert_path.exists() {
            anyhow::bail!(
                "TLS cert not found at: {}",
                self.node.tls_cert_path.display()
            );
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// The TLS cert path is set to the provided path (must exist for validation).
    #[cfg(test)]
    pub fn test_default(tls_cert_path: std::path::PathBuf) -> Self {
        Self {
            node: NodeConfig {
                rest_host: "localhost:8080".to_string(),
                macaroon_hex: "deadbeef".to_string(),
                tls_cert_path,
            },
            general: GeneralConfig::default(),
            open: OpenConfig::default(),
        }
    }
}
