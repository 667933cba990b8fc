//! stratus.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratusConfig {
    /// Data directory for persistent state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Endpoints of the external collaborator services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// The provider-ranking service.
    pub ranker: Option<PlatformConfig>,
    /// The provider catalog (CMDB-like registry).
    pub catalog: Option<PlatformConfig>,
    /// The PaaS-level infrastructure-manager broker.
    pub broker: Option<PlatformConfig>,
}

/// Tuning knobs for the deployment engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between two status polls of the same deployment.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Wall-clock budget for one deploy attempt (submission + polling).
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,
    /// Wall-clock budget for an undeploy.
    #[serde(default = "default_undeploy_timeout")]
    pub undeploy_timeout_secs: u64,
    /// Maximum number of candidate providers tried per deployment.
    /// `None` means every compatible candidate is tried.
    #[serde(default)]
    pub max_provider_retries: Option<usize>,
    /// Keep the provider-side artifacts of the final failed attempt
    /// around for debugging instead of cleaning them up.
    #[serde(default)]
    pub keep_last_attempt: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            deploy_timeout_secs: default_deploy_timeout(),
            undeploy_timeout_secs: default_undeploy_timeout(),
            max_provider_retries: None,
            keep_last_attempt: false,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn undeploy_timeout(&self) -> Duration {
        Duration::from_secs(self.undeploy_timeout_secs)
    }
}

/// Connection settings for the platform services the drivers talk to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub infra_manager: Option<PlatformConfig>,
    pub batch: Option<PlatformConfig>,
    pub container: Option<PlatformConfig>,
    pub jobs: Option<PlatformConfig>,
}

/// One platform service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Base address, `host:port`.
    pub address: String,
    /// Static bearer token, when the platform requires one.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/stratus")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_deploy_timeout() -> u64 {
    // Contextualizing a full VM infrastructure can legitimately take hours.
    3 * 60 * 60
}

fn default_undeploy_timeout() -> u64 {
    30 * 60
}

impl StratusConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StratusConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for StratusConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            engine: EngineConfig::default(),
            services: ServicesConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config: StratusConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.poll_interval_secs, 30);
        assert_eq!(config.engine.deploy_timeout_secs, 3 * 60 * 60);
        assert!(config.engine.max_provider_retries.is_none());
    }

    #[test]
    fn parse_full() {
        let text = r#"
data_dir = "/tmp/stratus"

[engine]
poll_interval_secs = 5
max_provider_retries = 2
keep_last_attempt = true

[providers.batch]
address = "batch.example.org:4400"
token = "s3cret"
"#;
        let config: StratusConfig = toml::from_str(text).unwrap();
        assert_eq!(config.engine.max_provider_retries, Some(2));
        assert!(config.engine.keep_last_attempt);
        let batch = config.providers.batch.unwrap();
        assert_eq!(batch.address, "batch.example.org:4400");
        assert_eq!(batch.token.as_deref(), Some("s3cret"));
        assert!(config.providers.container.is_none());
    }

    #[test]
    fn durations_convert() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }
}
