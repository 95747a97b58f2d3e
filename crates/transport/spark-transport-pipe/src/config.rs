use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use spark_channel::{ChannelError, Result, TransportSettings};

/// 命名管道传输配置。
///
/// - `settings`：通用传输设置；连接池缺省不限租约（本机连接没有负载均衡需要）；
/// - `publication_dir`：服务端发布管道名的目录。
///
/// ```toml
/// publication_dir = "/run/spark/pipes"
///
/// [settings.pool]
/// group_name = "local"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeTransportConfig {
    pub settings: TransportSettings,
    pub publication_dir: PathBuf,
}

impl Default for PipeTransportConfig {
    fn default() -> Self {
        let mut settings = TransportSettings::default();
        settings.pool.lease_timeout = None;
        Self {
            settings,
            publication_dir: std::env::temp_dir().join("spark-pipes"),
        }
    }
}

impl PipeTransportConfig {
    pub fn with_publication_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.publication_dir = dir.into();
        self
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|err| {
            ChannelError::configuration(format!("invalid pipe transport configuration: {}", err.message()))
                .with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.publication_dir.as_os_str().is_empty() {
            return Err(ChannelError::configuration("publication_dir must not be empty"));
        }
        self.settings.validate()
    }
}
