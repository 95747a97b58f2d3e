use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    config::{duration_ms, option_duration_ms},
    error::{ChannelError, Result},
};

/// 端点容量耗尽时的处理策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 超出容量时直接新建连接，该连接归还时被丢弃，不进入空闲队列。
    #[default]
    CreateUnpooled,
    /// 等待已有连接归还或槽位释放，直到截止时间。
    Wait,
}

/// 连接池设置。
///
/// # 契约（What）
/// - `group_name`：注册表中的逻辑分组键；
/// - `idle_timeout`：空闲连接自最后一次使用起的最长存活时间；
/// - `lease_timeout`：连接自创建起的最长寿命，`None` 表示不限（命名管道默认如此）；
/// - `max_outbound_connections_per_endpoint`：单端点可入池的连接上限；
/// - `overflow`：容量耗尽时的策略，见 [`OverflowPolicy`]。
///
/// 所有时长字段在 TOML 中以毫秒表示：`idle_timeout_ms`、`lease_timeout_ms`。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    pub group_name: String,
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(rename = "lease_timeout_ms", with = "option_duration_ms")]
    pub lease_timeout: Option<Duration>,
    pub max_outbound_connections_per_endpoint: usize,
    pub overflow: OverflowPolicy,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            group_name: "default".to_owned(),
            idle_timeout: Duration::from_secs(120),
            lease_timeout: Some(Duration::from_secs(300)),
            max_outbound_connections_per_endpoint: 10,
            overflow: OverflowPolicy::CreateUnpooled,
        }
    }
}

impl ConnectionPoolSettings {
    pub fn with_group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = name.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_outbound_connections_per_endpoint = max;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// 校验设置，非法值以配置错误同步暴露。
    pub fn validate(&self) -> Result<()> {
        if self.group_name.is_empty() {
            return Err(ChannelError::configuration(
                "connection pool group name must not be empty",
            ));
        }
        if self.max_outbound_connections_per_endpoint == 0 {
            return Err(ChannelError::configuration(
                "max_outbound_connections_per_endpoint must be at least 1",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ChannelError::configuration("idle_timeout_ms must be positive"));
        }
        if self.lease_timeout.is_some_and(|lease| lease.is_zero()) {
            return Err(ChannelError::configuration(
                "lease_timeout_ms must be positive when set",
            ));
        }
        Ok(())
    }
}
