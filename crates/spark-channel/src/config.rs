//! 声明式绑定配置。
//!
//! # 模块定位（Why）
//! - 绑定元素序列通常来自配置文件而非代码；本模块把 TOML 文档映射为强类型设置，
//!   并在装配前统一校验，使配置错误在构建期同步暴露；
//! - 时长字段统一以毫秒整数书写（`*_ms`），避免不同格式的时长语法分歧。
//!
//! # 契约（What）
//! - [`ChannelTimeouts`]：打开/关闭/发送/接收默认超时，沿“绑定 → 工厂 → 通道”向下传递；
//! - [`TransportSettings`]：传输层通用配额与连接池设置；
//! - [`BindingConfig`]：完整绑定描述，`upper_elements()` 生成传输之上的元素序列。
//!
//! # 示例
//! ```toml
//! encoding = "text"
//! one_way = true
//!
//! [timeouts]
//! open_ms = 5000
//! send_ms = 2000
//!
//! [transport]
//! max_received_message_size = 1048576
//!
//! [transport.pool]
//! group_name = "orders"
//! max_outbound_connections_per_endpoint = 4
//!
//! [upgrade]
//! identity = "orders-client"
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    binding::{BindingElement, MessageEncodingBindingElement, OneWayBindingElement, StreamUpgradeBindingElement},
    error::{ChannelError, Result},
    pool::ConnectionPoolSettings,
    stream::upgrade::IdentityUpgrade,
};

/// 以毫秒整数序列化 [`Duration`]。
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// 可选时长：TOML 没有空值，`0` 表示“不限”。
pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let millis = value
            .map(|value| u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

/// 默认超时集合。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelTimeouts {
    #[serde(rename = "open_ms", with = "duration_ms")]
    pub open: Duration,
    #[serde(rename = "close_ms", with = "duration_ms")]
    pub close: Duration,
    #[serde(rename = "send_ms", with = "duration_ms")]
    pub send: Duration,
    #[serde(rename = "receive_ms", with = "duration_ms")]
    pub receive: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(60),
            close: Duration::from_secs(60),
            send: Duration::from_secs(60),
            receive: Duration::from_secs(600),
        }
    }
}

impl ChannelTimeouts {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("open_ms", self.open),
            ("close_ms", self.close),
            ("send_ms", self.send),
            ("receive_ms", self.receive),
        ] {
            if value.is_zero() {
                return Err(ChannelError::configuration(format!(
                    "timeout `{name}` must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// 传输层通用设置。
///
/// - `max_received_message_size`：单条入站消息上限，超出即配额错误；
/// - `max_buffer_size`：单条出站消息上限，同时约束缓冲模式下的入站缓冲，不得大于前者；
/// - `connection_buffer_size`：帧读取缓冲的初始容量；
/// - `pool`：连接池设置。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    pub max_received_message_size: u64,
    pub max_buffer_size: usize,
    pub connection_buffer_size: usize,
    pub pool: ConnectionPoolSettings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_received_message_size: 65_536,
            max_buffer_size: 65_536,
            connection_buffer_size: 8_192,
            pool: ConnectionPoolSettings::default(),
        }
    }
}

impl TransportSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_received_message_size == 0 {
            return Err(ChannelError::configuration(
                "max_received_message_size must be positive",
            ));
        }
        if self.max_buffer_size == 0 || self.connection_buffer_size == 0 {
            return Err(ChannelError::configuration(
                "max_buffer_size and connection_buffer_size must be positive",
            ));
        }
        if self.max_buffer_size as u64 > self.max_received_message_size {
            return Err(ChannelError::configuration(format!(
                "max_buffer_size ({}) must not exceed max_received_message_size ({})",
                self.max_buffer_size, self.max_received_message_size
            )));
        }
        self.pool.validate()
    }
}

/// 消息编码种类。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    #[default]
    Binary,
    Text,
}

/// 身份声明升级设置。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpgradeConfig {
    pub identity: String,
    #[serde(default)]
    pub expected_remote: Option<String>,
}

/// 完整绑定配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BindingConfig {
    pub timeouts: ChannelTimeouts,
    pub transport: TransportSettings,
    pub encoding: EncodingKind,
    pub upgrade: Option<UpgradeConfig>,
    pub one_way: bool,
}

impl BindingConfig {
    /// 解析 TOML 文档并校验。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|err| {
            ChannelError::configuration(format!("invalid binding configuration: {}", err.message()))
                .with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;
        self.transport.validate()?;
        if let Some(upgrade) = &self.upgrade
            && upgrade.identity.is_empty()
        {
            return Err(ChannelError::configuration("upgrade identity must not be empty"));
        }
        Ok(())
    }

    /// 传输之上的元素序列，外层在前：单向 → 编码 → 升级。
    pub fn upper_elements(&self) -> Vec<Arc<dyn BindingElement>> {
        let mut elements: Vec<Arc<dyn BindingElement>> = Vec::with_capacity(3);
        if self.one_way {
            elements.push(Arc::new(OneWayBindingElement::new()));
        }
        elements.push(Arc::new(match self.encoding {
            EncodingKind::Binary => MessageEncodingBindingElement::binary(),
            EncodingKind::Text => MessageEncodingBindingElement::text(),
        }));
        if let Some(upgrade) = &self.upgrade {
            let mut identity = IdentityUpgrade::new(upgrade.identity.clone());
            if let Some(expected) = &upgrade.expected_remote {
                identity = identity.expect_remote(expected.clone());
            }
            elements.push(Arc::new(StreamUpgradeBindingElement::new(identity)));
        }
        elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::OverflowPolicy;

    #[test]
    fn parses_full_document() {
        let config = BindingConfig::from_toml_str(
            r#"
            encoding = "text"
            one_way = true

            [timeouts]
            open_ms = 5000
            send_ms = 2000

            [transport]
            max_received_message_size = 1048576
            max_buffer_size = 1048576

            [transport.pool]
            group_name = "orders"
            lease_timeout_ms = 0
            max_outbound_connections_per_endpoint = 4
            overflow = "wait"

            [upgrade]
            identity = "orders-client"
            "#,
        )
        .expect("配置合法");

        assert_eq!(config.encoding, EncodingKind::Text);
        assert_eq!(config.timeouts.open, Duration::from_secs(5));
        assert_eq!(config.timeouts.receive, Duration::from_secs(600), "未写出的字段取默认值");
        assert_eq!(config.transport.pool.group_name, "orders");
        assert_eq!(config.transport.pool.lease_timeout, None, "0 表示不限租约");
        assert_eq!(config.transport.pool.overflow, OverflowPolicy::Wait);
        assert_eq!(config.upper_elements().len(), 3);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = BindingConfig::from_toml_str("[transport.pool]\nmax_outbound_connections_per_endpoint = 0\n")
            .expect_err("零容量非法");
        assert_eq!(err.code(), crate::error::codes::CONFIGURATION);

        let err = BindingConfig::from_toml_str("[timeouts]\nsend_ms = 0\n").expect_err("零超时非法");
        assert!(err.message().contains("send_ms"));

        let err = BindingConfig::from_toml_str("encoding = \"morse\"\n").expect_err("未知编码非法");
        assert_eq!(err.code(), crate::error::codes::CONFIGURATION);
    }
}
