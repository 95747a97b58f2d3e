//! 端点地址：通道工厂创建通道时的目标 URI。

use std::{fmt, str::FromStr};

pub use url::Url;

use crate::error::{ChannelError, Result};

/// 通道的远端地址。
///
/// # 契约（What）
/// - `uri`：目标服务 URI，scheme 必须与传输元素声明的 scheme 一致（如 `net.tcp`、`net.pipe`）；
/// - `via`：可选的物理路由地址，缺省时与 `uri` 相同，写入会话前导的 Via 记录；
/// - 构造时要求 URI 含 host，主机名统一转为小写，使连接池键稳定。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    uri: Url,
    via: Option<Url>,
}

impl EndpointAddress {
    /// 解析字符串形式的地址。
    pub fn parse(input: &str) -> Result<Self> {
        let uri = Url::parse(input).map_err(|err| {
            ChannelError::configuration(format!("invalid endpoint address `{input}`: {err}"))
        })?;
        Self::from_url(uri)
    }

    /// 由已解析的 URL 构造地址。
    pub fn from_url(uri: Url) -> Result<Self> {
        if uri.host_str().is_none_or(str::is_empty) {
            return Err(ChannelError::configuration(format!(
                "endpoint address `{uri}` has no host"
            )));
        }
        Ok(Self { uri, via: None })
    }

    /// 指定物理路由地址。
    pub fn with_via(mut self, via: Url) -> Self {
        self.via = Some(via);
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// 物理路由地址，未设置时回落到 `uri`。
    pub fn via(&self) -> &Url {
        self.via.as_ref().unwrap_or(&self.uri)
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    /// 小写主机名。`url` 对特殊 scheme 之外的主机不做规范化，这里统一处理。
    pub fn host(&self) -> String {
        self.via()
            .host_str()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.via().port()
    }

    pub fn path(&self) -> &str {
        self.via().path()
    }
}

impl FromStr for EndpointAddress {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri.as_str())
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EndpointAddress");
        debug.field("uri", &self.uri.as_str());
        if let Some(via) = &self.via {
            debug.field("via", &via.as_str());
        }
        debug.finish()
    }
}
