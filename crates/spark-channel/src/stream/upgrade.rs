//! 流升级握手：在应用数据流动前把原始字节流转换为带安全/身份语义的流。
//!
//! # 模块定位（Why）
//! - 会话前导阶段可以插入一次或多次“升级”，典型场景是在明文连接上叠加传输安全；
//! - 升级的具体算法（TLS、身份声明等）与状态机正交：状态机保证调用顺序与远端身份的可见性，
//!   算法只负责字节交换。
//!
//! # 核心组成（What）
//! - [`StreamUpgrade`]：升级算法能力接口，声明协商令牌并分别实现发起方/接收方握手；
//! - [`StreamUpgradeProvider`]：可共享的升级提供者，为每条连接创建一次性的状态机；
//! - [`StreamUpgradeInitiator`]：`NotStarted → Opened → Upgrading → Upgraded → Closed`；
//! - [`StreamUpgradeAcceptor`]：`NotStarted → Negotiating → Upgraded`；
//! - [`IdentityUpgrade`]：双向身份声明的参考实现，令牌为 [`IDENTITY_UPGRADE_TOKEN`]。
//!
//! # 协作方式（How）
//! 1. 发起方 `open` 后通过 `next_upgrade` 取得令牌，经分帧层的 UpgradeRequest 记录发送；
//! 2. 接收方以 `can_upgrade(token)` 判断是否接受，回复 UpgradeResponse 后执行 `accept_upgrade`；
//! 3. 双方握手完成后进入 `Upgraded`，远端身份此后只读且稳定。
//!
//! # 风险提示（Trade-offs）
//! - 每个状态机实例只执行一步升级；需要多步升级时应组合多个提供者，而不是复用实例。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    error::{ChannelError, ErrorCategory, Result, codes},
    stream::BoxedStream,
    time::Deadline,
};

/// 身份声明升级的协商令牌。
pub const IDENTITY_UPGRADE_TOKEN: &str = "application/spark-identity";

const MAX_IDENTITY_LEN: usize = 1024;

/// 升级完成后可读取的远端安全信息。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteSecurity {
    identity: String,
}

impl RemoteSecurity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

/// 升级算法声明的安全能力，作为绑定属性对外暴露。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SecurityCapabilities {
    pub supports_client_identity: bool,
    pub supports_server_identity: bool,
    pub protects_payload: bool,
}

/// 升级算法能力接口。
#[async_trait]
pub trait StreamUpgrade: Send + Sync + fmt::Debug + 'static {
    /// 协商令牌，写入 UpgradeRequest 记录并由接收方匹配。
    fn token(&self) -> &str;

    fn capabilities(&self) -> SecurityCapabilities;

    /// 发起方握手，返回升级后的流与远端安全信息。
    async fn initiate(
        &self,
        stream: BoxedStream,
        deadline: Deadline,
    ) -> Result<(BoxedStream, RemoteSecurity)>;

    /// 接收方握手。
    async fn accept(
        &self,
        stream: BoxedStream,
        deadline: Deadline,
    ) -> Result<(BoxedStream, RemoteSecurity)>;
}

/// 可在多条连接之间共享的升级提供者。
#[derive(Clone, Debug)]
pub struct StreamUpgradeProvider {
    upgrade: Arc<dyn StreamUpgrade>,
}

impl StreamUpgradeProvider {
    pub fn new(upgrade: impl StreamUpgrade) -> Self {
        Self {
            upgrade: Arc::new(upgrade),
        }
    }

    pub fn from_arc(upgrade: Arc<dyn StreamUpgrade>) -> Self {
        Self { upgrade }
    }

    pub fn token(&self) -> &str {
        self.upgrade.token()
    }

    pub fn capabilities(&self) -> SecurityCapabilities {
        self.upgrade.capabilities()
    }

    pub fn create_initiator(&self) -> StreamUpgradeInitiator {
        StreamUpgradeInitiator {
            upgrade: Arc::clone(&self.upgrade),
            state: InitiatorState::NotStarted,
            remote: None,
        }
    }

    pub fn create_acceptor(&self) -> StreamUpgradeAcceptor {
        StreamUpgradeAcceptor {
            upgrade: Arc::clone(&self.upgrade),
            state: AcceptorState::NotStarted,
            remote: None,
        }
    }
}

/// 发起方状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitiatorState {
    NotStarted,
    Opened,
    Upgrading,
    Upgraded,
    Closed,
}

/// 接收方状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptorState {
    NotStarted,
    Negotiating,
    Upgraded,
    /// 握手失败，终态。
    Failed,
}

/// 发起方状态机。
///
/// # 契约（What）
/// - `open` 只能在 `NotStarted` 调用；
/// - `initiate_upgrade` 只能在 `Opened` 调用且只执行一次；握手失败后状态机进入 `Closed`；
/// - `remote_security` 在握手完成前返回 `InvalidState`，完成后返回稳定值（关闭后仍可读取）。
#[derive(Debug)]
pub struct StreamUpgradeInitiator {
    upgrade: Arc<dyn StreamUpgrade>,
    state: InitiatorState,
    remote: Option<RemoteSecurity>,
}

impl StreamUpgradeInitiator {
    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn open(&mut self, deadline: Deadline) -> Result<()> {
        deadline.remaining("upgrade initiator open")?;
        if self.state != InitiatorState::NotStarted {
            return Err(ChannelError::invalid_state(format!(
                "upgrade initiator cannot open from {:?}",
                self.state
            )));
        }
        self.state = InitiatorState::Opened;
        Ok(())
    }

    /// 下一步升级的协商令牌；没有待执行的升级时返回 `None`。
    pub fn next_upgrade(&self) -> Option<&str> {
        (self.state == InitiatorState::Opened).then(|| self.upgrade.token())
    }

    pub async fn initiate_upgrade(
        &mut self,
        stream: BoxedStream,
        deadline: Deadline,
    ) -> Result<BoxedStream> {
        if self.state != InitiatorState::Opened {
            return Err(ChannelError::invalid_state(format!(
                "upgrade cannot be initiated from {:?}",
                self.state
            )));
        }
        self.state = InitiatorState::Upgrading;
        tracing::debug!(token = self.upgrade.token(), "initiating stream upgrade");
        match deadline
            .run("stream upgrade", self.upgrade.initiate(stream, deadline))
            .await
        {
            Ok((upgraded, remote)) => {
                self.remote = Some(remote);
                self.state = InitiatorState::Upgraded;
                Ok(upgraded)
            }
            Err(err) => {
                self.state = InitiatorState::Closed;
                Err(err)
            }
        }
    }

    pub fn remote_security(&self) -> Result<&RemoteSecurity> {
        self.remote.as_ref().ok_or_else(|| {
            ChannelError::invalid_state("remote security is not available before the upgrade completes")
        })
    }

    pub fn close(&mut self) {
        self.state = InitiatorState::Closed;
    }
}

/// 接收方状态机。
///
/// `accept_upgrade` 只执行一次：成功进入 `Upgraded`，失败进入 `Failed`，两者都不再接受升级。
#[derive(Debug)]
pub struct StreamUpgradeAcceptor {
    upgrade: Arc<dyn StreamUpgrade>,
    state: AcceptorState,
    remote: Option<RemoteSecurity>,
}

impl StreamUpgradeAcceptor {
    pub fn state(&self) -> AcceptorState {
        self.state
    }

    /// 纯判定：握手已经发生过或令牌不匹配时返回 `false`。
    pub fn can_upgrade(&self, content_type: &str) -> bool {
        self.state == AcceptorState::NotStarted && self.upgrade.token() == content_type
    }

    pub async fn accept_upgrade(
        &mut self,
        stream: BoxedStream,
        deadline: Deadline,
    ) -> Result<BoxedStream> {
        if self.state != AcceptorState::NotStarted {
            return Err(ChannelError::invalid_state(format!(
                "upgrade cannot be accepted from {:?}",
                self.state
            )));
        }
        self.state = AcceptorState::Negotiating;
        match deadline
            .run("stream upgrade accept", self.upgrade.accept(stream, deadline))
            .await
        {
            Ok((upgraded, remote)) => {
                self.remote = Some(remote);
                self.state = AcceptorState::Upgraded;
                Ok(upgraded)
            }
            Err(err) => {
                self.state = AcceptorState::Failed;
                Err(err)
            }
        }
    }

    pub fn remote_security(&self) -> Result<&RemoteSecurity> {
        self.remote.as_ref().ok_or_else(|| {
            ChannelError::invalid_state("remote security is not available before the upgrade completes")
        })
    }
}

/// 双向身份声明升级。
///
/// 双方各发送一帧 `u16` 大端长度 + UTF-8 身份；发起方先写后读，接收方先读后写。
/// 设置了 `expected_remote` 时，对端声明的身份必须与之相等，否则握手失败。
/// 升级不改变字节流本身，只为连接附加经过确认的远端身份。
#[derive(Clone, Debug)]
pub struct IdentityUpgrade {
    local_identity: String,
    expected_remote: Option<String>,
}

impl IdentityUpgrade {
    pub fn new(local_identity: impl Into<String>) -> Self {
        Self {
            local_identity: local_identity.into(),
            expected_remote: None,
        }
    }

    pub fn expect_remote(mut self, identity: impl Into<String>) -> Self {
        self.expected_remote = Some(identity.into());
        self
    }

    async fn write_identity(&self, stream: &mut BoxedStream) -> Result<()> {
        let bytes = self.local_identity.as_bytes();
        let len = u16::try_from(bytes.len())
            .ok()
            .filter(|len| usize::from(*len) <= MAX_IDENTITY_LEN)
            .ok_or_else(|| ChannelError::configuration("local identity is too long"))?;
        let mut frame = Vec::with_capacity(2 + bytes.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(bytes);
        stream
            .write_all(&frame)
            .await
            .map_err(|err| ChannelError::from_io("identity write", err))?;
        stream
            .flush()
            .await
            .map_err(|err| ChannelError::from_io("identity flush", err))
    }

    async fn read_identity(&self, stream: &mut BoxedStream) -> Result<RemoteSecurity> {
        let len = stream
            .read_u16()
            .await
            .map_err(|err| ChannelError::from_io("identity read", err))?;
        let len = usize::from(len);
        if len > MAX_IDENTITY_LEN {
            return Err(upgrade_failed(format!(
                "remote identity of {len} bytes exceeds {MAX_IDENTITY_LEN}"
            )));
        }
        let mut raw = vec![0u8; len];
        stream
            .read_exact(&mut raw)
            .await
            .map_err(|err| ChannelError::from_io("identity read", err))?;
        let identity = String::from_utf8(raw)
            .map_err(|_| upgrade_failed("remote identity is not valid UTF-8"))?;
        if let Some(expected) = &self.expected_remote
            && expected != &identity
        {
            return Err(upgrade_failed(format!(
                "remote identity `{identity}` does not match `{expected}`"
            )));
        }
        Ok(RemoteSecurity::new(identity))
    }
}

#[async_trait]
impl StreamUpgrade for IdentityUpgrade {
    fn token(&self) -> &str {
        IDENTITY_UPGRADE_TOKEN
    }

    fn capabilities(&self) -> SecurityCapabilities {
        SecurityCapabilities {
            supports_client_identity: true,
            supports_server_identity: true,
            protects_payload: false,
        }
    }

    async fn initiate(
        &self,
        mut stream: BoxedStream,
        _deadline: Deadline,
    ) -> Result<(BoxedStream, RemoteSecurity)> {
        self.write_identity(&mut stream).await?;
        let remote = self.read_identity(&mut stream).await?;
        Ok((stream, remote))
    }

    async fn accept(
        &self,
        mut stream: BoxedStream,
        _deadline: Deadline,
    ) -> Result<(BoxedStream, RemoteSecurity)> {
        let remote = self.read_identity(&mut stream).await?;
        self.write_identity(&mut stream).await?;
        Ok((stream, remote))
    }
}

fn upgrade_failed(message: impl Into<std::borrow::Cow<'static, str>>) -> ChannelError {
    ChannelError::new(
        codes::UPGRADE_FAILED,
        message,
        ErrorCategory::ProtocolViolation,
    )
}
