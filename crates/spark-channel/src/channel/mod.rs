//! 通道工厂与通道：流水线构建出的运行时对象。
//!
//! # 模块定位（Why）
//! - 绑定流水线的产物是一个 [`ChannelFactory`]；工厂打开后按目标地址创建 [`Channel`]，
//!   通道从连接池借用连接、经由流装饰器完成消息交换；
//! - 工厂与通道都是 [`CommunicationObject`]：共享同一套状态机、故障通知与批量关闭语义。
//!
//! # 契约（What）
//! - [`ChannelShape::Request`]：请求-应答通道，由传输工厂直接提供；
//! - [`ChannelShape::Output`]：单向发送通道，由单向阶段在请求通道之上分层提供；
//! - 通道默认超时继承自工厂，创建时可局部覆盖；
//! - 工厂关闭时以批量关闭收敛其创建的全部通道，中止时逐个中止。

mod layered;
mod tracker;
mod transport;

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    address::EndpointAddress,
    binding::Property,
    config::ChannelTimeouts,
    error::{ChannelError, Result},
    lifecycle::CommunicationObject,
    message::Message,
};

pub use layered::{ChannelLayer, LayeredChannel, OneWayChannelFactory, OneWayLayer};
pub use tracker::{ChannelTracker, TrackedSlot};
pub use transport::{TransportChannel, TransportChannelFactory, TransportFactoryParts, transport_property};

/// 通道形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelShape {
    /// 仅发送。
    Output,
    /// 请求-应答。
    Request,
}

/// 运行时通道。
#[async_trait]
pub trait Channel: CommunicationObject {
    fn shape(&self) -> ChannelShape;

    fn remote_address(&self) -> &EndpointAddress;

    /// 单向发送；`timeout` 缺省时使用通道的发送超时。
    async fn send(&self, _message: Message, _timeout: Option<Duration>) -> Result<()> {
        Err(ChannelError::unsupported(format!(
            "{:?} channels do not support one-way sends",
            self.shape()
        )))
    }

    /// 请求-应答；`timeout` 缺省时使用通道的发送超时。
    async fn request(&self, _message: Message, _timeout: Option<Duration>) -> Result<Message> {
        Err(ChannelError::unsupported(format!(
            "{:?} channels do not support requests",
            self.shape()
        )))
    }

    fn get_property(&self, _type_id: TypeId) -> Option<Property> {
        None
    }
}

/// 通道工厂。
pub trait ChannelFactory: CommunicationObject {
    fn shape(&self) -> ChannelShape;

    /// 创建通道；工厂必须处于 `Opened`。`timeouts` 为 `None` 时继承工厂默认值。
    fn create_channel_with(
        &self,
        address: EndpointAddress,
        timeouts: Option<ChannelTimeouts>,
    ) -> Result<Arc<dyn Channel>>;

    fn create_channel(&self, address: EndpointAddress) -> Result<Arc<dyn Channel>> {
        self.create_channel_with(address, None)
    }

    fn get_property(&self, type_id: TypeId) -> Option<Property>;
}

impl dyn ChannelFactory {
    /// 类型化属性查询。
    pub fn property<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_property(TypeId::of::<T>())?.downcast::<T>().ok()
    }
}

impl dyn Channel {
    /// 类型化属性查询。
    pub fn property<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_property(TypeId::of::<T>())?.downcast::<T>().ok()
    }
}

impl fmt::Debug for dyn ChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("label", &self.label())
            .field("shape", &self.shape())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label())
            .field("shape", &self.shape())
            .field("remote", &self.remote_address().uri().as_str())
            .field("state", &self.state())
            .finish()
    }
}
