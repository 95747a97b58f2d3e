//! 绑定元素流水线：把有序的协议阶段序列装配为通道工厂。
//!
//! # 模块定位（Why）
//! - 传输、编码、升级、单向适配等阶段由不同作者独立实现，彼此互不知晓；流水线以
//!   “每个阶段只面对它之下的剩余序列”的责任链把它们组合为一个通道工厂；
//! - 每种关注点只实现与自身相关的 `build` / `can_build` / `get_property`，
//!   其余行为由 [`BindingElement`] 的默认实现向下委托。
//!
//! # 契约（What）
//! - 序列外层（面向应用）在前、传输在后，且恰好包含一个传输元素并位于末尾；
//! - `can_build_channel_factory` 无副作用，且与随后真实构建的结果一致；
//! - `get_property` 按序委托，首个给出答案的阶段胜出；
//! - [`BindingContext`] 单次使用：构建消耗上下文，避免同一剩余序列被调用两次。
//!
//! # 协作方式（How）
//! - 元素通过 [`BindingParameters`] 横向发布能力（编码器、升级提供者），由传输阶段读取；
//! - 传输 crate 实现 `kind() == ElementKind::Transport` 的元素，并在
//!   `build_channel_factory` 中调用 [`TransportChannelFactory::build`](crate::channel::TransportChannelFactory::build)。

mod context;
mod custom;
mod elements;
mod properties;

use std::{any::TypeId, fmt, sync::Arc};

use crate::{
    channel::{ChannelFactory, ChannelShape},
    error::Result,
};

pub use context::{BindingContext, BindingParameters};
pub use custom::{ChannelBuilder, CustomBinding};
pub use elements::{MessageEncodingBindingElement, OneWayBindingElement, StreamUpgradeBindingElement};
pub use properties::{
    EncoderParameter, MessageEncoding, Property, TransportScheme, UpgradeParameter, downcast_property,
};

/// 元素种类，用于序列校验与重复检测。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Transport,
    Encoding,
    Upgrade,
    Protocol,
}

/// 一个协议阶段。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `context` 只覆盖“本元素之后”的剩余序列；
/// - 默认实现把三种操作原样委托给剩余序列，透明阶段无需覆写任何方法；
/// - 传输元素位于末尾，必须覆写 `build_channel_factory` 并直接构建工厂。
///
/// ## 风险与权衡（Trade-offs）
/// - 能力探测与真实构建必须给出相同答案；实现若在 `build_channel_factory` 中增加拒绝条件，
///   需要在 `can_build_channel_factory` 中做同样的只读判定。
pub trait BindingElement: Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> ElementKind;

    fn can_build_channel_factory(&self, context: &BindingContext, shape: ChannelShape) -> bool {
        context.can_build_inner_channel_factory(shape)
    }

    fn build_channel_factory(
        &self,
        context: BindingContext,
        shape: ChannelShape,
    ) -> Result<Arc<dyn ChannelFactory>> {
        context.build_inner_channel_factory(shape)
    }

    fn get_property(&self, context: &BindingContext, type_id: TypeId) -> Option<Property> {
        context.get_inner_property(type_id)
    }
}
