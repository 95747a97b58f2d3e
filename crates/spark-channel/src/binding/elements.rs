use std::{
    any::{Any, TypeId},
    sync::Arc,
};

use crate::{
    binding::{
        BindingContext, BindingElement, ElementKind,
        properties::{EncoderParameter, MessageEncoding, Property, UpgradeParameter},
    },
    channel::{ChannelFactory, ChannelShape, OneWayChannelFactory},
    encoding::{BinaryMessageEncoder, MessageEncoder, TextMessageEncoder},
    error::{ChannelError, Result},
    stream::upgrade::{StreamUpgrade, StreamUpgradeProvider},
};

/// 同一能力只允许出现一次：剩余序列里再次出现同类元素，或参数袋里已有同类参数，都视为冲突。
fn conflicts<P: Any + Send + Sync>(context: &BindingContext, kind: ElementKind) -> bool {
    context.parameters().contains::<P>()
        || context
            .remaining()
            .iter()
            .any(|element| element.kind() == kind)
}

fn answer<T: Any + Send + Sync>(type_id: TypeId, value: impl FnOnce() -> T) -> Option<Property> {
    (type_id == TypeId::of::<T>()).then(|| Arc::new(value()) as Property)
}

/// 消息编码阶段：向参数袋发布编码器，由传输阶段读取。
#[derive(Clone, Debug)]
pub struct MessageEncodingBindingElement {
    encoder: Arc<dyn MessageEncoder>,
}

impl MessageEncodingBindingElement {
    pub fn new(encoder: Arc<dyn MessageEncoder>) -> Self {
        Self { encoder }
    }

    pub fn binary() -> Self {
        Self::new(Arc::new(BinaryMessageEncoder))
    }

    pub fn text() -> Self {
        Self::new(Arc::new(TextMessageEncoder))
    }

    pub fn encoder(&self) -> &Arc<dyn MessageEncoder> {
        &self.encoder
    }
}

impl BindingElement for MessageEncodingBindingElement {
    fn kind(&self) -> ElementKind {
        ElementKind::Encoding
    }

    fn can_build_channel_factory(&self, context: &BindingContext, shape: ChannelShape) -> bool {
        !conflicts::<EncoderParameter>(context, ElementKind::Encoding)
            && context.can_build_inner_channel_factory(shape)
    }

    fn build_channel_factory(
        &self,
        context: BindingContext,
        shape: ChannelShape,
    ) -> Result<Arc<dyn ChannelFactory>> {
        if conflicts::<EncoderParameter>(&context, ElementKind::Encoding)
            || !context
                .parameters()
                .insert_unique(EncoderParameter(Arc::clone(&self.encoder)))
        {
            return Err(ChannelError::configuration(
                "binding contains more than one message encoding element",
            ));
        }
        context.build_inner_channel_factory(shape)
    }

    fn get_property(&self, context: &BindingContext, type_id: TypeId) -> Option<Property> {
        answer(type_id, || MessageEncoding {
            content_type: self.encoder.content_type().to_owned(),
        })
        .or_else(|| context.get_inner_property(type_id))
    }
}

/// 流升级阶段：向参数袋发布升级提供者，传输在会话前导中执行握手。
#[derive(Clone, Debug)]
pub struct StreamUpgradeBindingElement {
    provider: StreamUpgradeProvider,
}

impl StreamUpgradeBindingElement {
    pub fn new(upgrade: impl StreamUpgrade) -> Self {
        Self::from_provider(StreamUpgradeProvider::new(upgrade))
    }

    pub fn from_provider(provider: StreamUpgradeProvider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &StreamUpgradeProvider {
        &self.provider
    }
}

impl BindingElement for StreamUpgradeBindingElement {
    fn kind(&self) -> ElementKind {
        ElementKind::Upgrade
    }

    fn can_build_channel_factory(&self, context: &BindingContext, shape: ChannelShape) -> bool {
        !conflicts::<UpgradeParameter>(context, ElementKind::Upgrade)
            && context.can_build_inner_channel_factory(shape)
    }

    fn build_channel_factory(
        &self,
        context: BindingContext,
        shape: ChannelShape,
    ) -> Result<Arc<dyn ChannelFactory>> {
        if conflicts::<UpgradeParameter>(&context, ElementKind::Upgrade)
            || !context
                .parameters()
                .insert_unique(UpgradeParameter(self.provider.clone()))
        {
            return Err(ChannelError::configuration(
                "binding contains more than one stream upgrade element",
            ));
        }
        context.build_inner_channel_factory(shape)
    }

    fn get_property(&self, context: &BindingContext, type_id: TypeId) -> Option<Property> {
        answer(type_id, || self.provider.capabilities()).or_else(|| context.get_inner_property(type_id))
    }
}

/// 单向适配阶段：在请求-应答工厂之上提供仅发送的通道。
#[derive(Clone, Copy, Debug, Default)]
pub struct OneWayBindingElement;

impl OneWayBindingElement {
    pub fn new() -> Self {
        Self
    }
}

impl BindingElement for OneWayBindingElement {
    fn kind(&self) -> ElementKind {
        ElementKind::Protocol
    }

    fn can_build_channel_factory(&self, context: &BindingContext, shape: ChannelShape) -> bool {
        shape == ChannelShape::Output && context.can_build_inner_channel_factory(ChannelShape::Request)
    }

    fn build_channel_factory(
        &self,
        context: BindingContext,
        shape: ChannelShape,
    ) -> Result<Arc<dyn ChannelFactory>> {
        if shape != ChannelShape::Output {
            return Err(ChannelError::configuration(format!(
                "one-way binding element only builds output channel factories, not {shape:?}"
            )));
        }
        let inner = context.build_inner_channel_factory(ChannelShape::Request)?;
        let factory: Arc<dyn ChannelFactory> = OneWayChannelFactory::new(inner);
        Ok(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::CustomBinding;

    #[test]
    fn encoding_property_is_answered_without_a_transport() {
        let binding = CustomBinding::new([Arc::new(MessageEncodingBindingElement::text()) as Arc<dyn BindingElement>]);
        let encoding = binding.get_property::<MessageEncoding>().expect("编码阶段应回答内容类型");
        assert_eq!(encoding.content_type, crate::encoding::TEXT_CONTENT_TYPE);
        assert!(binding.validate().is_err(), "缺少传输元素的序列不合法");
    }
}
