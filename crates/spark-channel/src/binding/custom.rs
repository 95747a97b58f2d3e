use std::{
    any::{Any, TypeId},
    sync::Arc,
};

use tracing::debug;

use crate::{
    binding::{BindingContext, BindingElement, BindingParameters, ElementKind},
    channel::{ChannelFactory, ChannelShape},
    config::{BindingConfig, ChannelTimeouts},
    error::{ChannelError, Result},
};

/// 显式有序的绑定元素序列。
///
/// # 契约（What）
/// - `validate`：非空、恰好一个传输元素且位于末尾；
/// - `build_channel_factory`：校验后自首元素起构建，每次调用使用全新的参数袋；
/// - `can_build_channel_factory`：同样的校验加逐级只读探测，不改变任何状态；
/// - `get_property`：自首元素起委托，首个答案胜出。
#[derive(Clone, Debug)]
pub struct CustomBinding {
    elements: Arc<[Arc<dyn BindingElement>]>,
    timeouts: ChannelTimeouts,
}

impl CustomBinding {
    pub fn new(elements: impl IntoIterator<Item = Arc<dyn BindingElement>>) -> Self {
        Self {
            elements: elements.into_iter().collect(),
            timeouts: ChannelTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ChannelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// 由配置文件生成传输之上的元素，再拼接调用方提供的传输元素。
    pub fn from_config(config: &BindingConfig, transport: Arc<dyn BindingElement>) -> Result<Self> {
        config.validate()?;
        let mut elements = config.upper_elements();
        elements.push(transport);
        let binding = Self::new(elements).with_timeouts(config.timeouts);
        binding.validate()?;
        Ok(binding)
    }

    pub fn elements(&self) -> &[Arc<dyn BindingElement>] {
        &self.elements
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    pub fn validate(&self) -> Result<()> {
        let Some(last) = self.elements.last() else {
            return Err(ChannelError::configuration("binding has no elements"));
        };
        if last.kind() != ElementKind::Transport {
            return Err(ChannelError::configuration(format!(
                "the last binding element must be a transport, found {last:?}"
            )));
        }
        let transports = self
            .elements
            .iter()
            .filter(|element| element.kind() == ElementKind::Transport)
            .count();
        if transports != 1 {
            return Err(ChannelError::configuration(format!(
                "binding must contain exactly one transport element, found {transports}"
            )));
        }
        self.timeouts.validate()
    }

    fn context(&self, parameters: BindingParameters) -> BindingContext {
        BindingContext::new(Arc::clone(&self.elements), parameters, self.timeouts)
    }

    pub fn build_channel_factory(&self, shape: ChannelShape) -> Result<Arc<dyn ChannelFactory>> {
        self.build_with_parameters(shape, BindingParameters::new())
    }

    pub(crate) fn build_with_parameters(
        &self,
        shape: ChannelShape,
        parameters: BindingParameters,
    ) -> Result<Arc<dyn ChannelFactory>> {
        self.validate()?;
        let factory = self.context(parameters).build_inner_channel_factory(shape)?;
        debug!(shape = ?shape, elements = self.elements.len(), "channel factory built");
        Ok(factory)
    }

    pub fn can_build_channel_factory(&self, shape: ChannelShape) -> bool {
        self.can_build_with_parameters(shape, &BindingParameters::new())
    }

    pub(crate) fn can_build_with_parameters(&self, shape: ChannelShape, parameters: &BindingParameters) -> bool {
        self.validate().is_ok()
            && self
                .context(parameters.detached())
                .can_build_inner_channel_factory(shape)
    }

    pub fn get_property<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.context(BindingParameters::new())
            .get_inner_property(TypeId::of::<T>())?
            .downcast::<T>()
            .ok()
    }
}

/// 绑定加预置参数：调用方可在构建前向参数袋注入能力（例如自定义编码器）。
#[derive(Clone, Debug)]
pub struct ChannelBuilder {
    binding: CustomBinding,
    parameters: BindingParameters,
}

impl ChannelBuilder {
    pub fn new(binding: CustomBinding) -> Self {
        Self {
            binding,
            parameters: BindingParameters::new(),
        }
    }

    pub fn with_parameter<T: Any + Send + Sync>(self, value: T) -> Self {
        self.parameters.insert(value);
        self
    }

    pub fn binding(&self) -> &CustomBinding {
        &self.binding
    }

    /// 每次构建都基于预置参数的独立副本。
    pub fn build_channel_factory(&self, shape: ChannelShape) -> Result<Arc<dyn ChannelFactory>> {
        self.binding
            .build_with_parameters(shape, self.parameters.detached())
    }

    pub fn can_build_channel_factory(&self, shape: ChannelShape) -> bool {
        self.binding.can_build_with_parameters(shape, &self.parameters)
    }
}
