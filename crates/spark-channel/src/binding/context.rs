use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    binding::{BindingElement, properties::Property},
    channel::{ChannelFactory, ChannelShape},
    config::ChannelTimeouts,
    error::{ChannelError, Result},
};

/// 横向传递能力提示的参数袋。
///
/// 同一次构建内所有阶段共享同一个袋（克隆只复制句柄）；不同构建之间通过
/// [`detached`](Self::detached) 取得互不影响的副本。
#[derive(Clone, Default)]
pub struct BindingParameters {
    entries: Arc<Mutex<HashMap<TypeId, Property>>>,
}

impl BindingParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入或覆盖同类型参数。
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.entries.lock().insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// 仅当同类型参数不存在时写入；返回是否写入成功。
    pub fn insert_unique<T: Any + Send + Sync>(&self, value: T) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&TypeId::of::<T>()) {
            return false;
        }
        entries.insert(TypeId::of::<T>(), Arc::new(value));
        true
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entry = self.entries.lock().get(&TypeId::of::<T>()).cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.lock().contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 复制当前内容到一个独立的新袋。
    pub fn detached(&self) -> Self {
        Self {
            entries: Arc::new(Mutex::new(self.entries.lock().clone())),
        }
    }
}

impl fmt::Debug for BindingParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingParameters").field("len", &self.len()).finish()
    }
}

/// 指向绑定序列中“剩余部分”的游标。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 每个阶段只应看到自己之下的序列；游标把“完整序列 + 当前位置 + 参数袋 + 默认超时”打包，
///   使阶段无需知道自己在序列中的位置；
/// - `build_inner_channel_factory` 按值消耗上下文：同一个剩余序列在一次构建中只会被构建一次。
///
/// ## 契约（What）
/// - `remaining()`：尚未被构建的元素，首个元素即下一个被委托者；
/// - 剩余序列为空时构建返回配置错误，探测返回 `false`，属性查询返回 `None`。
pub struct BindingContext {
    elements: Arc<[Arc<dyn BindingElement>]>,
    position: usize,
    parameters: BindingParameters,
    timeouts: ChannelTimeouts,
}

impl BindingContext {
    pub(crate) fn new(
        elements: Arc<[Arc<dyn BindingElement>]>,
        parameters: BindingParameters,
        timeouts: ChannelTimeouts,
    ) -> Self {
        Self {
            elements,
            position: 0,
            parameters,
            timeouts,
        }
    }

    pub fn remaining(&self) -> &[Arc<dyn BindingElement>] {
        self.elements.get(self.position..).unwrap_or(&[])
    }

    pub fn parameters(&self) -> &BindingParameters {
        &self.parameters
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    /// 取出下一个元素以及只覆盖其后序列的上下文。
    fn split_next(&self) -> Option<(Arc<dyn BindingElement>, BindingContext)> {
        let element = Arc::clone(self.elements.get(self.position)?);
        let inner = BindingContext {
            elements: Arc::clone(&self.elements),
            position: self.position + 1,
            parameters: self.parameters.clone(),
            timeouts: self.timeouts,
        };
        Some((element, inner))
    }

    /// 回到序列首部、参数袋为空的新游标，与 [`CustomBinding::get_property`] 看到的视图一致。
    ///
    /// 构建出的工厂以它回答声明式属性查询。
    ///
    /// [`CustomBinding::get_property`]: crate::binding::CustomBinding::get_property
    pub fn declared(&self) -> BindingContext {
        BindingContext::new(Arc::clone(&self.elements), BindingParameters::new(), self.timeouts)
    }

    pub fn build_inner_channel_factory(self, shape: ChannelShape) -> Result<Arc<dyn ChannelFactory>> {
        let Some((element, inner)) = self.split_next() else {
            return Err(ChannelError::configuration(format!(
                "no binding element left to build a {shape:?} channel factory; the stack must end with a transport"
            )));
        };
        element.build_channel_factory(inner, shape)
    }

    pub fn can_build_inner_channel_factory(&self, shape: ChannelShape) -> bool {
        self.split_next()
            .is_some_and(|(element, inner)| element.can_build_channel_factory(&inner, shape))
    }

    pub fn get_inner_property(&self, type_id: TypeId) -> Option<Property> {
        let (element, inner) = self.split_next()?;
        element.get_property(&inner, type_id)
    }

    /// [`get_inner_property`](Self::get_inner_property) 的类型化版本。
    pub fn get_property<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_inner_property(TypeId::of::<T>())?.downcast::<T>().ok()
    }
}

impl fmt::Debug for BindingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingContext")
            .field("position", &self.position)
            .field("remaining", &self.remaining())
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_parameters_do_not_leak_between_builds() {
        let shared = BindingParameters::new();
        assert!(shared.insert_unique(7u32));
        assert!(!shared.insert_unique(8u32), "同类型参数只能写入一次");

        let copy = shared.detached();
        copy.insert(String::from("probe"));
        assert!(copy.contains::<u32>());
        assert!(!shared.contains::<String>());
        assert_eq!(shared.get::<u32>().as_deref(), Some(&7));
    }
}
