use std::{any::Any, fmt, sync::Arc};

use crate::{encoding::MessageEncoder, stream::upgrade::StreamUpgradeProvider};

/// 类型擦除后的属性值，按 `TypeId` 查询。
pub type Property = Arc<dyn Any + Send + Sync>;

/// 把属性还原为具体类型。
pub fn downcast_property<T: Any + Send + Sync>(property: Property) -> Option<Arc<T>> {
    property.downcast::<T>().ok()
}

/// 传输方案名（如 `net.tcp`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportScheme(pub &'static str);

/// 编码阶段对外公布的内容类型。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageEncoding {
    pub content_type: String,
}

/// 编码阶段写入参数袋的编码器。
#[derive(Clone)]
pub struct EncoderParameter(pub Arc<dyn MessageEncoder>);

impl fmt::Debug for EncoderParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncoderParameter").field(&self.0.content_type()).finish()
    }
}

/// 升级阶段写入参数袋的升级提供者。
#[derive(Clone, Debug)]
pub struct UpgradeParameter(pub StreamUpgradeProvider);
