//! 通道上传输的应用消息。

use bytes::Bytes;

/// 一条应用消息：动作标识 + 不透明消息体。
///
/// 消息体使用 [`Bytes`]，在编码器、分帧层与调用方之间零拷贝共享。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    action: String,
    body: Bytes,
}

impl Message {
    pub fn new(action: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            action: action.into(),
            body: body.into(),
        }
    }

    /// 空动作、空消息体，用作单向发送的确认回复。
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_empty(&self) -> bool {
        self.action.is_empty() && self.body.is_empty()
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.action, self.body)
    }
}
