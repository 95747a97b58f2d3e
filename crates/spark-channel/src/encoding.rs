//! 消息编码器：在 [`Message`] 与信封字节之间转换。
//!
//! - [`BinaryMessageEncoder`]：`u16` 大端动作长度 + 动作 + 原始消息体，内容类型
//!   `application/spark+binary`；
//! - [`TextMessageEncoder`]：JSON 文档 `{"action": ..., "body": ...}`，消息体必须是 UTF-8，
//!   内容类型 `application/spark+json`。
//!
//! 内容类型写入会话前导的 ExtensibleEncoding 记录，服务端据此确认双方使用同一编码。

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChannelError, ErrorCategory, Result, codes},
    message::Message,
};

pub const BINARY_CONTENT_TYPE: &str = "application/spark+binary";
pub const TEXT_CONTENT_TYPE: &str = "application/spark+json";

/// 编码能力接口。
pub trait MessageEncoder: Send + Sync + fmt::Debug + 'static {
    fn content_type(&self) -> &str;

    fn encode(&self, message: &Message) -> Result<Bytes>;

    fn decode(&self, payload: &[u8]) -> Result<Message>;
}

fn encoding_error(message: impl Into<std::borrow::Cow<'static, str>>) -> ChannelError {
    ChannelError::new(codes::ENCODING, message, ErrorCategory::ProtocolViolation)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryMessageEncoder;

impl MessageEncoder for BinaryMessageEncoder {
    fn content_type(&self) -> &str {
        BINARY_CONTENT_TYPE
    }

    fn encode(&self, message: &Message) -> Result<Bytes> {
        let action = message.action().as_bytes();
        let action_len = u16::try_from(action.len())
            .map_err(|_| encoding_error("message action exceeds 65535 bytes"))?;
        let mut payload = BytesMut::with_capacity(2 + action.len() + message.body().len());
        payload.put_u16(action_len);
        payload.put_slice(action);
        payload.put_slice(message.body());
        Ok(payload.freeze())
    }

    fn decode(&self, payload: &[u8]) -> Result<Message> {
        let Some((len, rest)) = payload.split_first_chunk::<2>() else {
            return Err(encoding_error("binary payload is missing the action header"));
        };
        let len = usize::from(u16::from_be_bytes(*len));
        if rest.len() < len {
            return Err(encoding_error("binary payload is shorter than its action header"));
        }
        let (action, body) = rest.split_at(len);
        let action = std::str::from_utf8(action)
            .map_err(|_| encoding_error("message action is not valid UTF-8"))?;
        Ok(Message::new(action, Bytes::copy_from_slice(body)))
    }
}

#[derive(Serialize)]
struct TextEnvelope<'a> {
    action: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct OwnedTextEnvelope {
    action: String,
    body: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TextMessageEncoder;

impl MessageEncoder for TextMessageEncoder {
    fn content_type(&self) -> &str {
        TEXT_CONTENT_TYPE
    }

    fn encode(&self, message: &Message) -> Result<Bytes> {
        let body = std::str::from_utf8(message.body())
            .map_err(|_| encoding_error("text encoding requires a UTF-8 message body"))?;
        let document = serde_json::to_vec(&TextEnvelope {
            action: message.action(),
            body,
        })
        .map_err(|err| encoding_error("failed to serialise text envelope").with_cause(err))?;
        Ok(Bytes::from(document))
    }

    fn decode(&self, payload: &[u8]) -> Result<Message> {
        let envelope: OwnedTextEnvelope = serde_json::from_slice(payload)
            .map_err(|err| encoding_error(format!("malformed text envelope: {err}")).with_cause(err))?;
        Ok(Message::new(envelope.action, envelope.body))
    }
}
