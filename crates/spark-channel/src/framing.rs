//! 面向记录的会话分帧。
//!
//! # 模块定位（Why）
//! - 一条连接在承载消息之前需要先交换会话前导：协议版本、通信模式、目标 Via、编码内容类型，
//!   以及可选的若干次流升级；前导完成后连接上只流动定长信封；
//! - 前导只在新建连接上执行一次，池化复用的连接直接进入信封交换。
//!
//! # 线路格式（What）
//! - 每条记录以 1 字节记录类型开头，见 [`RecordType`]；
//! - 字符串记录（Via、ExtensibleEncoding、UpgradeRequest、Fault）与信封记录在类型之后跟随
//!   `u32` 大端长度与载荷；
//! - Version 记录携带 `major`、`minor` 两个字节；Mode 记录携带 1 字节模式（双工为 `0x02`）；
//! - 客户端前导：Version → Mode → Via → ExtensibleEncoding → (UpgradeRequest ⇄ UpgradeResponse + 握手)* →
//!   PreambleEnd，服务端以 PreambleAck 或 Fault 应答。
//!
//! # 风险提示（Trade-offs）
//! - 记录布局参考了经典的 .NET 消息分帧记录类型，但不追求与任何既有实现逐字节兼容。

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    error::{ChannelError, QuotaDirection, Result},
    stream::{
        BoxedStream,
        upgrade::{RemoteSecurity, StreamUpgradeProvider},
    },
    time::Deadline,
};

const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;
const MODE_DUPLEX: u8 = 0x02;
const MAX_STRING_RECORD: u32 = 64 * 1024;

/// 会话记录类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Version = 0x00,
    Mode = 0x01,
    Via = 0x02,
    ExtensibleEncoding = 0x04,
    SizedEnvelope = 0x06,
    End = 0x07,
    Fault = 0x08,
    UpgradeRequest = 0x09,
    UpgradeResponse = 0x0A,
    PreambleAck = 0x0B,
    PreambleEnd = 0x0C,
}

impl TryFrom<u8> for RecordType {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Self::Version,
            0x01 => Self::Mode,
            0x02 => Self::Via,
            0x04 => Self::ExtensibleEncoding,
            0x06 => Self::SizedEnvelope,
            0x07 => Self::End,
            0x08 => Self::Fault,
            0x09 => Self::UpgradeRequest,
            0x0A => Self::UpgradeResponse,
            0x0B => Self::PreambleAck,
            0x0C => Self::PreambleEnd,
            other => {
                return Err(ChannelError::protocol_violation(format!(
                    "unknown framing record type 0x{other:02x}"
                )));
            }
        })
    }
}

/// 信封交换阶段读到的记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    Envelope(Bytes),
    Fault(String),
    End,
}

fn io_error(operation: &'static str) -> impl FnOnce(std::io::Error) -> ChannelError {
    move |err| ChannelError::from_io(operation, err)
}

fn put_string_record(buf: &mut BytesMut, record: RecordType, value: &str) -> Result<()> {
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len <= MAX_STRING_RECORD)
        .ok_or_else(|| {
            ChannelError::configuration(format!("{record:?} record exceeds {MAX_STRING_RECORD} bytes"))
        })?;
    buf.put_u8(record as u8);
    buf.put_u32(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

async fn write_buffer<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, buf: &[u8]) -> Result<()> {
    writer.write_all(buf).await.map_err(io_error("framing write"))?;
    writer.flush().await.map_err(io_error("framing flush"))
}

async fn read_record_type<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Option<RecordType>> {
    let mut byte = [0u8; 1];
    let read = reader.read(&mut byte).await.map_err(io_error("framing read"))?;
    if read == 0 {
        return Ok(None);
    }
    RecordType::try_from(byte[0]).map(Some)
}

async fn expect_record_type<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<RecordType> {
    read_record_type(reader)
        .await?
        .ok_or_else(|| ChannelError::communication("connection closed by peer during framing"))
}

async fn read_string<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32().await.map_err(io_error("framing read"))?;
    if len > MAX_STRING_RECORD {
        return Err(ChannelError::protocol_violation(format!(
            "string record of {len} bytes exceeds {MAX_STRING_RECORD}"
        )));
    }
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw).await.map_err(io_error("framing read"))?;
    String::from_utf8(raw).map_err(|_| ChannelError::protocol_violation("string record is not UTF-8"))
}

fn unexpected(record: RecordType, stage: &str) -> ChannelError {
    ChannelError::protocol_violation(format!("unexpected {record:?} record during {stage}"))
}

/// 客户端前导参数。
#[derive(Clone, Copy, Debug)]
pub struct ClientPreamble<'a> {
    pub via: &'a str,
    pub content_type: &'a str,
}

/// 在新建连接上执行客户端前导与可选升级。
///
/// 返回升级后的流与升级得到的远端身份；服务端以 Fault 拒绝时返回通信错误并附带原因。
pub async fn establish_client_session(
    mut stream: BoxedStream,
    preamble: ClientPreamble<'_>,
    upgrade: Option<&StreamUpgradeProvider>,
    deadline: Deadline,
) -> Result<(BoxedStream, Option<RemoteSecurity>)> {
    deadline
        .run("session preamble", async move {
            let mut head = BytesMut::with_capacity(64 + preamble.via.len());
            head.put_u8(RecordType::Version as u8);
            head.put_u8(VERSION_MAJOR);
            head.put_u8(VERSION_MINOR);
            head.put_u8(RecordType::Mode as u8);
            head.put_u8(MODE_DUPLEX);
            put_string_record(&mut head, RecordType::Via, preamble.via)?;
            put_string_record(&mut head, RecordType::ExtensibleEncoding, preamble.content_type)?;
            write_buffer(&mut stream, &head).await?;

            let mut security = None;
            if let Some(provider) = upgrade {
                let mut initiator = provider.create_initiator();
                initiator.open(deadline)?;
                while let Some(token) = initiator.next_upgrade().map(str::to_owned) {
                    let mut request = BytesMut::new();
                    put_string_record(&mut request, RecordType::UpgradeRequest, &token)?;
                    write_buffer(&mut stream, &request).await?;
                    match expect_record_type(&mut stream).await? {
                        RecordType::UpgradeResponse => {
                            stream = initiator.initiate_upgrade(stream, deadline).await?;
                            debug!(token = %token, "stream upgraded");
                        }
                        RecordType::Fault => {
                            let reason = read_string(&mut stream).await?;
                            return Err(ChannelError::communication(format!(
                                "upgrade `{token}` rejected by peer: {reason}"
                            )));
                        }
                        other => return Err(unexpected(other, "upgrade negotiation")),
                    }
                }
                security = Some(initiator.remote_security()?.clone());
                initiator.close();
            }

            write_buffer(&mut stream, &[RecordType::PreambleEnd as u8]).await?;
            match expect_record_type(&mut stream).await? {
                RecordType::PreambleAck => Ok((stream, security)),
                RecordType::Fault => {
                    let reason = read_string(&mut stream).await?;
                    Err(ChannelError::communication(format!("preamble rejected by peer: {reason}")))
                }
                other => Err(unexpected(other, "preamble acknowledgement")),
            }
        })
        .await
}

/// 写出一个定长信封，头部与载荷合并为一次写入。
pub async fn write_envelope<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ChannelError::quota_exceeded(u64::from(u32::MAX), QuotaDirection::Send))?;
    let mut frame = BytesMut::with_capacity(5 + payload.len());
    frame.put_u8(RecordType::SizedEnvelope as u8);
    frame.put_u32(len);
    frame.put_slice(payload);
    write_buffer(writer, &frame).await
}

pub async fn write_fault<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, reason: &str) -> Result<()> {
    let mut frame = BytesMut::new();
    put_string_record(&mut frame, RecordType::Fault, reason)?;
    write_buffer(writer, &frame).await
}

pub async fn write_end<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W) -> Result<()> {
    write_buffer(writer, &[RecordType::End as u8]).await
}

/// 读取下一条记录。
///
/// - 信封长度超过 `max` 时在读取载荷之前返回配额错误；
/// - `scratch` 作为载荷读取缓冲，调用方可以从对象池租借并在返回后归还；
/// - 记录边界处遇到 EOF 返回 `Ok(None)`。
pub async fn read_incoming<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    max: u64,
    scratch: &mut Vec<u8>,
) -> Result<Option<Incoming>> {
    let Some(record) = read_record_type(reader).await? else {
        return Ok(None);
    };
    match record {
        RecordType::SizedEnvelope => {
            let len = reader.read_u32().await.map_err(io_error("envelope read"))?;
            if u64::from(len) > max {
                return Err(ChannelError::quota_exceeded(max, QuotaDirection::Receive));
            }
            scratch.clear();
            scratch.resize(len as usize, 0);
            reader.read_exact(scratch).await.map_err(io_error("envelope read"))?;
            Ok(Some(Incoming::Envelope(Bytes::copy_from_slice(scratch))))
        }
        RecordType::Fault => Ok(Some(Incoming::Fault(read_string(reader).await?))),
        RecordType::End => Ok(Some(Incoming::End)),
        other => Err(unexpected(other, "envelope exchange")),
    }
}

/// 服务端会话参数。
#[derive(Clone, Debug)]
pub struct ServerSessionOptions {
    pub content_type: String,
    pub upgrade: Option<StreamUpgradeProvider>,
    pub max_received_message_size: u64,
}

/// 服务端会话：接收客户端前导后交换信封。
///
/// 主要服务于测试与进程内对端，使客户端通道栈可以在不依赖外部服务的情况下端到端运行。
pub struct ServerSession {
    stream: BoxedStream,
    via: String,
    content_type: String,
    remote_security: Option<RemoteSecurity>,
    max_received_message_size: u64,
    scratch: Vec<u8>,
}

impl ServerSession {
    /// 读取客户端前导，按需接受升级并回复 PreambleAck。
    pub async fn accept(
        stream: BoxedStream,
        options: &ServerSessionOptions,
        deadline: Deadline,
    ) -> Result<Self> {
        deadline
            .run("session accept", Self::accept_inner(stream, options, deadline))
            .await
    }

    async fn accept_inner(
        mut stream: BoxedStream,
        options: &ServerSessionOptions,
        deadline: Deadline,
    ) -> Result<Self> {
        match expect_record_type(&mut stream).await? {
            RecordType::Version => {
                let major = stream.read_u8().await.map_err(io_error("framing read"))?;
                let _minor = stream.read_u8().await.map_err(io_error("framing read"))?;
                if major != VERSION_MAJOR {
                    write_fault(&mut stream, "unsupported framing version").await?;
                    return Err(ChannelError::protocol_violation(format!(
                        "unsupported framing version {major}"
                    )));
                }
            }
            other => return Err(unexpected(other, "session accept")),
        }
        match expect_record_type(&mut stream).await? {
            RecordType::Mode => {
                let mode = stream.read_u8().await.map_err(io_error("framing read"))?;
                if mode != MODE_DUPLEX {
                    write_fault(&mut stream, "unsupported mode").await?;
                    return Err(ChannelError::protocol_violation(format!(
                        "unsupported framing mode 0x{mode:02x}"
                    )));
                }
            }
            other => return Err(unexpected(other, "session accept")),
        }
        let via = match expect_record_type(&mut stream).await? {
            RecordType::Via => read_string(&mut stream).await?,
            other => return Err(unexpected(other, "session accept")),
        };
        let content_type = match expect_record_type(&mut stream).await? {
            RecordType::ExtensibleEncoding => read_string(&mut stream).await?,
            other => return Err(unexpected(other, "session accept")),
        };
        if content_type != options.content_type {
            write_fault(&mut stream, "content type mismatch").await?;
            return Err(ChannelError::protocol_violation(format!(
                "content type `{content_type}` does not match `{}`",
                options.content_type
            )));
        }

        let mut acceptor = options.upgrade.as_ref().map(StreamUpgradeProvider::create_acceptor);
        loop {
            match expect_record_type(&mut stream).await? {
                RecordType::UpgradeRequest => {
                    let token = read_string(&mut stream).await?;
                    let Some(active) = acceptor.as_mut().filter(|active| active.can_upgrade(&token)) else {
                        write_fault(&mut stream, "upgrade not supported").await?;
                        return Err(ChannelError::protocol_violation(format!(
                            "peer requested unsupported upgrade `{token}`"
                        )));
                    };
                    write_buffer(&mut stream, &[RecordType::UpgradeResponse as u8]).await?;
                    stream = active.accept_upgrade(stream, deadline).await?;
                }
                RecordType::PreambleEnd => {
                    write_buffer(&mut stream, &[RecordType::PreambleAck as u8]).await?;
                    break;
                }
                other => return Err(unexpected(other, "session accept")),
            }
        }

        let remote_security = match &acceptor {
            Some(active) => active.remote_security().ok().cloned(),
            None => None,
        };
        debug!(via = %via, content_type = %content_type, "server session accepted");
        Ok(Self {
            stream,
            via,
            content_type,
            remote_security,
            max_received_message_size: options.max_received_message_size,
            scratch: Vec::new(),
        })
    }

    pub fn via(&self) -> &str {
        &self.via
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn remote_security(&self) -> Option<&RemoteSecurity> {
        self.remote_security.as_ref()
    }

    /// 读取下一个信封；客户端发送 End 或关闭连接时返回 `None`。
    pub async fn read_envelope(&mut self) -> Result<Option<Bytes>> {
        match read_incoming(&mut self.stream, self.max_received_message_size, &mut self.scratch).await? {
            Some(Incoming::Envelope(payload)) => Ok(Some(payload)),
            Some(Incoming::End) | None => Ok(None),
            Some(Incoming::Fault(reason)) => Err(ChannelError::communication(format!(
                "client reported fault: {reason}"
            ))),
        }
    }

    pub async fn write_envelope(&mut self, payload: &[u8]) -> Result<()> {
        write_envelope(&mut self.stream, payload).await
    }

    pub async fn write_fault(&mut self, reason: &str) -> Result<()> {
        write_fault(&mut self.stream, reason).await
    }

    /// 发送 End 并关闭写半部。
    pub async fn close(mut self) -> Result<()> {
        write_end(&mut self.stream).await?;
        self.stream.shutdown().await.map_err(io_error("session shutdown"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoding::BINARY_CONTENT_TYPE,
        stream::upgrade::{IdentityUpgrade, StreamUpgradeProvider},
    };
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn preamble_with_upgrade_exposes_identities_on_both_sides() {
        let (client, server) = tokio::io::duplex(1024);
        let options = ServerSessionOptions {
            content_type: BINARY_CONTENT_TYPE.to_owned(),
            upgrade: Some(StreamUpgradeProvider::new(IdentityUpgrade::new("service"))),
            max_received_message_size: 1024,
        };
        let server = tokio::spawn(async move {
            let mut session = ServerSession::accept(Box::new(server), &options, deadline())
                .await
                .expect("服务端前导应成功");
            let request = session.read_envelope().await.expect("读取信封").expect("存在信封");
            session.write_envelope(&request).await.expect("回显信封");
            session.remote_security().cloned()
        });

        let provider = StreamUpgradeProvider::new(IdentityUpgrade::new("caller"));
        let (mut stream, security) = establish_client_session(
            Box::new(client),
            ClientPreamble {
                via: "net.tcp://service/echo",
                content_type: BINARY_CONTENT_TYPE,
            },
            Some(&provider),
            deadline(),
        )
        .await
        .expect("客户端前导应成功");
        assert_eq!(security.expect("升级后存在远端身份").identity(), "service");

        write_envelope(&mut stream, b"ping").await.expect("写入信封");
        let mut scratch = Vec::new();
        let reply = read_incoming(&mut stream, 1024, &mut scratch)
            .await
            .expect("读取回显")
            .expect("存在回显");
        assert_eq!(reply, Incoming::Envelope(Bytes::from_static(b"ping")));

        let server_view = server.await.expect("服务端任务不应 panic");
        assert_eq!(server_view.expect("服务端可见客户端身份").identity(), "caller");
    }

    #[tokio::test]
    async fn content_type_mismatch_is_reported_as_fault() {
        let (client, server) = tokio::io::duplex(1024);
        let options = ServerSessionOptions {
            content_type: "application/spark+json".to_owned(),
            upgrade: None,
            max_received_message_size: 1024,
        };
        let server = tokio::spawn(async move {
            ServerSession::accept(Box::new(server), &options, deadline()).await.is_err()
        });

        let err = establish_client_session(
            Box::new(client),
            ClientPreamble {
                via: "net.tcp://service/echo",
                content_type: BINARY_CONTENT_TYPE,
            },
            None,
            deadline(),
        )
        .await
        .expect_err("编码不匹配应失败");
        assert!(err.message().contains("content type mismatch"));
        assert!(server.await.expect("服务端任务不应 panic"));
    }

    #[tokio::test]
    async fn oversized_envelope_is_rejected_before_reading_payload() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let mut header = BytesMut::new();
        header.put_u8(RecordType::SizedEnvelope as u8);
        header.put_u32(1_000);
        writer.write_all(&header).await.expect("写入头部");

        let mut scratch = Vec::new();
        let err = read_incoming(&mut reader, 16, &mut scratch)
            .await
            .expect_err("声明长度超过配额应失败");
        assert!(err.is_quota_exceeded());
        assert!(scratch.is_empty(), "载荷缓冲不应被扩容");
    }
}
