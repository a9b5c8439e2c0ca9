//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌──────────────────────────────────────┬──────────┐
//! │        Payload (JSON object)         │  '|' 1B  │
//! └──────────────────────────────────────┴──────────┘
//! ```
//!
//! 没有长度前缀，以分隔符 `|` 结束。空对象 `{}` 是占位帧，
//! 表示本轮没有消息。

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{ProtocolError, Result};
use crate::{FRAME_DELIMITER, MAX_FRAME_SIZE, PLACEHOLDER_FRAME};

/// 分隔符在 JSON 字符串中的转义形式
const ESCAPED_DELIMITER: &[u8] = b"\\u007c";

fn map_read_err(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(e)
    }
}

/// 将消息编码为不含分隔符的 JSON 负载
///
/// JSON 中 `|` 只能出现在字符串字面量里，替换为 `\u007c` 后解码结果不变。
pub fn encode_payload<M: Serialize>(msg: &M) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if !json.contains(&FRAME_DELIMITER) {
        return Ok(json);
    }

    let mut escaped = Vec::with_capacity(json.len() + 8);
    for byte in json {
        if byte == FRAME_DELIMITER {
            escaped.extend_from_slice(ESCAPED_DELIMITER);
        } else {
            escaped.push(byte);
        }
    }
    Ok(escaped)
}

/// 帧读取器
pub struct FrameReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 创建新的帧读取器
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, MAX_FRAME_SIZE)
    }

    /// 创建指定帧大小上限的帧读取器
    pub fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// 读取一帧原始负载（不含分隔符）
    pub async fn read_raw(&mut self) -> Result<&[u8]> {
        self.buffer.clear();

        loop {
            let available = self.reader.fill_buf().await.map_err(map_read_err)?;
            if available.is_empty() {
                // 对端关闭，丢弃未结束的半帧
                return Err(ProtocolError::ConnectionClosed);
            }

            let (taken, complete) = match available.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(pos) => {
                    self.buffer.extend_from_slice(&available[..pos]);
                    (pos + 1, true)
                }
                None => {
                    self.buffer.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.reader.consume(taken);

            if self.buffer.len() > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: self.buffer.len(),
                    max: self.max_frame_size,
                });
            }

            if complete {
                return Ok(&self.buffer);
            }
        }
    }

    /// 读取并解码一帧消息，占位帧返回 `None`
    pub async fn read_frame<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        let raw = self.read_raw().await?;
        let value: Value = serde_json::from_slice(raw)?;

        if value.as_object().is_some_and(|map| map.is_empty()) {
            return Ok(None);
        }

        let msg = serde_json::from_value(value)?;
        Ok(Some(msg))
    }
}

/// 帧写入器
pub struct FrameWriter<W> {
    writer: W,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// 创建新的帧写入器
    pub fn new(writer: W) -> Self {
        Self::with_max_frame_size(writer, MAX_FRAME_SIZE)
    }

    /// 创建指定帧大小上限的帧写入器
    pub fn with_max_frame_size(writer: W, max_frame_size: usize) -> Self {
        Self {
            writer,
            max_frame_size,
        }
    }

    /// 编码并写入一帧消息
    pub async fn write_frame<M: Serialize>(&mut self, msg: &M) -> Result<()> {
        let payload = encode_payload(msg)?;

        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        self.write_raw(&payload).await
    }

    /// 写入占位帧 `{}|`
    pub async fn write_placeholder(&mut self) -> Result<()> {
        self.write_raw(PLACEHOLDER_FRAME).await
    }

    /// 关闭写入端
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn write_raw(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_all(payload).await?;
        self.writer.write_all(&[FRAME_DELIMITER]).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
