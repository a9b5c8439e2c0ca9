//! socketgame 共享协议库
//!
//! 包含:
//! - 消息信封 (Envelope, Meta)
//! - 传输层抽象 (Transport trait)
//! - 分隔符帧编解码 (Codec)
//! - 带收发队列的连接 (Connection)

mod message;
mod constants;
mod transport;
mod codec;
mod connection;
mod error;

pub use message::{Envelope, Meta};
pub use constants::*;
pub use transport::{Transport, TransportListener, TransportConfig, TcpTransport, TcpListener};
pub use codec::{encode_payload, FrameReader, FrameWriter};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::{ProtocolError, Result};
