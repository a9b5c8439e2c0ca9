//! 错误类型定义

use std::io::ErrorKind;

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 收发循环已经启动过
    #[error("Connection already started")]
    AlreadyStarted,

    /// 后台收发任务异常退出（panic 或被取消）
    #[error("Connection task failed: {0}")]
    TaskFailed(String),

    /// 事件名不合法
    #[error("Invalid event name: {len} chars (max: {max})")]
    InvalidEventName { len: usize, max: usize },
}

impl ProtocolError {
    /// 是否属于对端断开（关闭、重置、管道破裂）
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(ProtocolError::ConnectionClosed.is_disconnect());
        assert!(ProtocolError::Io(ErrorKind::ConnectionReset.into()).is_disconnect());
        assert!(ProtocolError::Io(ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!ProtocolError::Io(ErrorKind::PermissionDenied.into()).is_disconnect());
        assert!(!ProtocolError::AlreadyStarted.is_disconnect());
    }
}
