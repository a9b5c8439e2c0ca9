//! 协议常量定义

use std::time::Duration;

/// 帧分隔符
pub const FRAME_DELIMITER: u8 = b'|';

/// 占位帧（无待发送消息时写出的空对象）
pub const PLACEHOLDER_FRAME: &[u8] = b"{}";

/// 默认事件类型
pub const DEFAULT_EVENT_TYPE: &str = "event";

/// 服务端通知使用的事件类型
pub const SYSTEM_EVENT_TYPE: &str = "system";

/// 事件名最大长度
pub const MAX_EVENT_NAME_LEN: usize = 64;

/// 单帧最大大小（不含分隔符）
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// 服务端最大连接数
pub const MAX_CONNECTIONS: usize = 100;

/// 收发循环每轮之间的让出时间（毫秒）
pub const TICK_INTERVAL_MILLIS: u64 = 10;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 关闭时等待后台任务结束的时间（秒）
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// 收发循环间隔 Duration
pub const TICK_INTERVAL: Duration = Duration::from_millis(TICK_INTERVAL_MILLIS);

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 关闭超时 Duration
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
