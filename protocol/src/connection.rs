//! 连接封装
//!
//! 一个 Connection 独占一条流，维护出站、入站两个无界队列，
//! 由后台任务按轮次执行收发循环:
//!
//! 1. 发起方先写一个占位帧 `{}`
//! 2. 读取一帧，非占位帧放入入站队列
//! 3. 取出最早的出站消息（没有则写占位帧）写出
//! 4. 短暂让出，进入下一轮
//!
//! 读失败（对端关闭、重置）会结束循环并把 `running` 置为 false，
//! 没有重试和重连。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{ProtocolError, Result};
use crate::message::Envelope;
use crate::transport::Transport;
use crate::{MAX_FRAME_SIZE, TICK_INTERVAL};

/// 连接配置
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// 是否为发起方（先发送占位帧）
    pub begins: bool,
    /// 每轮收发之间的让出时间
    pub tick_interval: Duration,
    /// 单帧最大大小
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            begins: false,
            tick_interval: TICK_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// 发起方配置
    pub fn initiator() -> Self {
        Self {
            begins: true,
            ..Self::default()
        }
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    Running,
    Stopped,
}

/// 后台任务的返回值: 写入端交还给 stop() 关闭，附带循环的结束原因
type LoopOutput<W> = (FrameWriter<W>, Result<()>);

/// 收发循环，由后台任务独占
struct Pump<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    running: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    begins: bool,
    tick_interval: Duration,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) -> LoopOutput<W> {
        let result = self.run_loop().await;
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => debug!("Connection loop finished"),
            Err(e) => error!("Connection loop failed: {}", e),
        }

        (self.writer, result)
    }

    async fn run_loop(&mut self) -> Result<()> {
        if self.begins {
            tokio::select! {
                result = write_next(&mut self.writer, None) => {
                    if !keep_going(result)? {
                        return Ok(());
                    }
                }
                _ = self.shutdown_rx.changed() => return Ok(()),
            }
        }

        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            let frame = tokio::select! {
                result = self.reader.read_frame::<Envelope>() => result,
                _ = self.shutdown_rx.changed() => return Ok(()),
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e @ ProtocolError::Serialization(_)) | Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                    return Err(e);
                }
                Err(e) => {
                    debug!("Read failed, stopping connection loop: {}", e);
                    return Ok(());
                }
            };

            if let Some(envelope) = frame {
                if self.inbound_tx.send(envelope).is_err() {
                    // Connection 已被丢弃，无人消费
                    return Ok(());
                }
            }

            let outbound = self.outbound_rx.try_recv().ok();
            tokio::select! {
                result = write_next(&mut self.writer, outbound.as_ref()) => {
                    if !keep_going(result)? {
                        return Ok(());
                    }
                }
                _ = self.shutdown_rx.changed() => return Ok(()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = self.shutdown_rx.changed() => return Ok(()),
            }
        }
    }
}

/// 写出一条出站消息，没有消息时写占位帧
async fn write_next<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    envelope: Option<&Envelope>,
) -> Result<()> {
    match envelope {
        Some(envelope) => writer.write_frame(envelope).await,
        None => writer.write_placeholder().await,
    }
}

/// 写结果分类: 对端断开视为正常结束，其余错误向上传播
fn keep_going(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_disconnect() => {
            debug!("Peer disconnected during write: {}", e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// 连接封装
///
/// `send` 与 `read` 只操作内存队列，不做任何 IO；
/// 真正的收发由 `start` 启动的后台任务完成。
///
/// # Type Parameters
/// * `R` - 读取端类型
/// * `W` - 写入端类型
pub struct Connection<R, W> {
    pending: Option<Pump<R, W>>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: mpsc::UnboundedReceiver<Envelope>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<LoopOutput<W>>>,
    stopped: bool,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// 从传输层创建连接
    pub fn new<T: Transport<Reader = R, Writer = W>>(transport: T, config: ConnectionConfig) -> Self {
        let (reader, writer) = transport.split();
        Self::from_parts(reader, writer, config)
    }

    /// 从读写端直接创建连接
    pub fn from_parts(reader: R, writer: W, config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(false));

        let pump = Pump {
            reader: FrameReader::with_max_frame_size(reader, config.max_frame_size),
            writer: FrameWriter::with_max_frame_size(writer, config.max_frame_size),
            outbound_rx,
            inbound_tx,
            running: Arc::clone(&running),
            shutdown_rx,
            begins: config.begins,
            tick_interval: config.tick_interval,
        };

        Self {
            pending: Some(pump),
            outbound_tx,
            inbound_rx,
            running,
            shutdown_tx,
            task: None,
            stopped: false,
        }
    }

    /// 将默认类型的事件放入出站队列
    pub fn send(&self, event_name: impl Into<String>, data: Value) {
        self.send_envelope(Envelope::event(event_name, data));
    }

    /// 将指定类型的事件放入出站队列
    pub fn send_as(&self, event_name: impl Into<String>, event_type: impl Into<String>, data: Value) {
        self.send_envelope(Envelope::new(event_name, event_type, data));
    }

    /// 将信封放入出站队列，不做 IO，不会失败
    pub fn send_envelope(&self, envelope: Envelope) {
        if self.outbound_tx.send(envelope).is_err() {
            debug!("Connection loop has ended, outbound message dropped");
        }
    }

    /// 取出最早收到的消息，队列为空时返回 `None`
    pub fn read(&mut self) -> Option<Envelope> {
        self.inbound_rx.try_recv().ok()
    }

    /// 等待下一条消息
    ///
    /// 循环结束且队列取空后返回 `None`。未调用 `start` 时会一直等待。
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound_rx.recv().await
    }

    /// 启动后台收发循环
    pub fn start(&mut self) -> Result<()> {
        let pump = self.pending.take().ok_or(ProtocolError::AlreadyStarted)?;

        self.running.store(true, Ordering::SeqCst);
        self.task = Some(tokio::spawn(pump.run()));
        debug!("Connection loop started");

        Ok(())
    }

    /// 停止后台循环并关闭流
    ///
    /// 关闭时遇到连接重置会被忽略；循环若因解码或写入错误结束，
    /// 该错误在这里返回，任务 panic 时返回 `TaskFailed`。
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let (mut writer, loop_result) = match (self.task.take(), self.pending.take()) {
            (Some(task), _) => match task.await {
                Ok(output) => output,
                Err(e) => {
                    // 任务已退出，流随任务一起被丢弃
                    warn!("Connection task did not finish cleanly: {}", e);
                    return Err(ProtocolError::TaskFailed(e.to_string()));
                }
            },
            (None, Some(pump)) => (pump.writer, Ok(())),
            (None, None) => return Ok(()),
        };

        match writer.close().await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => debug!("Peer reset during close: {}", e),
            Err(e) => return Err(e),
        }

        debug!("Connection stopped");
        loop_result
    }

    /// 后台循环是否仍在运行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 当前状态
    pub fn state(&self) -> ConnectionState {
        if self.stopped {
            ConnectionState::Stopped
        } else if self.pending.is_some() {
            ConnectionState::NotStarted
        } else if self.is_running() {
            ConnectionState::Running
        } else {
            ConnectionState::Stopped
        }
    }
}
