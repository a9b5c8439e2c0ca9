//! 游戏客户端核心实现

use std::io::{BufRead, Write};
use std::thread;

use anyhow::Context;
use chrono::{DateTime, Local};
use serde_json::Value;
use socketgame_protocol::{
    Connection, ConnectionConfig, Envelope, TcpTransport, Transport, TransportConfig,
    SYSTEM_EVENT_TYPE,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 输入行解析出的命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 发送事件
    Send { name: String, data: Value },
    /// 断开并退出
    Quit,
}

/// 解析一行输入: `name [json]`
///
/// 负载不是合法 JSON 时按字符串发送，缺省为 null。空行返回 `None`。
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "/quit" {
        return Some(Command::Quit);
    }

    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    let data = if rest.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()))
    };

    Some(Command::Send {
        name: name.to_string(),
        data,
    })
}

/// 格式化一条收到的事件
pub fn format_envelope(envelope: &Envelope, at: DateTime<Local>) -> String {
    let time = at.format("%H:%M:%S");
    if envelope.event_type() == SYSTEM_EVENT_TYPE {
        format!("[{}] * {} {}", time, envelope.name(), envelope.data())
    } else {
        format!(
            "[{}] {} ({}): {}",
            time,
            envelope.name(),
            envelope.event_type(),
            envelope.data()
        )
    }
}

/// 连接服务器并以标准输入驱动会话
pub async fn run(addr: &str) -> anyhow::Result<()> {
    let transport = TcpTransport::connect(addr, &TransportConfig::default())
        .await
        .with_context(|| format!("连接失败: {}", addr))?;
    info!("Connected to {}", addr);

    let conn = Connection::new(transport, ConnectionConfig::initiator());
    run_session(conn, spawn_stdin_reader(), std::io::stdout()).await?;

    Ok(())
}

/// 在独立线程中逐行读取标准输入
///
/// 阻塞读无法取消，放在分离的线程里，连接结束时进程可以直接退出。
/// 输入结束或出错时通道关闭。
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = mpsc::unbounded_channel();

    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    break;
                }
            }
        }
    });

    line_rx
}

/// 会话主循环
///
/// 输入的每一行转为一次 `send`，收到的事件写到 `out`。
/// 输入结束、`/quit` 或连接结束时停止连接并返回 `out`。
pub async fn run_session<R, W, O>(
    mut conn: Connection<R, W>,
    mut lines: mpsc::UnboundedReceiver<String>,
    mut out: O,
) -> anyhow::Result<O>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    O: Write,
{
    conn.start()?;

    loop {
        tokio::select! {
            envelope = conn.recv() => {
                match envelope {
                    Some(envelope) => {
                        writeln!(out, "{}", format_envelope(&envelope, Local::now()))?;
                        out.flush()?;
                    }
                    None => {
                        info!("Server closed connection");
                        break;
                    }
                }
            }

            line = lines.recv() => {
                match line {
                    Some(line) => match parse_command(&line) {
                        Some(Command::Send { name, data }) => {
                            let envelope = Envelope::event(name, data);
                            match envelope.validate() {
                                Ok(()) => conn.send_envelope(envelope),
                                Err(e) => warn!("Not sent: {}", e),
                            }
                        }
                        Some(Command::Quit) => break,
                        None => {}
                    },
                    None => {
                        info!("Input closed");
                        break;
                    }
                }
            }
        }
    }

    conn.stop().await?;
    Ok(out)
}
