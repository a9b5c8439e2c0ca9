//! 游戏客户端
//!
//! 从标准输入读取事件发送给服务器，打印收到的事件

mod client;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:9000";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志（输出到 stderr，避免与事件输出混在一起）
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("game_client=debug".parse()?)
                .add_directive("socketgame_protocol=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    client::run(&addr).await
}
