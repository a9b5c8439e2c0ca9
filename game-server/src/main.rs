//! 游戏服务端
//!
//! 基于 Tokio 的异步 TCP 服务器，转发对端之间的事件

mod server;

use anyhow::Result;
use server::GameServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:9000";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("game_server=debug".parse()?)
                .add_directive("socketgame_protocol=info".parse()?),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    info!("Game Server starting on {}", addr);

    let server = GameServer::new();
    server.run(&addr).await?;

    Ok(())
}
