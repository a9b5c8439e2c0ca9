//! 游戏服务器核心实现
//!
//! 每个接入的对端包装成一个非发起方的 Connection，
//! 收到的事件转发给其他所有对端。

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use socketgame_protocol::{
    Connection, ConnectionConfig, Envelope, FrameReader, FrameWriter, TcpListener, TcpTransport,
    Transport, TransportListener, CONNECT_TIMEOUT, MAX_CONNECTIONS, SHUTDOWN_TIMEOUT,
    SYSTEM_EVENT_TYPE,
};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// 转发给其他对端的事件
#[derive(Clone, Debug)]
pub struct Relay {
    /// 来源对端 ID，来源自身不会收到
    pub from: u32,
    pub envelope: Envelope,
}

impl Relay {
    fn system(from: u32, name: &str) -> Self {
        Self {
            from,
            envelope: Envelope::new(name, SYSTEM_EVENT_TYPE, json!({ "id": from })),
        }
    }
}

/// 共享状态
struct SharedState {
    /// 在线对端: peer_id -> 地址
    peers: RwLock<HashMap<u32, Option<SocketAddr>>>,
    /// 当前连接数
    connection_count: AtomicU32,
    /// 下一个对端 ID
    next_peer_id: AtomicU32,
    /// 最大连接数
    max_connections: u32,
}

impl SharedState {
    fn new(max_connections: u32) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            connection_count: AtomicU32::new(0),
            next_peer_id: AtomicU32::new(1),
            max_connections,
        }
    }

    /// 增加连接数，如果超过限制则返回 false
    fn try_add_connection(&self) -> bool {
        loop {
            let current = self.connection_count.load(Ordering::SeqCst);
            if current >= self.max_connections {
                return false;
            }
            if self
                .connection_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// 减少连接数
    fn remove_connection(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// 登记对端，返回分配的 ID 和已在线的其他对端
    async fn add_peer(&self, addr: Option<SocketAddr>) -> (u32, Vec<u32>) {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let mut peers = self.peers.write().await;
        let mut others: Vec<u32> = peers.keys().copied().collect();
        others.sort_unstable();
        peers.insert(id, addr);
        (id, others)
    }

    /// 注销对端，返回登记时的地址
    async fn remove_peer(&self, id: u32) -> Option<SocketAddr> {
        match self.peers.write().await.remove(&id) {
            Some(addr) => {
                info!("Peer {} ({:?}) removed", id, addr);
                addr
            }
            None => {
                warn!("Peer {} was not registered", id);
                None
            }
        }
    }

    fn online_count(&self) -> u32 {
        self.connection_count.load(Ordering::SeqCst)
    }
}

/// 游戏服务器
pub struct GameServer {
    state: Arc<SharedState>,
    relay_tx: broadcast::Sender<Relay>,
    /// 关闭信号发送端
    shutdown_tx: watch::Sender<bool>,
    /// 关闭信号接收端（用于克隆给对端处理器）
    shutdown_rx: watch::Receiver<bool>,
    /// 每个对端连接使用的配置
    connection_config: ConnectionConfig,
}

impl GameServer {
    pub fn new() -> Self {
        Self::with_max_connections(MAX_CONNECTIONS as u32)
    }

    pub fn with_max_connections(max_connections: u32) -> Self {
        let (relay_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state: Arc::new(SharedState::new(max_connections)),
            relay_tx,
            shutdown_tx,
            shutdown_rx,
            connection_config: ConnectionConfig::default(),
        }
    }

    /// 绑定地址并运行，Ctrl+C 时退出
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// 在已绑定的监听器上运行，`shutdown` 完成时执行 graceful shutdown
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(transport) => self.admit(transport).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                _ = &mut shutdown => {
                    info!("Received shutdown signal, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn admit(&self, transport: TcpTransport) {
        if !self.state.try_add_connection() {
            warn!("Connection limit reached, rejecting new connection");
            tokio::spawn(reject(transport));
            return;
        }

        let addr = transport.peer_addr().ok();
        let (peer_id, others) = self.state.add_peer(addr).await;
        info!("Peer {} connected from {:?}", peer_id, addr);

        let conn = Connection::new(transport, self.connection_config.clone());
        conn.send_as(
            "welcome",
            SYSTEM_EVENT_TYPE,
            json!({ "id": peer_id, "peers": others }),
        );

        let peer = Peer {
            id: peer_id,
            conn,
            relay_tx: self.relay_tx.clone(),
            relay_rx: self.relay_tx.subscribe(),
            shutdown_rx: self.shutdown_rx.clone(),
        };
        let _ = self.relay_tx.send(Relay::system(peer_id, "joined"));

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Err(e) = peer.run().await {
                debug!("Peer {} handler error: {}", peer_id, e);
            }
            state.remove_peer(peer_id).await;
            state.remove_connection();
        });
    }

    /// 执行 graceful shutdown
    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let start = tokio::time::Instant::now();
        while self.state.online_count() > 0 {
            if start.elapsed() > SHUTDOWN_TIMEOUT {
                warn!(
                    "Shutdown timeout, {} connections still active",
                    self.state.online_count()
                );
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        info!("Server shutdown complete");
    }
}

impl Default for GameServer {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接数超限时回一个错误帧后关闭
///
/// 对端作为发起方会先写占位帧，读掉它再回错误，
/// 关闭时接收缓冲区为空，对端能完整读到这条错误。
async fn reject(transport: TcpTransport) {
    let (reader, writer) = transport.split();
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    match timeout(CONNECT_TIMEOUT, reader.read_raw()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!("Rejected peer went away: {}", e);
            return;
        }
        Err(_) => debug!("Rejected peer sent nothing"),
    }

    let notice = Envelope::new("error", SYSTEM_EVENT_TYPE, json!("server is full"));
    if let Err(e) = writer.write_frame(&notice).await {
        debug!("Failed to send rejection: {}", e);
    }
    let _ = writer.close().await;
}

type PeerConnection = Connection<
    tokio::net::tcp::OwnedReadHalf,
    tokio::net::tcp::OwnedWriteHalf,
>;

/// 单个对端的处理器
struct Peer {
    id: u32,
    conn: PeerConnection,
    relay_tx: broadcast::Sender<Relay>,
    relay_rx: broadcast::Receiver<Relay>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Peer {
    async fn run(mut self) -> anyhow::Result<()> {
        self.conn.start()?;

        loop {
            tokio::select! {
                envelope = self.conn.recv() => {
                    let Some(envelope) = envelope else {
                        info!("Peer {} disconnected", self.id);
                        break;
                    };

                    if let Err(e) = envelope.validate() {
                        self.conn.send_as("error", SYSTEM_EVENT_TYPE, json!(e.to_string()));
                        continue;
                    }

                    debug!("Peer {} sent {}", self.id, envelope.name());
                    let _ = self.relay_tx.send(Relay { from: self.id, envelope });
                }

                result = self.relay_rx.recv() => {
                    match result {
                        Ok(relay) if relay.from != self.id => self.conn.send_envelope(relay.envelope),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Peer {} lagged {} messages", self.id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received for peer {}", self.id);
                        break;
                    }
                }
            }
        }

        let _ = self.relay_tx.send(Relay::system(self.id, "left"));
        self.conn.stop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socketgame_protocol::{TcpTransport, TransportConfig};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_secs(3);

    async fn spawn_server(
        server: GameServer,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
                .unwrap();
        });

        (addr, stop_tx, handle)
    }

    async fn join(addr: SocketAddr) -> PeerConnection {
        let transport = TcpTransport::connect(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();
        let mut conn = Connection::new(transport, ConnectionConfig::initiator());
        conn.start().unwrap();
        conn
    }

    /// 读到指定名字的事件为止
    async fn next_named(conn: &mut PeerConnection, name: &str) -> Envelope {
        timeout(WAIT, async {
            loop {
                let envelope = conn.recv().await.expect("connection ended");
                if envelope.name() == name {
                    return envelope;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_events_relayed_between_peers() {
        let (addr, stop_tx, handle) = spawn_server(GameServer::new()).await;

        let mut alice = join(addr).await;
        let welcome = next_named(&mut alice, "welcome").await;
        assert_eq!(welcome.event_type(), SYSTEM_EVENT_TYPE);
        assert_eq!(welcome.data(), &json!({"id": 1, "peers": []}));

        let mut bob = join(addr).await;
        let welcome = next_named(&mut bob, "welcome").await;
        assert_eq!(welcome.data(), &json!({"id": 2, "peers": [1]}));

        let joined = next_named(&mut alice, "joined").await;
        assert_eq!(joined.data(), &json!({"id": 2}));

        bob.send("move", json!({"x": 1, "y": 2}));
        let moved = next_named(&mut alice, "move").await;
        assert_eq!(moved.event_type(), "event");
        assert_eq!(moved.data(), &json!({"x": 1, "y": 2}));

        bob.stop().await.unwrap();
        let left = next_named(&mut alice, "left").await;
        assert_eq!(left.data(), &json!({"id": 2}));

        let _ = stop_tx.send(());
        timeout(WAIT, handle).await.unwrap().unwrap();

        // 服务器关闭后客户端循环自行结束
        assert!(timeout(WAIT, alice.recv()).await.unwrap().is_none());
        assert!(!alice.is_running());
        alice.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_registry_keeps_address() {
        let state = SharedState::new(4);
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let (first, others) = state.add_peer(Some(addr)).await;
        assert!(others.is_empty());
        let (second, others) = state.add_peer(None).await;
        assert_eq!(others, vec![first]);

        assert_eq!(state.remove_peer(first).await, Some(addr));
        assert_eq!(state.remove_peer(second).await, None);
        assert_eq!(state.remove_peer(first).await, None);
    }

    #[tokio::test]
    async fn test_invalid_event_name_rejected() {
        let (addr, stop_tx, handle) = spawn_server(GameServer::new()).await;

        let mut alice = join(addr).await;
        next_named(&mut alice, "welcome").await;

        alice.send("", json!(null));
        let error = next_named(&mut alice, "error").await;
        assert_eq!(error.event_type(), SYSTEM_EVENT_TYPE);

        alice.stop().await.unwrap();
        let _ = stop_tx.send(());
        timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (addr, stop_tx, handle) = spawn_server(GameServer::with_max_connections(1)).await;

        let mut alice = join(addr).await;
        next_named(&mut alice, "welcome").await;

        let mut bob = join(addr).await;
        let error = next_named(&mut bob, "error").await;
        assert_eq!(error.data(), &json!("server is full"));

        assert!(timeout(WAIT, bob.recv()).await.unwrap().is_none());
        bob.stop().await.unwrap();

        alice.stop().await.unwrap();
        let _ = stop_tx.send(());
        timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
