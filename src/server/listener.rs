//! Shared listener
//!
//! One TCP listener serves both components. Each accepted stream is served
//! as HTTP/1.1 with upgrades enabled; the router hands WebSocket upgrades to
//! the relay and answers everything else from the score routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::{Extension, Router};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::routes::{build_router, AppState};
use crate::relay::{OriginPolicy, Relay};
use crate::store::ScoreStore;

/// How long `run` waits for open connections to close after shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the listener
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Admission policy for relay handshakes
    pub origin_policy: OriginPolicy,
}

impl ServerConfig {
    /// Create a new server configuration admitting every origin
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            origin_policy: OriginPolicy::allow_all(),
        }
    }

    /// Set the handshake admission policy
    pub fn with_origin_policy(mut self, origin_policy: OriginPolicy) -> Self {
        self.origin_policy = origin_policy;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Server owning the listener, the relay and the score store
pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
    store: Arc<dyn ScoreStore>,
    router: Router,
    shutdown_tx: broadcast::Sender<()>,
    tracker: TaskTracker,
}

impl Server {
    /// Bind the listener. Port 0 lets the OS pick one; see [`Server::local_addr`].
    pub async fn bind(config: ServerConfig, store: Arc<dyn ScoreStore>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let relay = Arc::new(Relay::new(config.origin_policy));
        let tracker = TaskTracker::new();

        let router = build_router(AppState {
            relay: Arc::clone(&relay),
            store: Arc::clone(&store),
            shutdown_tx: shutdown_tx.clone(),
            tracker: tracker.clone(),
        });

        Ok(Self {
            listener,
            relay,
            store,
            router,
            shutdown_tx,
            tracker,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The relay serving upgraded connections
    #[allow(dead_code)]
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept connections until a shutdown signal is received, then wait
    /// (up to [`SHUTDOWN_GRACE`]) for open connections to finish closing.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            "Listening on {} (score store: {})",
            self.local_addr()?,
            self.store.backend_name()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let router = self.router.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            self.tracker.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, router, shutdown_rx).await {
                                    debug!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        self.tracker.close();
        let open = self.relay.connection_count().await;
        if open > 0 {
            info!("Closing {} open relay connections...", open);
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connection tasks still running after {:?}",
                self.tracker.len(),
                SHUTDOWN_GRACE
            );
        }

        Ok(())
    }
}

/// Serve one accepted stream as HTTP/1.1 until it closes, upgrades, or
/// shutdown is signalled
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> hyper::Result<()> {
    let service = TowerToHyperService::new(router.layer(Extension(ConnectInfo(peer_addr))));
    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown_rx.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ECHO_PROTOCOL;
    use crate::store::MemoryStore;
    use futures_util::{SinkExt, StreamExt};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL};
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
        let server = Arc::new(
            Server::bind(config, Arc::new(MemoryStore::new()))
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            running.run().await.unwrap();
        });
        (server, addr, handle)
    }

    async fn start_default() -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
        start(ServerConfig::new("127.0.0.1", 0)).await
    }

    async fn connect(addr: SocketAddr, origin: Option<&'static str>) -> Result<Client, WsError> {
        let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(ECHO_PROTOCOL));
        if let Some(origin) = origin {
            request
                .headers_mut()
                .insert(ORIGIN, HeaderValue::from_static(origin));
        }
        let (client, response) = connect_async(request).await?;
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            ECHO_PROTOCOL
        );
        Ok(client)
    }

    async fn wait_for_connections(server: &Server, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while server.relay().connection_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never reached the expected connection count");
    }

    async fn next_data(client: &mut Client) -> Message {
        loop {
            let msg = tokio::time::timeout(WAIT, client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("websocket error");
            if msg.is_text() || msg.is_binary() {
                return msg;
            }
        }
    }

    async fn plain_get(addr: SocketAddr, target: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{}{}", addr, target))
            .header("Origin", "http://localhost:3000")
            .send()
            .await
            .unwrap()
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1", 8080);
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_text_broadcast_reaches_every_client() {
        let (server, addr, _handle) = start_default().await;
        let mut a = connect(addr, None).await.unwrap();
        let mut b = connect(addr, None).await.unwrap();
        let mut c = connect(addr, None).await.unwrap();
        wait_for_connections(&server, 3).await;

        a.send(Message::Text("hello".to_string())).await.unwrap();

        for client in [&mut a, &mut b, &mut c] {
            assert_eq!(next_data(client).await, Message::Text("hello".to_string()));
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_binary_echo_reaches_sender_only() {
        let (server, addr, _handle) = start_default().await;
        let mut a = connect(addr, None).await.unwrap();
        let mut b = connect(addr, None).await.unwrap();
        let mut c = connect(addr, None).await.unwrap();
        wait_for_connections(&server, 3).await;

        b.send(Message::Binary(vec![0x01, 0x02, 0x03])).await.unwrap();
        assert_eq!(next_data(&mut b).await, Message::Binary(vec![0x01, 0x02, 0x03]));

        // Anything A or C saw before this marker would have been the echo
        c.send(Message::Text("marker".to_string())).await.unwrap();
        assert_eq!(next_data(&mut a).await, Message::Text("marker".to_string()));
        assert_eq!(next_data(&mut c).await, Message::Text("marker".to_string()));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_frames_from_one_client_arrive_in_order() {
        let (server, addr, _handle) = start_default().await;
        let mut a = connect(addr, None).await.unwrap();
        let mut b = connect(addr, None).await.unwrap();
        wait_for_connections(&server, 2).await;

        for i in 0..20 {
            a.send(Message::Text(format!("msg-{i}"))).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(next_data(&mut b).await, Message::Text(format!("msg-{i}")));
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_closed_client_leaves_active_set() {
        let (server, addr, _handle) = start_default().await;
        let mut a = connect(addr, None).await.unwrap();
        let mut b = connect(addr, None).await.unwrap();
        wait_for_connections(&server, 2).await;

        b.close(None).await.unwrap();
        wait_for_connections(&server, 1).await;

        a.send(Message::Text("anyone?".to_string())).await.unwrap();
        assert_eq!(next_data(&mut a).await, Message::Text("anyone?".to_string()));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_client_without_subprotocol_is_accepted() {
        let (server, addr, _handle) = start_default().await;
        let (mut client, response) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
        wait_for_connections(&server, 1).await;

        client.send(Message::Text("plain".to_string())).await.unwrap();
        assert_eq!(next_data(&mut client).await, Message::Text("plain".to_string()));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_origin_gets_forbidden() {
        let config = ServerConfig::new("127.0.0.1", 0)
            .with_origin_policy(OriginPolicy::allow_list(["https://game.example.com"]));
        let (server, addr, _handle) = start(config).await;

        let result = connect(addr, Some("https://evil.example.com")).await;
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
            other => panic!("Expected HTTP 403, got {:?}", other.map(|_| ())),
        }
        assert_eq!(server.relay().connection_count().await, 0);

        connect(addr, Some("https://game.example.com")).await.unwrap();
        wait_for_connections(&server, 1).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_score_routes_share_the_listener() {
        let (server, addr, _handle) = start_default().await;

        let response = plain_get(addr, "/get").await;
        assert_eq!(response.status(), 404);

        let response = plain_get(addr, "/set?name=Ann%20Lee&score=42").await;
        assert_eq!(response.status(), 201);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert_eq!(
            response.text().await.unwrap(),
            r#"{"highscore":{"name":"Ann Lee","score":42}}"#
        );

        let response = plain_get(addr, "/get").await;
        assert_eq!(response.status(), 201);
        assert_eq!(response.text().await.unwrap(), "Ann Lee,42");

        let response = plain_get(addr, "/leaderboard").await;
        assert_eq!(response.status(), 404);

        // A relay client on the same port still works
        let mut client = connect(addr, None).await.unwrap();
        client.send(Message::Text("same port".to_string())).await.unwrap();
        assert_eq!(next_data(&mut client).await, Message::Text("same port".to_string()));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_incomplete_upgrade_is_bad_request() {
        let (server, addr, _handle) = start_default().await;

        let response = reqwest::Client::new()
            .get(format!("http://{}/", addr))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        assert_eq!(server.relay().connection_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_before_run_returns() {
        let (server, addr, handle) = start_default().await;
        let mut a = connect(addr, None).await.unwrap();
        let mut b = connect(addr, None).await.unwrap();
        wait_for_connections(&server, 2).await;

        server.shutdown();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(server.relay().connection_count().await, 0);

        for client in [&mut a, &mut b] {
            let next = tokio::time::timeout(WAIT, client.next()).await.unwrap();
            assert!(matches!(next, Some(Ok(Message::Close(_)))), "got {:?}", next);
        }
    }

    /// Mirrors the binary: `run` returns, then the runtime is dropped. The
    /// close frames must already be on the wire by then.
    #[test]
    fn test_close_frames_survive_runtime_drop() {
        const CLIENTS: usize = 20;

        let server_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let client_rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let server = Arc::new(
            server_rt
                .block_on(Server::bind(
                    ServerConfig::new("127.0.0.1", 0),
                    Arc::new(MemoryStore::new()),
                ))
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let running = Arc::clone(&server);
        let run = server_rt.spawn(async move { running.run().await });

        let mut clients = client_rt.block_on(async {
            let mut clients = Vec::new();
            for _ in 0..CLIENTS {
                clients.push(connect(addr, None).await.unwrap());
            }
            clients
        });
        server_rt.block_on(wait_for_connections(&server, CLIENTS));

        server.shutdown();
        server_rt.block_on(run).unwrap().unwrap();
        drop(server);
        drop(server_rt);

        client_rt.block_on(async {
            for client in clients.iter_mut() {
                let next = tokio::time::timeout(WAIT, client.next()).await.unwrap();
                assert!(matches!(next, Some(Ok(Message::Close(_)))), "got {:?}", next);
            }
        });
    }
}
