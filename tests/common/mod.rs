#![allow(dead_code)]

use async_trait::async_trait;
use bytes::BytesMut;
use imgate::client::TcpRelayConnector;
use imgate::handler::Handlers;
use imgate::protocol::{self, HandshakeParams, HandshakeReply, Req, Resp};
use imgate::storage::MemoryMessageStore;
use imgate::{
    AdminList, AuthServer, AuthService, ConnRegistry, Gateway, GatewayConfig, GatewayContext, MemoryTokenStore,
    OfflinePusher, Platform, Pusher, RelayFanout, RelayServer, RelayService, Result, StaticDiscovery, TokenManager,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const ADMIN: &str = "imAdmin";
pub const ADMIN_SECRET: &str = "let-me-in";

#[derive(Default)]
pub struct RecordingPusher {
    pub calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl OfflinePusher for RecordingPusher {
    async fn push(&self, user_ids: &[String], _title: &str, _body: &str, _custom: &str, _op: &str) -> Result<()> {
        self.calls.lock().unwrap().push(user_ids.to_vec());
        Ok(())
    }
}

/// Shared backing services of a small cluster.
pub struct Cluster {
    pub token_store: Arc<MemoryTokenStore>,
    pub discovery: Arc<StaticDiscovery>,
    pub offline: Arc<RecordingPusher>,
}

impl Cluster {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            token_store: Arc::new(MemoryTokenStore::new()),
            discovery: Arc::new(StaticDiscovery::new()),
            offline: Arc::new(RecordingPusher::default()),
        }
    }

    pub fn config() -> GatewayConfig {
        GatewayConfig {
            client_bind_address: "127.0.0.1:0".parse().unwrap(),
            relay_bind_address: "127.0.0.1:0".parse().unwrap(),
            auth_bind_address: "127.0.0.1:0".parse().unwrap(),
            admin_user_ids: AdminList::new([ADMIN]),
            admin_secret: ADMIN_SECRET.to_string(),
            ..GatewayConfig::default()
        }
    }

    pub fn fanout(&self, config: &GatewayConfig) -> Arc<RelayFanout> {
        Arc::new(RelayFanout::new(
            &config.relay,
            self.discovery.clone(),
            Arc::new(TcpRelayConnector::new(config.max_frame_len)),
        ))
    }

    /// Start one gateway instance with its relay and token control servers.
    pub async fn start_node(&self) -> Node {
        self.start_node_with(|_| {}).await
    }

    /// [`start_node`](Self::start_node) with a tweaked config.
    pub async fn start_node_with(&self, tweak: impl FnOnce(&mut GatewayConfig)) -> Node {
        let mut config = Self::config();
        tweak(&mut config);
        let registry = Arc::new(ConnRegistry::with_policy(config.token.multi_login));
        let fanout = self.fanout(&config);
        let tokens = Arc::new(
            TokenManager::new(config.token.clone(), config.admin_user_ids.clone(), self.token_store.clone())
                .with_fanout(fanout.clone()),
        );

        let relay = Arc::new(RelayService::new(&config, registry.clone(), self.token_store.clone()));
        let relay_server = RelayServer::bind(config.relay_bind_address, relay, config.max_frame_len).await.unwrap();
        let relay_addr = relay_server.local_addr().unwrap();
        self.discovery.register(&config.relay.service_name, relay_addr.to_string());
        tokio::spawn(relay_server.run());

        let auth = Arc::new(AuthService::new(&config, tokens.clone()));
        let auth_server = AuthServer::bind(config.auth_bind_address, auth, config.max_frame_len).await.unwrap();
        let auth_addr = auth_server.local_addr().unwrap();
        self.discovery.register(&config.auth_service_name, auth_addr.to_string());
        tokio::spawn(auth_server.run());

        let pusher = Arc::new(Pusher::new(&config, fanout.clone(), self.offline.clone()));
        let store = Arc::new(MemoryMessageStore::new().with_pusher(pusher.clone()));
        let handlers = Handlers::new(store.clone(), store.clone(), store.clone(), config.downstream_timeout());
        let ctx = Arc::new(GatewayContext::new(config, registry.clone(), tokens.clone(), handlers));
        let gateway = Gateway::bind(ctx).await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());

        Node { registry, tokens, store, pusher, fanout, gateway_addr, relay_addr, auth_addr }
    }
}

pub struct Node {
    pub registry: Arc<ConnRegistry>,
    pub tokens: Arc<TokenManager>,
    pub store: Arc<MemoryMessageStore>,
    pub pusher: Arc<Pusher>,
    pub fanout: Arc<RelayFanout>,
    pub gateway_addr: SocketAddr,
    pub relay_addr: SocketAddr,
    pub auth_addr: SocketAddr,
}

impl Node {
    /// Issue a token and connect with it.
    pub async fn login(&self, user: &str, platform: Platform) -> (TestClient, String) {
        let token = self.tokens.issue_token(user, platform).await.unwrap().token;
        let (client, reply) = TestClient::connect(self.gateway_addr, &token, user, platform).await;
        assert_eq!(reply.status, HandshakeReply::OK, "{reply:?}");
        (client, token)
    }
}

pub struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, token: &str, user: &str, platform: Platform) -> (Self, HandshakeReply) {
        let line = HandshakeParams {
            token: token.to_string(),
            send_id: user.to_string(),
            platform,
            operation_id: "handshake".to_string(),
        }
        .to_line();
        Self::connect_raw(addr, line.as_bytes()).await
    }

    pub async fn connect_raw(addr: SocketAddr, line: &[u8]) -> (Self, HandshakeReply) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(line).await.unwrap();
        let mut client = Self { reader, writer, buf: BytesMut::new() };
        let frame = client.recv_frame().await.expect("handshake reply");
        let reply = protocol::decode_json(&frame).unwrap();
        (client, reply)
    }

    pub async fn send(&mut self, req: &Req) {
        let frame = protocol::encode_json(req).unwrap();
        self.send_raw(&frame).await;
    }

    /// Connect and send part of a handshake line, never finishing it.
    pub async fn connect_stalled(addr: SocketAddr, partial: &[u8]) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(partial).await.unwrap();
        Self { reader, writer, buf: BytesMut::new() }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes).await;
    }

    async fn recv_frame(&mut self) -> Option<bytes::Bytes> {
        let read = protocol::read_frame(&mut self.reader, &mut self.buf, 1 << 20);
        match tokio::time::timeout(Duration::from_secs(5), read).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => None,
            Err(_) => panic!("no frame within 5s"),
        }
    }

    /// Next reply or push; `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Resp> {
        let frame = self.recv_frame().await?;
        Some(protocol::decode_json(&frame).unwrap())
    }
}

/// Poll until `cond` holds or a second has passed.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
