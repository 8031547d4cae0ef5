use async_trait::async_trait;
use imgate::client::TcpRelayConnector;
use imgate::handler::Handlers;
use imgate::storage::MemoryMessageStore;
use imgate::{
    AuthServer, AuthService, ConnRegistry, Gateway, GatewayConfig, GatewayContext, MemoryTokenStore, OfflinePusher,
    Pusher, RelayFanout, RelayServer, RelayService, Result, StaticDiscovery, TokenManager,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Stand-in offline sender: records the notification in the log.
struct LogOfflinePusher;

#[async_trait]
impl OfflinePusher for LogOfflinePusher {
    async fn push(&self, user_ids: &[String], title: &str, body: &str, custom: &str, operation_id: &str) -> Result<()> {
        tracing::info!(operation_id, ?user_ids, title, body, custom, "offline push");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(path)?,
        None => {
            let cfg = GatewayConfig::default();
            cfg.validate()?;
            cfg
        }
    };

    let registry = Arc::new(ConnRegistry::with_policy(config.token.multi_login));
    let token_store = Arc::new(MemoryTokenStore::new());

    let discovery = StaticDiscovery::new().with_service(&config.relay.service_name, config.instances.clone());
    discovery.register(&config.relay.service_name, config.relay_advertise());
    discovery.register(&config.auth_service_name, config.auth_advertise());
    let fanout = Arc::new(RelayFanout::new(
        &config.relay,
        Arc::new(discovery),
        Arc::new(TcpRelayConnector::new(config.max_frame_len)),
    ));

    let tokens = Arc::new(
        TokenManager::new(config.token.clone(), config.admin_user_ids.clone(), token_store.clone())
            .with_fanout(Arc::clone(&fanout)),
    );

    let relay = Arc::new(RelayService::new(&config, Arc::clone(&registry), token_store));
    let relay_server = RelayServer::bind(config.relay_bind_address, relay, config.max_frame_len).await?;

    if config.admin_secret.is_empty() {
        tracing::warn!("admin_secret is empty: no admin token can be obtained, so no user token can be issued");
    }
    let auth = Arc::new(AuthService::new(&config, Arc::clone(&tokens)));
    let auth_server = AuthServer::bind(config.auth_bind_address, auth, config.max_frame_len).await?;

    let pusher = Arc::new(Pusher::new(&config, fanout, Arc::new(LogOfflinePusher)));
    let store = Arc::new(MemoryMessageStore::new().with_pusher(pusher));
    let handlers = Handlers::new(store.clone(), store.clone(), store, config.downstream_timeout());

    let ctx = Arc::new(GatewayContext::new(config, registry, tokens, handlers));
    let gateway = Gateway::bind(ctx).await?;

    tokio::select! {
        res = gateway.run() => res,
        res = relay_server.run() => res,
        res = auth_server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
