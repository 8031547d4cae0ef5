#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod messages;
pub mod platform;
pub mod protocol;
pub mod push;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod token;

pub use auth::{AuthServer, AuthService};
pub use client::{LocalRelayConnector, RelayConnector, RelayFanout, TcpRelayConnector};
pub use config::{AdminList, GatewayConfig, MultiLoginPolicy, RelayConfig, TokenPolicy};
pub use discovery::{ServiceDiscovery, StaticDiscovery};
pub use error::{ImError, Result, TokenError};
pub use gateway::{Gateway, GatewayContext};
pub use handler::Handlers;
pub use platform::Platform;
pub use push::{DeliveryOutcome, OfflinePusher, Pusher};
pub use registry::ConnRegistry;
pub use relay::{RelayServer, RelayService, ResultCode};
pub use rpc::{RpcResponse, RpcServer, RpcService};
pub use session::{ConnHandle, DisconnectReason, SessionKey};
pub use token::{MemoryTokenStore, TokenManager, TokenStore};
