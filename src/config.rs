use crate::error::{ImError, Result};
use crate::platform::{Platform, PlatformClass};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one gateway instance.
///
/// Every field has a default so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Client-facing listener
    pub client_bind_address: SocketAddr,
    /// Relay RPC listener
    pub relay_bind_address: SocketAddr,
    /// Token control RPC listener
    pub auth_bind_address: SocketAddr,
    /// Address callers reach the token control service on; defaults to the bind address
    pub auth_advertise_address: Option<String>,
    /// Name the token control service is registered under in discovery
    pub auth_service_name: String,
    /// Address other instances reach this relay on; defaults to the bind address
    pub relay_advertise_address: Option<String>,
    pub max_frame_len: usize,
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    /// A connection that sends nothing for this long is closed; clients
    /// keep quiet connections alive with heartbeat requests
    pub read_idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Bound on every call into the seq store, message store and sender
    pub downstream_timeout_ms: u64,
    pub token: TokenPolicy,
    pub relay: RelayConfig,
    /// Platform universe iterated by online push
    pub platforms: Vec<Platform>,
    /// Platforms whose online delivery suppresses offline push
    pub push_platforms: Vec<Platform>,
    /// Callers allowed to run privileged relay and token operations
    pub admin_user_ids: AdminList,
    /// Shared secret exchanged for an admin token; empty disables the exchange
    pub admin_secret: String,
    /// Static relay instance list for the discovery used by the binary
    pub instances: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_bind_address: SocketAddr::from(([0, 0, 0, 0], 10001)),
            relay_bind_address: SocketAddr::from(([0, 0, 0, 0], 10140)),
            auth_bind_address: SocketAddr::from(([0, 0, 0, 0], 10160)),
            auth_advertise_address: None,
            auth_service_name: "auth".to_string(),
            relay_advertise_address: None,
            max_frame_len: 1024 * 1024,
            max_connections: 100_000,
            handshake_timeout_ms: 10_000,
            read_idle_timeout_ms: 30_000,
            write_timeout_ms: 60_000,
            downstream_timeout_ms: 5_000,
            token: TokenPolicy::default(),
            relay: RelayConfig::default(),
            platforms: Platform::CLIENTS.to_vec(),
            push_platforms: vec![Platform::Ios, Platform::Android],
            admin_user_ids: AdminList::default(),
            admin_secret: String::new(),
            instances: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: GatewayConfig = serde_json::from_str(&raw)
            .map_err(|e| ImError::InvalidConfig(format!("{}: {e}", path.as_ref().display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.secret.is_empty() {
            return Err(ImError::InvalidConfig("token.secret must not be empty".into()));
        }
        if self.token.expire_days <= 0 {
            return Err(ImError::InvalidConfig("token.expire_days must be positive".into()));
        }
        if self.max_frame_len < 64 {
            return Err(ImError::InvalidConfig("max_frame_len too small".into()));
        }
        if self.platforms.is_empty() {
            return Err(ImError::InvalidConfig("platforms must not be empty".into()));
        }
        if self.relay.max_concurrency == 0 {
            return Err(ImError::InvalidConfig("relay.max_concurrency must be at least 1".into()));
        }
        if self.read_idle_timeout_ms == 0 {
            return Err(ImError::InvalidConfig("read_idle_timeout_ms must be positive".into()));
        }
        if self.relay.service_name.is_empty() {
            return Err(ImError::InvalidConfig("relay.service_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn relay_advertise(&self) -> String {
        self.relay_advertise_address
            .clone()
            .unwrap_or_else(|| self.relay_bind_address.to_string())
    }

    pub fn auth_advertise(&self) -> String {
        self.auth_advertise_address
            .clone()
            .unwrap_or_else(|| self.auth_bind_address.to_string())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms)
    }
}

/// User ids allowed to run privileged operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdminList(Vec<String>);

impl AdminList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0.iter().any(|a| a == user_id)
    }

    /// `NoPermission` unless `caller` is listed. `action` completes
    /// "{caller} may not ...".
    pub fn check(&self, caller: &str, action: &str) -> Result<()> {
        if self.contains(caller) {
            Ok(())
        } else {
            Err(ImError::NoPermission(format!("{caller} may not {action}")))
        }
    }
}

/// How a new login treats the user's older sessions.
///
/// The policy decides both which older tokens are kicked when a token is
/// issued and which other platforms' connections a new connection evicts.
/// A connection on the exact same session key is always replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiLoginPolicy {
    /// Nothing is kicked
    DefaultNotKick,
    /// A new login kicks older logins on the same platform
    #[default]
    AllLoginButSameTermKick,
    /// A new login kicks older logins of the same platform class
    AllLoginButSameClassKick,
    /// PC logins never kick or get kicked; among the other platforms only
    /// the newest login survives
    PCAndOther,
}

impl MultiLoginPolicy {
    /// Whether a login on `new` kicks an older login on `old`.
    pub fn kicks(self, new: Platform, old: Platform) -> bool {
        match self {
            MultiLoginPolicy::DefaultNotKick => false,
            MultiLoginPolicy::AllLoginButSameTermKick => new == old,
            MultiLoginPolicy::AllLoginButSameClassKick => new.class() == old.class(),
            MultiLoginPolicy::PCAndOther => new.class() != PlatformClass::Pc && old.class() != PlatformClass::Pc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
    /// HMAC secret used to sign session tokens
    pub secret: String,
    pub expire_days: i64,
    /// `nbf` is backdated by this much to tolerate client clock skew
    pub not_before_skew_secs: i64,
    pub multi_login: MultiLoginPolicy,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            secret: "imgate".to_string(),
            expire_days: 90,
            not_before_skew_secs: 300,
            multi_login: MultiLoginPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Name gateway instances are registered under in discovery
    pub service_name: String,
    /// Bound on one relay RPC to one instance
    pub call_timeout_ms: u64,
    /// Instances called at once during a fan-out
    pub max_concurrency: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            service_name: "messagegateway".to_string(),
            call_timeout_ms: 3_000,
            max_concurrency: 16,
        }
    }
}

impl RelayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"admin_user_ids":["imAdmin"],"token":{"secret":"s3cret"},"push_platforms":[1]}"#,
        )
        .unwrap();
        assert!(cfg.admin_user_ids.contains("imAdmin"));
        assert!(!cfg.admin_user_ids.contains("u1"));
        assert_eq!(cfg.token.secret, "s3cret");
        assert_eq!(cfg.token.expire_days, 90);
        assert_eq!(cfg.push_platforms, vec![Platform::Ios]);
        assert_eq!(cfg.platforms.len(), 9);
        assert_eq!(cfg.relay.service_name, "messagegateway");
    }

    #[test]
    fn admin_check_names_the_action() {
        let admins = AdminList::new(["imAdmin"]);
        admins.check("imAdmin", "kick").unwrap();
        match admins.check("u1", "kick") {
            Err(ImError::NoPermission(msg)) => assert_eq!(msg, "u1 may not kick"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multi_login_policies() {
        use MultiLoginPolicy::*;
        assert!(!DefaultNotKick.kicks(Platform::Ios, Platform::Ios));

        assert!(AllLoginButSameTermKick.kicks(Platform::Ios, Platform::Ios));
        assert!(!AllLoginButSameTermKick.kicks(Platform::Ios, Platform::Android));

        assert!(AllLoginButSameClassKick.kicks(Platform::Ios, Platform::Android));
        assert!(AllLoginButSameClassKick.kicks(Platform::Linux, Platform::Windows));
        assert!(!AllLoginButSameClassKick.kicks(Platform::Ios, Platform::Web));

        assert!(PCAndOther.kicks(Platform::Ios, Platform::Web));
        assert!(PCAndOther.kicks(Platform::Android, Platform::Android));
        assert!(!PCAndOther.kicks(Platform::Windows, Platform::Windows));
        assert!(!PCAndOther.kicks(Platform::Ios, Platform::MacOs));
        assert!(!PCAndOther.kicks(Platform::Linux, Platform::Web));

        let p: MultiLoginPolicy = serde_json::from_str(r#""PCAndOther""#).unwrap();
        assert_eq!(p, PCAndOther);
    }

    #[test]
    fn rejects_empty_secret() {
        let mut cfg = GatewayConfig::default();
        cfg.token.secret.clear();
        assert!(matches!(cfg.validate(), Err(ImError::InvalidConfig(_))));
    }
}
