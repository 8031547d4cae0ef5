//! Relay RPC: lets any backend process reach connections held by this instance.
//!
//! Every instance answers for its own registry only. Callers broadcast to all
//! instances through [`RelayFanout`](crate::client::RelayFanout) and combine
//! the answers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{AdminList, GatewayConfig};
use crate::error::Result;
use crate::platform::Platform;
use crate::protocol::{self, base64_bytes, Resp};
use crate::registry::ConnRegistry;
use crate::rpc::{RpcResponse, RpcServer, RpcService};
use crate::session::{DisconnectReason, SessionKey};
use crate::token::{TokenMutation, TokenStore};

/// Outcome of one delivery attempt to one platform on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ResultCode {
    Delivered,
    NotConnected,
    WriteFailed,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        match self {
            ResultCode::Delivered => 0,
            ResultCode::NotConnected => -1,
            ResultCode::WriteFailed => -2,
        }
    }

    /// Higher is better when merging answers from several instances.
    pub fn rank(self) -> u8 {
        match self {
            ResultCode::Delivered => 2,
            ResultCode::NotConnected => 1,
            ResultCode::WriteFailed => 0,
        }
    }
}

impl TryFrom<i32> for ResultCode {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, String> {
        match code {
            0 => Ok(ResultCode::Delivered),
            -1 => Ok(ResultCode::NotConnected),
            -2 => Ok(ResultCode::WriteFailed),
            other => Err(format!("unknown result code {other}")),
        }
    }
}

impl From<ResultCode> for i32 {
    fn from(c: ResultCode) -> i32 {
        c.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResult {
    #[serde(rename = "platformID")]
    pub platform: Platform,
    #[serde(rename = "resultCode")]
    pub result: ResultCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPushResult {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub results: Vec<PlatformResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlinePushReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Empty means every platform in the instance's universe
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// One recipient of a batch push with its own copy of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOnlinePushReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    pub pushes: Vec<UserPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickOfflineReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "platformID")]
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOnlineStatusReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    /// Identity of the caller, checked against the admin allow-list
    #[serde(rename = "opUserID")]
    pub caller_id: String,
    #[serde(rename = "userIDs")]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStatus {
    #[serde(rename = "platformID")]
    pub platform_id: i32,
    #[serde(rename = "platform")]
    pub platform_name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineStatus {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub status: String,
    pub detail: Vec<PlatformStatus>,
}

pub const ONLINE: &str = "online";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RelayRequest {
    OnlinePush(OnlinePushReq),
    BatchOnlinePush(BatchOnlinePushReq),
    KickOffline(KickOfflineReq),
    QueryOnlineStatus(QueryOnlineStatusReq),
}

impl RelayRequest {
    pub fn operation_id(&self) -> &str {
        match self {
            RelayRequest::OnlinePush(r) => &r.operation_id,
            RelayRequest::BatchOnlinePush(r) => &r.operation_id,
            RelayRequest::KickOffline(r) => &r.operation_id,
            RelayRequest::QueryOnlineStatus(r) => &r.operation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "result")]
pub enum RelayReply {
    OnlinePush(Vec<PlatformResult>),
    BatchOnlinePush(Vec<UserPushResult>),
    KickOffline,
    QueryOnlineStatus(Vec<OnlineStatus>),
}

pub type RelayResponse = RpcResponse<RelayReply>;

/// Serves [`RelayService`] over TCP.
pub type RelayServer = RpcServer<RelayService>;

/// Local half of the relay: operates on this instance's registry.
pub struct RelayService {
    registry: Arc<ConnRegistry>,
    tokens: Arc<dyn TokenStore>,
    platforms: Vec<Platform>,
    admins: AdminList,
}

impl RelayService {
    pub fn new(config: &GatewayConfig, registry: Arc<ConnRegistry>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            registry,
            tokens,
            platforms: config.platforms.clone(),
            admins: config.admin_user_ids.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    /// Write `payload` as a push frame to each targeted platform of one user.
    ///
    /// Returns one result per targeted platform; a failed write on one
    /// platform does not stop the others.
    pub async fn online_push(&self, req: &OnlinePushReq) -> Result<Vec<PlatformResult>> {
        let frame = protocol::encode_json(&Resp::push(&req.operation_id, req.payload.clone()))?;
        let targets = if req.platforms.is_empty() { &self.platforms } else { &req.platforms };
        Ok(self.push_user(&req.operation_id, &req.user_id, targets, &frame).await)
    }

    /// Push each user their own payload on every platform.
    pub async fn batch_online_push(&self, req: &BatchOnlinePushReq) -> Result<Vec<UserPushResult>> {
        let mut out = Vec::with_capacity(req.pushes.len());
        for push in &req.pushes {
            let frame = protocol::encode_json(&Resp::push(&req.operation_id, push.payload.clone()))?;
            let results = self.push_user(&req.operation_id, &push.user_id, &self.platforms, &frame).await;
            out.push(UserPushResult { user_id: push.user_id.clone(), results });
        }
        Ok(out)
    }

    async fn push_user(&self, operation_id: &str, user_id: &str, platforms: &[Platform], frame: &[u8]) -> Vec<PlatformResult> {
        let mut results = Vec::with_capacity(platforms.len());
        for &platform in platforms {
            let result = match self.registry.get(&SessionKey::new(user_id, platform)) {
                None => ResultCode::NotConnected,
                Some(conn) => match conn.send(frame).await {
                    Ok(()) => ResultCode::Delivered,
                    Err(e) => {
                        tracing::warn!(operation_id, user_id, platform = %platform, conn_id = conn.id(), error = %e, "push write failed");
                        ResultCode::WriteFailed
                    }
                },
            };
            tracing::debug!(operation_id, user_id, platform = %platform, result = result.code(), "online push");
            results.push(PlatformResult { platform, result });
        }
        results
    }

    /// Close the local connection of a session, if any, and flag its tokens
    /// kicked. Kicking an absent connection is not an error.
    pub async fn kick_offline(&self, req: &KickOfflineReq) -> Result<()> {
        let key = SessionKey::new(req.user_id.clone(), req.platform);
        if let Some(conn) = self.registry.get(&key) {
            if let Err(e) = conn.send_json(&Resp::kick(&req.operation_id)).await {
                tracing::debug!(operation_id = %req.operation_id, conn_id = conn.id(), error = %e, "kick notice not delivered");
            }
            self.registry.remove(&conn, DisconnectReason::Kicked).await;
            tracing::info!(operation_id = %req.operation_id, user_id = %key.user_id, platform = %key.platform, "kicked local connection");
        }
        self.tokens.apply(&key, vec![TokenMutation::KickAll]).await
    }

    /// Privileged: platforms each listed user is connected on here.
    /// Users with no connection are omitted.
    pub fn query_online_status(&self, req: &QueryOnlineStatusReq) -> Result<Vec<OnlineStatus>> {
        self.admins.check(&req.caller_id, "query online status")?;
        let mut out = Vec::new();
        for user_id in &req.user_ids {
            let mut platforms: Vec<Platform> = self.registry.get_all(user_id).into_keys().collect();
            if platforms.is_empty() {
                continue;
            }
            platforms.sort();
            out.push(OnlineStatus {
                user_id: user_id.clone(),
                status: ONLINE.to_string(),
                detail: platforms
                    .into_iter()
                    .map(|p| PlatformStatus { platform_id: p.id(), platform_name: p.name().to_string(), status: ONLINE.to_string() })
                    .collect(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl RpcService for RelayService {
    type Request = RelayRequest;
    type Reply = RelayReply;
    const NAME: &'static str = "relay";

    async fn handle(&self, req: RelayRequest) -> RelayResponse {
        let result = match &req {
            RelayRequest::OnlinePush(r) => self.online_push(r).await.map(RelayReply::OnlinePush),
            RelayRequest::BatchOnlinePush(r) => self.batch_online_push(r).await.map(RelayReply::BatchOnlinePush),
            RelayRequest::KickOffline(r) => self.kick_offline(r).await.map(|()| RelayReply::KickOffline),
            RelayRequest::QueryOnlineStatus(r) => self.query_online_status(r).map(RelayReply::QueryOnlineStatus),
        };
        match result {
            Ok(reply) => RelayResponse::Ok(reply),
            Err(e) => {
                tracing::warn!(operation_id = req.operation_id(), error = %e, "relay request failed");
                RelayResponse::error(&e)
            }
        }
    }
}
