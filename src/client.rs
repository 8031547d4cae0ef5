//! Caller side of the relay RPC.
//!
//! [`RelayFanout`] sends one request to every discovered gateway instance
//! with bounded concurrency and a per-call timeout, then merges the answers.
//! An instance that errors or times out contributes nothing.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{self, Duration};

use crate::config::RelayConfig;
use crate::discovery::ServiceDiscovery;
use crate::error::{ImError, Result};
use crate::platform::Platform;
use crate::push::DeliveryOutcome;
use crate::relay::{
    BatchOnlinePushReq, KickOfflineReq, OnlinePushReq, OnlineStatus, QueryOnlineStatusReq, RelayReply, RelayRequest,
    RelayService, UserPayload,
};
use crate::rpc::{self, RpcService};
use crate::session::SessionKey;

/// Transport used to reach one relay instance.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn call(&self, addr: &str, req: &RelayRequest) -> Result<RelayReply>;
}

/// Connects over TCP for every call.
#[derive(Debug, Clone)]
pub struct TcpRelayConnector {
    max_frame_len: usize,
}

impl TcpRelayConnector {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

#[async_trait]
impl RelayConnector for TcpRelayConnector {
    async fn call(&self, addr: &str, req: &RelayRequest) -> Result<RelayReply> {
        rpc::call(addr, req, self.max_frame_len).await
    }
}

/// Dispatches to [`RelayService`]s living in this process, keyed by address.
#[derive(Default)]
pub struct LocalRelayConnector {
    instances: HashMap<String, Arc<RelayService>>,
}

impl LocalRelayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, addr: impl Into<String>, service: Arc<RelayService>) -> Self {
        self.instances.insert(addr.into(), service);
        self
    }
}

#[async_trait]
impl RelayConnector for LocalRelayConnector {
    async fn call(&self, addr: &str, req: &RelayRequest) -> Result<RelayReply> {
        let service = self
            .instances
            .get(addr)
            .ok_or_else(|| ImError::Unavailable(format!("no instance at {addr}")))?;
        service.handle(req.clone()).await.into_result()
    }
}

/// Scatter/gather over every relay instance.
pub struct RelayFanout {
    discovery: Arc<dyn ServiceDiscovery>,
    connector: Arc<dyn RelayConnector>,
    service_name: String,
    call_timeout: Duration,
    max_concurrency: usize,
}

impl RelayFanout {
    pub fn new(config: &RelayConfig, discovery: Arc<dyn ServiceDiscovery>, connector: Arc<dyn RelayConnector>) -> Self {
        Self {
            discovery,
            connector,
            service_name: config.service_name.clone(),
            call_timeout: config.call_timeout(),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    async fn instances(&self) -> Result<Vec<String>> {
        let instances = time::timeout(self.call_timeout, self.discovery.list_instances(&self.service_name))
            .await
            .map_err(|_| ImError::Timeout(format!("discovery of {}", self.service_name)))??;
        if instances.is_empty() {
            return Err(ImError::Unavailable(format!("no {} instances", self.service_name)));
        }
        Ok(instances)
    }

    /// Replies of every instance that answered in time.
    async fn scatter(&self, req: RelayRequest) -> Result<Vec<RelayReply>> {
        let instances = self.instances().await?;
        let total = instances.len();
        let req = &req;
        let replies: Vec<RelayReply> = stream::iter(instances)
            .map(|addr| async move {
                let res = match time::timeout(self.call_timeout, self.connector.call(&addr, req)).await {
                    Ok(res) => res,
                    Err(_) => Err(ImError::Timeout(format!("relay call to {addr}"))),
                };
                if let Err(e) = &res {
                    tracing::warn!(operation_id = req.operation_id(), instance = %addr, error = %e, "relay instance gave no answer");
                }
                res.ok()
            })
            .buffer_unordered(self.max_concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await;
        tracing::debug!(operation_id = req.operation_id(), answered = replies.len(), total, "relay fan-out done");
        Ok(replies)
    }

    /// Push to one user on all instances; best result per platform.
    pub async fn online_push(
        &self,
        user_id: &str,
        platforms: &[Platform],
        payload: Vec<u8>,
        operation_id: &str,
    ) -> Result<DeliveryOutcome> {
        let req = RelayRequest::OnlinePush(OnlinePushReq {
            operation_id: operation_id.to_string(),
            user_id: user_id.to_string(),
            platforms: platforms.to_vec(),
            payload,
        });
        let mut outcome = DeliveryOutcome::default();
        for reply in self.scatter(req).await? {
            if let RelayReply::OnlinePush(results) = reply {
                outcome.merge(&results);
            }
        }
        Ok(outcome)
    }

    /// Push many users their own payloads on all instances, in one request
    /// per instance.
    pub async fn batch_online_push(
        &self,
        pushes: Vec<UserPayload>,
        operation_id: &str,
    ) -> Result<HashMap<String, DeliveryOutcome>> {
        let mut outcomes: HashMap<String, DeliveryOutcome> =
            pushes.iter().map(|p| (p.user_id.clone(), DeliveryOutcome::default())).collect();
        let req = RelayRequest::BatchOnlinePush(BatchOnlinePushReq { operation_id: operation_id.to_string(), pushes });
        for reply in self.scatter(req).await? {
            if let RelayReply::BatchOnlinePush(per_user) = reply {
                for u in per_user {
                    outcomes.entry(u.user_id).or_default().merge(&u.results);
                }
            }
        }
        Ok(outcomes)
    }

    /// Kick a session everywhere. Returns how many instances acknowledged.
    pub async fn kick_offline(&self, key: &SessionKey, operation_id: &str) -> Result<usize> {
        let req = RelayRequest::KickOffline(KickOfflineReq {
            operation_id: operation_id.to_string(),
            user_id: key.user_id.clone(),
            platform: key.platform,
        });
        let acks = self
            .scatter(req)
            .await?
            .into_iter()
            .filter(|r| matches!(r, RelayReply::KickOffline))
            .count();
        Ok(acks)
    }

    /// Online platforms of each user across all instances.
    pub async fn query_online_status(
        &self,
        caller_id: &str,
        user_ids: &[String],
        operation_id: &str,
    ) -> Result<Vec<OnlineStatus>> {
        let req = RelayRequest::QueryOnlineStatus(QueryOnlineStatusReq {
            operation_id: operation_id.to_string(),
            caller_id: caller_id.to_string(),
            user_ids: user_ids.to_vec(),
        });
        let mut merged: BTreeMap<String, OnlineStatus> = BTreeMap::new();
        for reply in self.scatter(req).await? {
            let RelayReply::QueryOnlineStatus(statuses) = reply else { continue };
            for s in statuses {
                match merged.get_mut(&s.user_id) {
                    Some(existing) => {
                        for d in s.detail {
                            if !existing.detail.iter().any(|e| e.platform_id == d.platform_id) {
                                existing.detail.push(d);
                            }
                        }
                        existing.detail.sort_by_key(|d| d.platform_id);
                    }
                    None => {
                        merged.insert(s.user_id.clone(), s);
                    }
                }
            }
        }
        Ok(merged.into_values().collect())
    }
}
