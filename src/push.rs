//! Delivery outcome aggregation and the offline-push decision.
//!
//! The decision is made once per (message, recipient): offline push fires only
//! when no push-capable platform of the recipient was reached anywhere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::client::RelayFanout;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::messages::{content_type, option_key, MsgData};
use crate::platform::Platform;
use crate::relay::{PlatformResult, ResultCode, UserPayload};

/// Best known result per platform for one recipient across all instances.
///
/// A platform absent from the map had no answer from any instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    results: BTreeMap<Platform, ResultCode>,
}

impl DeliveryOutcome {
    /// Fold in one instance's answer, keeping the best code per platform.
    pub fn merge(&mut self, results: &[PlatformResult]) {
        for r in results {
            self.results
                .entry(r.platform)
                .and_modify(|cur| {
                    if r.result.rank() > cur.rank() {
                        *cur = r.result;
                    }
                })
                .or_insert(r.result);
        }
    }

    pub fn get(&self, platform: Platform) -> Option<ResultCode> {
        self.results.get(&platform).copied()
    }

    pub fn reached_any(&self, platforms: &[Platform]) -> bool {
        platforms.iter().any(|p| self.get(*p) == Some(ResultCode::Delivered))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Platform, ResultCode)> + '_ {
        self.results.iter().map(|(p, c)| (*p, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// External offline notification sender (APNs/FCM style).
#[async_trait]
pub trait OfflinePusher: Send + Sync {
    async fn push(&self, user_ids: &[String], title: &str, body: &str, custom: &str, operation_id: &str) -> Result<()>;
}

/// Custom content attached to an offline notification so the client can
/// open the right conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushContent {
    #[serde(rename = "sessionType")]
    pub session_type: i32,
    pub from: String,
    pub to: String,
    pub seq: u32,
}

/// Notification title for `msg` as seen by `recipient`.
pub fn offline_title(msg: &MsgData, recipient: &str) -> String {
    if let Some(info) = msg.offline_push_info.as_ref().filter(|i| !i.title.is_empty()) {
        return info.title.clone();
    }
    let title = match msg.content_type {
        content_type::TEXT => "[TEXT]",
        content_type::PICTURE => "[PICTURE]",
        content_type::VOICE => "[VOICE]",
        content_type::VIDEO => "[VIDEO]",
        content_type::FILE => "[File]",
        content_type::AT_TEXT if msg.at_user_id_list.iter().any(|u| u == recipient) => "[@TEXT][NEWMSG]",
        content_type::AT_TEXT => "[GROUPMSG]]",
        content_type::SIGNALING_NOTIFICATION => "[SIGNALINVITE]",
        _ => "[NEWMSG]",
    };
    title.to_string()
}

pub fn offline_body(msg: &MsgData) -> String {
    msg.offline_push_info.as_ref().map(|i| i.desc.clone()).unwrap_or_default()
}

/// Delivers stored messages to recipients and falls back to offline push.
pub struct Pusher {
    fanout: Arc<RelayFanout>,
    offline: Arc<dyn OfflinePusher>,
    push_platforms: Vec<Platform>,
}

impl Pusher {
    pub fn new(config: &GatewayConfig, fanout: Arc<RelayFanout>, offline: Arc<dyn OfflinePusher>) -> Self {
        Self { fanout, offline, push_platforms: config.push_platforms.clone() }
    }

    /// True when no push-capable platform was reached.
    pub fn needs_offline(&self, outcome: &DeliveryOutcome) -> bool {
        !outcome.reached_any(&self.push_platforms)
    }

    fn offline_wanted(msg: &MsgData, recipient: &str) -> bool {
        msg.option(option_key::OFFLINE_PUSH) && recipient != msg.send_id
    }

    /// Single chat delivery to `msg.recv_id`.
    ///
    /// A failed fan-out counts as reaching nobody.
    pub async fn deliver_to_user(&self, msg: &MsgData, operation_id: &str) -> Result<DeliveryOutcome> {
        let payload = serde_json::to_vec(msg)?;
        let recipient = msg.recv_id.as_str();
        let outcome = match self.fanout.online_push(recipient, &[], payload, operation_id).await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(operation_id, user_id = recipient, error = %e, "online push failed, treating as unreached");
                DeliveryOutcome::default()
            }
        };
        if Self::offline_wanted(msg, recipient) && self.needs_offline(&outcome) {
            let title = offline_title(msg, recipient);
            self.push_offline(&[recipient.to_string()], &title, msg, operation_id).await;
        } else {
            tracing::debug!(operation_id, user_id = recipient, "offline push suppressed");
        }
        Ok(outcome)
    }

    /// Group delivery. `copies` pairs each member with their own stored copy
    /// of the message, so every member is pushed the seq of their own
    /// timeline. One batch fan-out, one decision per member, one offline
    /// push call covering every unreached member.
    pub async fn deliver_to_group(
        &self,
        copies: &[(String, MsgData)],
        operation_id: &str,
    ) -> Result<HashMap<String, DeliveryOutcome>> {
        let Some((_, template)) = copies.first() else {
            return Ok(HashMap::new());
        };
        let pushes = copies
            .iter()
            .map(|(user_id, msg)| Ok(UserPayload { user_id: user_id.clone(), payload: serde_json::to_vec(msg)? }))
            .collect::<Result<Vec<_>>>()?;
        let outcomes = match self.fanout.batch_online_push(pushes, operation_id).await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(operation_id, group_id = %template.group_id, error = %e, "batch online push failed, treating as unreached");
                copies.iter().map(|(u, _)| (u.clone(), DeliveryOutcome::default())).collect()
            }
        };
        let unreached: Vec<String> = copies
            .iter()
            .filter(|(u, msg)| Self::offline_wanted(msg, u))
            .filter(|(u, _)| outcomes.get(u).map_or(true, |o| self.needs_offline(o)))
            .map(|(u, _)| u.clone())
            .collect();
        if !unreached.is_empty() {
            let title = offline_title(template, "");
            // Members' seqs differ; the notification only names the group.
            let mut notice = template.clone();
            notice.seq = 0;
            self.push_offline(&unreached, &title, &notice, operation_id).await;
        }
        Ok(outcomes)
    }

    async fn push_offline(&self, user_ids: &[String], title: &str, msg: &MsgData, operation_id: &str) {
        let content = PushContent {
            session_type: msg.session_type,
            from: msg.send_id.clone(),
            to: if msg.is_group() { msg.group_id.clone() } else { msg.recv_id.clone() },
            seq: msg.seq,
        };
        let custom = match serde_json::to_string(&content) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(operation_id, error = %e, "encode push content");
                return;
            }
        };
        let body = offline_body(msg);
        match self.offline.push(user_ids, title, &body, &custom, operation_id).await {
            Ok(()) => tracing::info!(operation_id, recipients = user_ids.len(), title, "offline push sent"),
            Err(e) => tracing::warn!(operation_id, error = %e, "offline push failed"),
        }
    }
}
