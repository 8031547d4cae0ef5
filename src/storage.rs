//! Collaborators the gateway consumes for sequence numbers, history and
//! message sending, with an in-memory implementation.
//!
//! Each user owns a timeline of messages numbered from seq 1 upward; a single
//! chat message lands on both participants' timelines, a group message on
//! every member's.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ImError, Result};
use crate::messages::{MsgData, PulledMessages, SeqRange};
use crate::push::Pusher;

#[async_trait]
pub trait SeqStore: Send + Sync + 'static {
    /// Newest and oldest seq on the user's timeline; zeros when empty.
    async fn get_newest_seq(&self, user_id: &str) -> Result<SeqRange>;
}

#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn pull_by_seq_range(&self, user_id: &str, begin: u32, end: u32) -> Result<PulledMessages>;
    async fn pull_by_seq_list(&self, user_id: &str, seqs: &[u32]) -> Result<PulledMessages>;
}

/// What the send path assigned to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub server_msg_id: String,
    /// Seq on the sender's own timeline
    pub seq: u32,
    pub send_time: i64,
}

/// Sequencing and persistence of outgoing messages.
///
/// Online delivery is triggered after persistence, not by the caller.
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    async fn send_message(&self, msg: MsgData, operation_id: &str) -> Result<SentMessage>;
}

#[derive(Default)]
struct Timelines {
    by_user: HashMap<String, Vec<MsgData>>,
    groups: HashMap<String, Vec<String>>,
}

/// In-process seq store, message store and sender.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Timelines>,
    pusher: Option<Arc<Pusher>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every accepted message through `pusher`.
    pub fn with_pusher(mut self, pusher: Arc<Pusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    pub fn set_group_members(&self, group_id: &str, members: Vec<String>) {
        self.lock().groups.insert(group_id.to_string(), members);
    }

    fn lock(&self) -> MutexGuard<'_, Timelines> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn range_of(timeline: Option<&Vec<MsgData>>) -> SeqRange {
        match timeline {
            Some(t) if !t.is_empty() => SeqRange { max_seq: t.len() as u32, min_seq: 1 },
            _ => SeqRange::default(),
        }
    }

    fn append(timelines: &mut Timelines, user_id: &str, msg: &MsgData) -> MsgData {
        let timeline = timelines.by_user.entry(user_id.to_string()).or_default();
        let mut stored = msg.clone();
        stored.seq = timeline.len() as u32 + 1;
        timeline.push(stored.clone());
        stored
    }
}

#[async_trait]
impl SeqStore for MemoryMessageStore {
    async fn get_newest_seq(&self, user_id: &str) -> Result<SeqRange> {
        Ok(Self::range_of(self.lock().by_user.get(user_id)))
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn pull_by_seq_range(&self, user_id: &str, begin: u32, end: u32) -> Result<PulledMessages> {
        if begin > end {
            return Err(ImError::Args(format!("seqBegin {begin} is after seqEnd {end}")));
        }
        let timelines = self.lock();
        let timeline = timelines.by_user.get(user_id);
        let msgs = timeline
            .map(|t| t.iter().filter(|m| m.seq >= begin && m.seq <= end).cloned().collect())
            .unwrap_or_default();
        Ok(PulledMessages::group(user_id, msgs, Self::range_of(timeline)))
    }

    async fn pull_by_seq_list(&self, user_id: &str, seqs: &[u32]) -> Result<PulledMessages> {
        let timelines = self.lock();
        let timeline = timelines.by_user.get(user_id);
        let msgs = timeline
            .map(|t| {
                seqs.iter()
                    .filter_map(|s| s.checked_sub(1).and_then(|i| t.get(i as usize)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(PulledMessages::group(user_id, msgs, Self::range_of(timeline)))
    }
}

#[async_trait]
impl MessageSender for MemoryMessageStore {
    async fn send_message(&self, mut msg: MsgData, operation_id: &str) -> Result<SentMessage> {
        if msg.send_id.is_empty() {
            return Err(ImError::Args("sendID is required".into()));
        }
        msg.server_msg_id = uuid::Uuid::new_v4().to_string();
        msg.send_time = chrono::Utc::now().timestamp_millis();
        if msg.create_time == 0 {
            msg.create_time = msg.send_time;
        }

        let (sender_copy, deliveries, group_copies) = {
            let mut timelines = self.lock();
            if msg.is_group() {
                let members = timelines
                    .groups
                    .get(&msg.group_id)
                    .cloned()
                    .ok_or_else(|| ImError::Args(format!("group {} not found", msg.group_id)))?;
                if !members.contains(&msg.send_id) {
                    return Err(ImError::NoPermission(format!("{} is not in group {}", msg.send_id, msg.group_id)));
                }
                let copies: Vec<(String, MsgData)> = members
                    .into_iter()
                    .map(|m| {
                        let stored = Self::append(&mut timelines, &m, &msg);
                        (m, stored)
                    })
                    .collect();
                let sender_copy = copies
                    .iter()
                    .find(|(m, _)| *m == msg.send_id)
                    .map(|(_, stored)| stored.clone())
                    .unwrap_or_else(|| msg.clone());
                (sender_copy, Vec::new(), copies)
            } else {
                if msg.recv_id.is_empty() {
                    return Err(ImError::Args("single chat message needs a recvID".into()));
                }
                let sender_copy = Self::append(&mut timelines, &msg.send_id.clone(), &msg);
                let recipient_copy = if msg.recv_id == msg.send_id {
                    sender_copy.clone()
                } else {
                    Self::append(&mut timelines, &msg.recv_id.clone(), &msg)
                };
                (sender_copy, vec![recipient_copy], Vec::new())
            }
        };

        tracing::debug!(operation_id, server_msg_id = %sender_copy.server_msg_id, seq = sender_copy.seq, "message stored");

        if let Some(pusher) = &self.pusher {
            let pusher = Arc::clone(pusher);
            let op = operation_id.to_string();
            tokio::spawn(async move {
                for m in deliveries {
                    if let Err(e) = pusher.deliver_to_user(&m, &op).await {
                        tracing::error!(operation_id = %op, error = %e, "delivery failed");
                    }
                }
                if !group_copies.is_empty() {
                    if let Err(e) = pusher.deliver_to_group(&group_copies, &op).await {
                        tracing::error!(operation_id = %op, error = %e, "group delivery failed");
                    }
                }
            });
        }

        Ok(SentMessage {
            server_msg_id: sender_copy.server_msg_id,
            seq: sender_copy.seq,
            send_time: sender_copy.send_time,
        })
    }
}
