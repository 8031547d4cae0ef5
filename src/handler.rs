//! Per-request-kind handlers behind the client protocol.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{self, Duration};

use crate::error::{ImError, Result};
use crate::messages::{session_type, PullBySeqListReq, PullBySeqRangeReq, SendMsgReq, SendMsgResp};
use crate::protocol::{Req, RequestKind};
use crate::session::SessionKey;
use crate::storage::{MessageSender, MessageStore, SeqStore};

/// What the connection does after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Reply with this payload
    Reply(Vec<u8>),
    /// Reply with this payload, then close the connection
    ReplyAndClose(Vec<u8>),
}

/// Downstream collaborators used by the handlers.
#[derive(Clone)]
pub struct Handlers {
    seq: Arc<dyn SeqStore>,
    messages: Arc<dyn MessageStore>,
    sender: Arc<dyn MessageSender>,
    timeout: Duration,
}

fn json<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| ImError::Internal(e.to_string()))
}

impl Handlers {
    pub fn new(
        seq: Arc<dyn SeqStore>,
        messages: Arc<dyn MessageStore>,
        sender: Arc<dyn MessageSender>,
        timeout: Duration,
    ) -> Self {
        Self { seq, messages, sender, timeout }
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ImError::Timeout(what.to_string())),
        }
    }

    /// Run the handler for `kind`. `conn` is the session the request came in on.
    pub async fn dispatch(&self, kind: RequestKind, req: &Req, conn: &SessionKey) -> Result<HandlerOutcome> {
        match kind {
            RequestKind::GetNewestSeq => self.get_newest_seq(req).await.map(HandlerOutcome::Reply),
            RequestKind::PullMsgBySeqRange => self.pull_by_seq_range(req).await.map(HandlerOutcome::Reply),
            RequestKind::PullMsgBySeqList => self.pull_by_seq_list(req).await.map(HandlerOutcome::Reply),
            RequestKind::SendMsg => self.send_msg(req, conn).await.map(HandlerOutcome::Reply),
            RequestKind::Logout => Ok(HandlerOutcome::ReplyAndClose(Vec::new())),
            RequestKind::Heartbeat => Ok(HandlerOutcome::Reply(Vec::new())),
        }
    }

    async fn get_newest_seq(&self, req: &Req) -> Result<Vec<u8>> {
        let range = self.bounded("seq store", self.seq.get_newest_seq(&req.send_id)).await?;
        json(&range)
    }

    /// The pull target defaults to the sender and may not be anyone else.
    fn pull_target<'a>(req: &'a Req, user_id: &'a str) -> Result<&'a str> {
        if user_id.is_empty() || user_id == req.send_id {
            Ok(&req.send_id)
        } else {
            Err(ImError::NoPermission(format!("{} may not pull messages of {user_id}", req.send_id)))
        }
    }

    async fn pull_by_seq_range(&self, req: &Req) -> Result<Vec<u8>> {
        let p: PullBySeqRangeReq = req.payload()?;
        let user_id = Self::pull_target(req, &p.user_id)?;
        if p.seq_begin > p.seq_end {
            return Err(ImError::Args(format!("seqBegin {} is after seqEnd {}", p.seq_begin, p.seq_end)));
        }
        let pulled = self
            .bounded("message store", self.messages.pull_by_seq_range(user_id, p.seq_begin, p.seq_end))
            .await?;
        json(&pulled)
    }

    async fn pull_by_seq_list(&self, req: &Req) -> Result<Vec<u8>> {
        let p: PullBySeqListReq = req.payload()?;
        let user_id = Self::pull_target(req, &p.user_id)?;
        if p.seq_list.is_empty() {
            return Err(ImError::Args("seqList is empty".into()));
        }
        let pulled = self
            .bounded("message store", self.messages.pull_by_seq_list(user_id, &p.seq_list))
            .await?;
        json(&pulled)
    }

    async fn send_msg(&self, req: &Req, conn: &SessionKey) -> Result<Vec<u8>> {
        let SendMsgReq { mut msg_data } = req.payload()?;
        if msg_data.send_id.is_empty() {
            msg_data.send_id = req.send_id.clone();
        } else if msg_data.send_id != req.send_id {
            return Err(ImError::Args("msgData.sendID differs from sendID".into()));
        }
        let addressed = match (msg_data.recv_id.is_empty(), msg_data.group_id.is_empty()) {
            (true, true) => return Err(ImError::Args("recvID or groupID is required".into())),
            (false, false) => return Err(ImError::Args("only one of recvID and groupID may be set".into())),
            (false, true) => session_type::SINGLE_CHAT,
            (true, false) => session_type::GROUP_CHAT,
        };
        if msg_data.session_type == 0 {
            msg_data.session_type = addressed;
        } else if msg_data.session_type != addressed {
            return Err(ImError::Args(format!(
                "sessionType {} does not match the message's recipient",
                msg_data.session_type
            )));
        }
        if msg_data.content_type == 0 {
            return Err(ImError::Args("contentType is required".into()));
        }
        msg_data.sender_platform_id = conn.platform.id();
        let client_msg_id = msg_data.client_msg_id.clone();
        let sent = self
            .bounded("message sender", self.sender.send_message(msg_data, &req.operation_id))
            .await?;
        json(&SendMsgResp { client_msg_id, server_msg_id: sent.server_msg_id, send_time: sent.send_time })
    }
}
