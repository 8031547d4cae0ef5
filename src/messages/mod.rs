//! Payloads carried inside request and reply envelopes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::platform::Platform;

/// Content type identifiers.
pub mod content_type {
    pub const TEXT: i32 = 101;
    pub const PICTURE: i32 = 102;
    pub const VOICE: i32 = 103;
    pub const VIDEO: i32 = 104;
    pub const FILE: i32 = 105;
    pub const AT_TEXT: i32 = 106;
    pub const SIGNALING_NOTIFICATION: i32 = 1601;
}

/// Conversation kind of a message.
pub mod session_type {
    pub const SINGLE_CHAT: i32 = 1;
    pub const GROUP_CHAT: i32 = 2;
}

/// Option keys understood by the delivery path. Absent keys read as enabled.
pub mod option_key {
    pub const OFFLINE_PUSH: &str = "offlinePush";
    pub const HISTORY: &str = "history";
}

/// Caller supplied hints for the offline notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OfflinePushInfo {
    pub title: String,
    pub desc: String,
    pub ex: String,
}

/// One chat message as stored and delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgData {
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "recvID")]
    pub recv_id: String,
    #[serde(rename = "groupID")]
    pub group_id: String,
    #[serde(rename = "clientMsgID")]
    pub client_msg_id: String,
    #[serde(rename = "serverMsgID")]
    pub server_msg_id: String,
    #[serde(rename = "senderPlatformID")]
    pub sender_platform_id: i32,
    #[serde(rename = "sessionType")]
    pub session_type: i32,
    #[serde(rename = "contentType")]
    pub content_type: i32,
    pub content: String,
    pub seq: u32,
    #[serde(rename = "sendTime")]
    pub send_time: i64,
    #[serde(rename = "createTime")]
    pub create_time: i64,
    #[serde(rename = "atUserIDList")]
    pub at_user_id_list: Vec<String>,
    pub options: HashMap<String, bool>,
    #[serde(rename = "offlinePushInfo")]
    pub offline_push_info: Option<OfflinePushInfo>,
}

impl MsgData {
    pub fn builder() -> MsgDataBuilder {
        MsgDataBuilder::default()
    }

    pub fn option(&self, key: &str) -> bool {
        self.options.get(key).copied().unwrap_or(true)
    }

    pub fn is_group(&self) -> bool {
        self.session_type == session_type::GROUP_CHAT
    }

    /// Conversation this message belongs to, seen from `owner`.
    pub fn conversation_for(&self, owner: &str) -> &str {
        if self.is_group() {
            &self.group_id
        } else if self.send_id == owner {
            &self.recv_id
        } else {
            &self.send_id
        }
    }
}

#[derive(Debug, Default)]
pub struct MsgDataBuilder {
    msg: MsgData,
}

impl MsgDataBuilder {
    pub fn send_id(mut self, v: impl Into<String>) -> Self {
        self.msg.send_id = v.into();
        self
    }

    pub fn recv_id(mut self, v: impl Into<String>) -> Self {
        self.msg.recv_id = v.into();
        self.msg.session_type = session_type::SINGLE_CHAT;
        self
    }

    pub fn group_id(mut self, v: impl Into<String>) -> Self {
        self.msg.group_id = v.into();
        self.msg.session_type = session_type::GROUP_CHAT;
        self
    }

    pub fn client_msg_id(mut self, v: impl Into<String>) -> Self {
        self.msg.client_msg_id = v.into();
        self
    }

    pub fn sender_platform(mut self, p: Platform) -> Self {
        self.msg.sender_platform_id = p.id();
        self
    }

    pub fn content_type(mut self, v: i32) -> Self {
        self.msg.content_type = v;
        self
    }

    pub fn content(mut self, v: impl Into<String>) -> Self {
        self.msg.content = v.into();
        self
    }

    pub fn seq(mut self, v: u32) -> Self {
        self.msg.seq = v;
        self
    }

    pub fn at_users(mut self, v: Vec<String>) -> Self {
        self.msg.at_user_id_list = v;
        self
    }

    pub fn option(mut self, key: &str, on: bool) -> Self {
        self.msg.options.insert(key.to_string(), on);
        self
    }

    pub fn offline_push_info(mut self, v: OfflinePushInfo) -> Self {
        self.msg.offline_push_info = Some(v);
        self
    }

    pub fn build(self) -> MsgData {
        self.msg
    }
}

/// Reply to `GetNewestSeq`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeqRange {
    pub max_seq: u32,
    pub min_seq: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullBySeqRangeReq {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "seqBegin")]
    pub seq_begin: u32,
    #[serde(rename = "seqEnd")]
    pub seq_end: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullBySeqListReq {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "seqList")]
    pub seq_list: Vec<u32>,
}

/// Pulled messages grouped by conversation.
///
/// `single_msgs` is keyed by peer user, `group_msgs` by group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulledMessages {
    #[serde(rename = "singleMsgs")]
    pub single_msgs: BTreeMap<String, Vec<MsgData>>,
    #[serde(rename = "groupMsgs")]
    pub group_msgs: BTreeMap<String, Vec<MsgData>>,
    #[serde(rename = "maxSeq")]
    pub max_seq: u32,
    #[serde(rename = "minSeq")]
    pub min_seq: u32,
}

impl PulledMessages {
    /// Group `msgs` by conversation for `owner`, keeping seq order.
    pub fn group(owner: &str, mut msgs: Vec<MsgData>, range: SeqRange) -> Self {
        msgs.sort_by_key(|m| m.seq);
        let mut out = PulledMessages { max_seq: range.max_seq, min_seq: range.min_seq, ..Default::default() };
        for m in msgs {
            let key = m.conversation_for(owner).to_string();
            let bucket = if m.is_group() { &mut out.group_msgs } else { &mut out.single_msgs };
            bucket.entry(key).or_default().push(m);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.single_msgs.values().chain(self.group_msgs.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendMsgReq {
    #[serde(rename = "msgData")]
    pub msg_data: MsgData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendMsgResp {
    #[serde(rename = "clientMsgID")]
    pub client_msg_id: String,
    #[serde(rename = "serverMsgID")]
    pub server_msg_id: String,
    #[serde(rename = "sendTime")]
    pub send_time: i64,
}
