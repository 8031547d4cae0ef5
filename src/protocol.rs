//! Wire format shared by the client gateway and the relay RPC.
//!
//! A frame is a big-endian `u32` body length followed by a JSON body. Client
//! connections open with a single handshake query line terminated by `\n`
//! before any frame is exchanged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{code, ImError, Result};
use crate::platform::Platform;

const LEN_PREFIX: usize = 4;

/// Request identifiers carried in `reqIdentifier`.
pub mod req_id {
    pub const HEARTBEAT: i32 = 1000;
    pub const GET_NEWEST_SEQ: i32 = 1001;
    pub const PULL_MSG_BY_SEQ_LIST: i32 = 1002;
    pub const SEND_MSG: i32 = 1003;
    pub const PULL_MSG_BY_SEQ_RANGE: i32 = 1004;
    pub const PUSH_MSG: i32 = 2001;
    pub const KICK_ONLINE_MSG: i32 = 2002;
    pub const LOGOUT: i32 = 2003;
    pub const DATA_ERROR: i32 = 3001;
}

/// Request kinds a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetNewestSeq,
    PullMsgBySeqList,
    SendMsg,
    PullMsgBySeqRange,
    Logout,
    /// Keeps an otherwise quiet connection inside the read idle timeout
    Heartbeat,
}

impl RequestKind {
    pub const ALL: [RequestKind; 6] = [
        RequestKind::GetNewestSeq,
        RequestKind::PullMsgBySeqList,
        RequestKind::SendMsg,
        RequestKind::PullMsgBySeqRange,
        RequestKind::Logout,
        RequestKind::Heartbeat,
    ];

    pub fn id(self) -> i32 {
        match self {
            RequestKind::GetNewestSeq => req_id::GET_NEWEST_SEQ,
            RequestKind::PullMsgBySeqList => req_id::PULL_MSG_BY_SEQ_LIST,
            RequestKind::SendMsg => req_id::SEND_MSG,
            RequestKind::PullMsgBySeqRange => req_id::PULL_MSG_BY_SEQ_RANGE,
            RequestKind::Logout => req_id::LOGOUT,
            RequestKind::Heartbeat => req_id::HEARTBEAT,
        }
    }
}

impl TryFrom<i32> for RequestKind {
    type Error = ImError;

    fn try_from(id: i32) -> Result<Self> {
        RequestKind::ALL
            .into_iter()
            .find(|k| k.id() == id)
            .ok_or_else(|| ImError::Args(format!("unknown reqIdentifier {id}")))
    }
}

/// Inbound request envelope.
///
/// Missing fields decode to their defaults so that structural validation,
/// not decoding, reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Req {
    #[serde(rename = "reqIdentifier")]
    pub req_identifier: i32,
    pub token: String,
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(rename = "msgIncr")]
    pub msg_incr: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Req {
    pub fn new(kind: RequestKind, send_id: impl Into<String>, msg_incr: impl Into<String>) -> Self {
        Self {
            req_identifier: kind.id(),
            send_id: send_id.into(),
            operation_id: uuid::Uuid::new_v4().to_string(),
            msg_incr: msg_incr.into(),
            ..Self::default()
        }
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self> {
        self.data = serde_json::to_vec(data)?;
        Ok(self)
    }

    /// Required-field check; returns the dispatchable kind.
    pub fn validate(&self) -> Result<RequestKind> {
        if self.req_identifier == 0 {
            return Err(ImError::Args("reqIdentifier is required".into()));
        }
        if self.send_id.is_empty() {
            return Err(ImError::Args("sendID is required".into()));
        }
        if self.operation_id.is_empty() {
            return Err(ImError::Args("operationID is required".into()));
        }
        if self.msg_incr.is_empty() {
            return Err(ImError::Args("msgIncr is required".into()));
        }
        RequestKind::try_from(self.req_identifier)
    }

    /// Decode the kind-specific payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| ImError::Args(format!("bad data: {e}")))
    }
}

/// Reply envelope; mirrors the request's identifier and counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resp {
    #[serde(rename = "reqIdentifier")]
    pub req_identifier: i32,
    #[serde(rename = "msgIncr")]
    pub msg_incr: String,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Resp {
    pub fn ok(req: &Req, data: Vec<u8>) -> Self {
        Self {
            req_identifier: req.req_identifier,
            msg_incr: req.msg_incr.clone(),
            operation_id: req.operation_id.clone(),
            err_code: code::NONE,
            err_msg: String::new(),
            data,
        }
    }

    pub fn error(req: &Req, err: &ImError) -> Self {
        Self {
            req_identifier: req.req_identifier,
            msg_incr: req.msg_incr.clone(),
            operation_id: req.operation_id.clone(),
            err_code: err.code(),
            err_msg: err.to_string(),
            data: Vec::new(),
        }
    }

    /// Server-initiated message delivery.
    pub fn push(operation_id: &str, data: Vec<u8>) -> Self {
        Self {
            req_identifier: req_id::PUSH_MSG,
            operation_id: operation_id.to_string(),
            data,
            ..Self::default()
        }
    }

    /// Notification written to a session right before it is forcibly closed.
    pub fn kick(operation_id: &str) -> Self {
        Self {
            req_identifier: req_id::KICK_ONLINE_MSG,
            operation_id: operation_id.to_string(),
            err_code: code::TOKEN_KICKED,
            err_msg: crate::error::TokenError::Kicked.to_string(),
            ..Self::default()
        }
    }

    /// Reply to an undecodable frame.
    pub fn data_error(msg: impl Into<String>) -> Self {
        Self {
            req_identifier: req_id::DATA_ERROR,
            err_code: code::ARGS,
            err_msg: msg.into(),
            ..Self::default()
        }
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Connection parameters supplied on the handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub token: String,
    pub send_id: String,
    pub platform: Platform,
    pub operation_id: String,
}

impl HandshakeParams {
    /// Parse `token=..&sendID=..&platformID=..[&operationID=..]`.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ImError::Args("handshake is not utf-8".into()))?;
        let line = line.trim_end_matches(['\r', '\n']).trim_start_matches('?');

        let (mut token, mut send_id, mut platform, mut operation_id) = (None, None, None, None);
        for pair in line.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ImError::Args(format!("malformed parameter {pair:?}")))?;
            match k {
                "token" => token = Some(v.to_string()),
                "sendID" => send_id = Some(v.to_string()),
                "platformID" => platform = Some(v.to_string()),
                "operationID" => operation_id = Some(v.to_string()),
                _ => {}
            }
        }

        let missing = || ImError::Args("args err, need token, sendID, platformID".into());
        let token = token.filter(|t| !t.is_empty()).ok_or_else(missing)?;
        let send_id = send_id.filter(|s| !s.is_empty()).ok_or_else(missing)?;
        let platform = platform
            .ok_or_else(missing)?
            .parse::<i32>()
            .ok()
            .and_then(Platform::from_id)
            .ok_or_else(|| ImError::Args("platformID is not a known platform".into()))?;
        let operation_id = operation_id
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self { token, send_id, platform, operation_id })
    }

    pub fn to_line(&self) -> String {
        format!(
            "token={}&sendID={}&platformID={}&operationID={}\n",
            self.token,
            self.send_id,
            self.platform.id(),
            self.operation_id
        )
    }
}

/// Single frame answering the handshake line. HTTP-like status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub status: u16,
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
}

impl HandshakeReply {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const UNAVAILABLE: u16 = 503;

    pub fn accepted() -> Self {
        Self { status: Self::OK, err_code: code::NONE, err_msg: String::new() }
    }

    pub fn refused(err: &ImError) -> Self {
        let status = match err {
            ImError::Args(_) | ImError::Protocol(_) => Self::BAD_REQUEST,
            ImError::Token(_) | ImError::NoPermission(_) => Self::UNAUTHORIZED,
            _ => Self::UNAVAILABLE,
        };
        Self { status, err_code: err.code(), err_msg: err.to_string() }
    }
}

pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(body);
    out.freeze()
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(value)?;
    Ok(encode_frame(&body))
}

pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ImError::Protocol(e.to_string()))
}

/// Stream framer: extract one full frame body if present.
///
/// A declared length above `max_len` is unrecoverable for the stream.
pub fn try_extract_frame(buffer: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if buffer.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > max_len {
        return Err(ImError::Protocol(format!("frame of {len} bytes exceeds limit {max_len}")));
    }
    if buffer.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    buffer.advance(LEN_PREFIX);
    Ok(Some(buffer.split_to(len).freeze()))
}

/// Read until one frame is complete. `Ok(None)` on a clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_len: usize,
) -> Result<Option<Bytes>> {
    loop {
        if let Some(frame) = try_extract_frame(buffer, max_len)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buffer).await? == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(ImError::Protocol("connection closed mid-frame".into()));
        }
    }
}

/// Extract the handshake line (without its terminator) if fully buffered.
pub fn try_extract_line(buffer: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    match memchr::memchr(b'\n', buffer) {
        Some(pos) => {
            let line = buffer.split_to(pos + 1).freeze();
            Ok(Some(line.slice(..pos)))
        }
        None if buffer.len() > max_len => {
            Err(ImError::Protocol("handshake line too long".into()))
        }
        None => Ok(None),
    }
}

/// Serde adapter storing byte payloads as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_waits_for_complete_frame() {
        let frame = encode_frame(br#"{"a":1}"#);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..5]);
        assert!(try_extract_frame(&mut buf, 1024).unwrap().is_none());
        buf.extend_from_slice(&frame[5..]);
        buf.extend_from_slice(&encode_frame(b"{}"));
        let first = try_extract_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&first[..], br#"{"a":1}"#);
        let second = try_extract_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&second[..], b"{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn framer_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(10_000);
        assert!(matches!(try_extract_frame(&mut buf, 100), Err(ImError::Protocol(_))));
    }

    #[test]
    fn handshake_parses_and_requires_fields() {
        let p = HandshakeParams::parse(b"token=t1&sendID=u1&platformID=5&operationID=op\r").unwrap();
        assert_eq!(p.send_id, "u1");
        assert_eq!(p.platform, Platform::Web);
        assert_eq!(p.operation_id, "op");

        let p = HandshakeParams::parse(b"?sendID=u1&platformID=1&token=x").unwrap();
        assert!(!p.operation_id.is_empty());

        assert!(matches!(HandshakeParams::parse(b"sendID=u1&platformID=1"), Err(ImError::Args(_))));
        assert!(matches!(
            HandshakeParams::parse(b"token=t&sendID=u1&platformID=77"),
            Err(ImError::Args(_))
        ));
    }

    #[test]
    fn line_extraction() {
        let mut buf = BytesMut::from(&b"token=a&sendID=b"[..]);
        assert!(try_extract_line(&mut buf, 1024).unwrap().is_none());
        buf.extend_from_slice(b"&platformID=1\n\x00\x00");
        let line = try_extract_line(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&line[..], b"token=a&sendID=b&platformID=1");
        assert_eq!(&buf[..], b"\x00\x00");
    }

    #[test]
    fn missing_envelope_fields_fail_validation_not_decoding() {
        let req: Req = decode_json(br#"{"reqIdentifier":1001,"sendID":"u1"}"#).unwrap();
        assert!(matches!(req.validate(), Err(ImError::Args(_))));

        let req: Req = decode_json(
            br#"{"reqIdentifier":9999,"sendID":"u1","operationID":"o","msgIncr":"1"}"#,
        )
        .unwrap();
        assert!(matches!(req.validate(), Err(ImError::Args(_))));
    }

    #[test]
    fn reply_mirrors_request_counter() {
        let req = Req::new(RequestKind::GetNewestSeq, "u1", "42");
        let resp = Resp::error(&req, &ImError::Args("x".into()));
        assert_eq!(resp.msg_incr, "42");
        assert_eq!(resp.req_identifier, req_id::GET_NEWEST_SEQ);
        assert_eq!(resp.err_code, code::ARGS);
    }

    #[test]
    fn data_is_base64_on_the_wire() {
        let req = Req { data: b"hi".to_vec(), ..Req::default() };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""data":"aGk=""#));
        let back: Req = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, b"hi");
    }
}
