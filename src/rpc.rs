//! Request/response RPC over the frame codec, shared by the relay and the
//! token control service.
//!
//! Each TCP connection carries exactly one request frame and one response
//! frame. The response is either the reply or a coded error that
//! [`ImError::from_code`] turns back into the caller's error type.

use async_trait::async_trait;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{ImError, Result};
use crate::protocol;

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body")]
pub enum RpcResponse<T> {
    Ok(T),
    Err { code: i32, msg: String },
}

impl<T> RpcResponse<T> {
    pub fn error(err: &ImError) -> Self {
        RpcResponse::Err { code: err.code(), msg: err.to_string() }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            RpcResponse::Ok(reply) => Ok(reply),
            RpcResponse::Err { code, msg } => Err(ImError::from_code(code, msg)),
        }
    }
}

/// Server side of one RPC protocol.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Reply: Serialize + Send;

    /// Name used in logs
    const NAME: &'static str;

    async fn handle(&self, req: Self::Request) -> RpcResponse<Self::Reply>;
}

/// TCP listener serving one [`RpcService`].
pub struct RpcServer<S> {
    listener: TcpListener,
    service: Arc<S>,
    max_frame_len: usize,
}

impl<S: RpcService> RpcServer<S> {
    pub async fn bind(addr: SocketAddr, service: Arc<S>, max_frame_len: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, service, max_frame_len })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, service = S::NAME, "rpc server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(service = S::NAME, error = %e, "rpc accept failed");
                    continue;
                }
            };
            let service = Arc::clone(&self.service);
            let max = self.max_frame_len;
            tokio::spawn(async move {
                if let Err(e) = serve_one(stream, service, max).await {
                    tracing::debug!(%peer, service = S::NAME, error = %e, "rpc call failed");
                }
            });
        }
    }
}

async fn serve_one<S: RpcService>(stream: TcpStream, service: Arc<S>, max_frame_len: usize) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let Some(frame) = protocol::read_frame(&mut reader, &mut buf, max_frame_len).await? else {
        return Ok(());
    };
    let resp = match protocol::decode_json::<S::Request>(&frame) {
        Ok(req) => service.handle(req).await,
        Err(e) => RpcResponse::error(&e),
    };
    writer.write_all(&protocol::encode_json(&resp)?).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Client side: connect, send `req`, read the single response.
pub async fn call<Q, R>(addr: &str, req: &Q, max_frame_len: usize) -> Result<R>
where
    Q: Serialize + Sync,
    R: DeserializeOwned,
{
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ImError::Unavailable(format!("{addr}: {e}")))?;
    let (mut reader, mut writer) = stream.into_split();
    writer.write_all(&protocol::encode_json(req)?).await?;
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let frame = protocol::read_frame(&mut reader, &mut buf, max_frame_len)
        .await?
        .ok_or_else(|| ImError::Unavailable(format!("{addr} closed without replying")))?;
    protocol::decode_json::<RpcResponse<R>>(&frame)?.into_result()
}
