use crate::config::GatewayConfig;
use crate::error::{ImError, Result, TokenError};
use crate::handler::{HandlerOutcome, Handlers};
use crate::protocol::{self, HandshakeParams, HandshakeReply, Req, Resp};
use crate::registry::ConnRegistry;
use crate::session::{ConnHandle, DisconnectReason, SessionKey, StreamWriter};
use crate::token::TokenManager;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

/// Shared state of one gateway instance.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub registry: Arc<ConnRegistry>,
    pub tokens: Arc<TokenManager>,
    pub handlers: Handlers,
    next_conn_id: AtomicU64,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig, registry: Arc<ConnRegistry>, tokens: Arc<TokenManager>, handlers: Handlers) -> Self {
        Self { config, registry, tokens, handlers, next_conn_id: AtomicU64::new(0) }
    }
}

/// Client-facing listener.
pub struct Gateway {
    listener: TcpListener,
    ctx: Arc<GatewayContext>,
}

impl Gateway {
    pub async fn bind(ctx: Arc<GatewayContext>) -> Result<Self> {
        let listener = TcpListener::bind(ctx.config.client_bind_address).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "gateway listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                serve_connection(ctx, stream, peer).await;
            });
        }
    }
}

/// Read the handshake line, bounded by the handshake timeout.
async fn read_handshake(reader: &mut OwnedReadHalf, buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    loop {
        if let Some(line) = protocol::try_extract_line(buf, max_len)? {
            return Ok(Some(line));
        }
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn serve_connection(ctx: Arc<GatewayContext>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();
    let max_len = ctx.config.max_frame_len;
    let mut buf = BytesMut::with_capacity(16 * 1024);

    let line = match time::timeout(ctx.config.handshake_timeout(), read_handshake(&mut reader, &mut buf, max_len)).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            refuse(&mut writer, &e, peer).await;
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, reason = ?DisconnectReason::Timeout, "handshake not completed in time");
            return;
        }
    };

    let params = match accept(&ctx, &line).await {
        Ok(p) => p,
        Err(e) => {
            refuse(&mut writer, &e, peer).await;
            return;
        }
    };
    let key = SessionKey::new(params.send_id.clone(), params.platform);
    let conn_id = ctx.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let conn = Arc::new(
        ConnHandle::new(conn_id, key, Box::new(StreamWriter(writer)), ctx.config.write_timeout())
            .with_token(params.token.clone()),
    );
    tracing::info!(
        operation_id = %params.operation_id,
        user_id = %params.send_id,
        platform = %params.platform,
        platform_class = ?params.platform.class(),
        conn_id,
        %peer,
        "connection accepted"
    );
    // Registered before the client sees 200, so an accepted client is reachable.
    ctx.registry.add(Arc::clone(&conn));
    if let Err(e) = conn.send_json(&HandshakeReply::accepted()).await {
        tracing::debug!(conn_id, error = %e, "handshake reply not delivered");
        ctx.registry.remove(&conn, DisconnectReason::PeerClosed).await;
        return;
    }

    let reason = read_loop(&ctx, &conn, &params.token, reader, buf).await;
    ctx.registry.remove(&conn, reason).await;
}

/// Parse and authenticate the handshake.
async fn accept(ctx: &GatewayContext, line: &[u8]) -> Result<HandshakeParams> {
    let params = HandshakeParams::parse(line)?;
    if ctx.registry.online_count() >= ctx.config.max_connections {
        return Err(ImError::Unavailable("too many connections".into()));
    }
    let key = SessionKey::new(params.send_id.clone(), params.platform);
    ctx.tokens.validate_for(&params.token, &key).await?;
    Ok(params)
}

async fn refuse(writer: &mut tokio::net::tcp::OwnedWriteHalf, err: &ImError, peer: SocketAddr) {
    tracing::info!(%peer, error = %err, "handshake refused");
    if let Ok(frame) = protocol::encode_json(&HandshakeReply::refused(err)) {
        let _ = writer.write_all(&frame).await;
    }
    let _ = writer.shutdown().await;
}

/// One connection's read loop. Frames are read strictly in order; each
/// request is then handled on its own task.
///
/// A connection that sends nothing within the read idle timeout is treated
/// as dead, so a half-open peer does not stay registered as reachable.
async fn read_loop(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<ConnHandle>,
    handshake_token: &str,
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
) -> DisconnectReason {
    let max_len = ctx.config.max_frame_len;
    let idle = ctx.config.read_idle_timeout();
    loop {
        loop {
            let frame = match protocol::try_extract_frame(&mut buf, max_len) {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    reject_frame(conn, &e).await;
                    return DisconnectReason::ProtocolError;
                }
            };
            let req: Req = match protocol::decode_json(&frame) {
                Ok(r) => r,
                Err(e) => {
                    reject_frame(conn, &e).await;
                    return DisconnectReason::ProtocolError;
                }
            };
            tracing::debug!(conn_id = conn.id(), operation_id = %req.operation_id, req = req.req_identifier, msg_incr = %req.msg_incr, "frame received");
            let ctx = Arc::clone(ctx);
            let conn = Arc::clone(conn);
            let token = if req.token.is_empty() { handshake_token.to_string() } else { req.token.clone() };
            tokio::spawn(async move { handle_request(ctx, conn, token, req).await });
        }

        tokio::select! {
            _ = conn.closed() => return conn.close_reason().unwrap_or(DisconnectReason::Unknown),
            res = time::timeout(idle, reader.read_buf(&mut buf)) => match res {
                Err(_) => {
                    tracing::info!(conn_id = conn.id(), user_id = %conn.key().user_id, idle_ms = idle.as_millis() as u64, "connection idle, closing");
                    return DisconnectReason::Timeout;
                }
                Ok(Ok(0)) => return DisconnectReason::PeerClosed,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(conn_id = conn.id(), error = %e, "read failed");
                    return DisconnectReason::PeerClosed;
                }
            },
        }
    }
}

/// Best-effort error reply for an undecodable frame; the caller closes.
async fn reject_frame(conn: &ConnHandle, err: &ImError) {
    tracing::warn!(conn_id = conn.id(), user_id = %conn.key().user_id, error = %err, "undecodable frame, closing");
    if let Err(e) = conn.send_json(&Resp::data_error(err.to_string())).await {
        tracing::debug!(conn_id = conn.id(), error = %e, "data error reply not delivered");
    }
}

async fn handle_request(ctx: Arc<GatewayContext>, conn: Arc<ConnHandle>, token: String, req: Req) {
    let operation_id = req.operation_id.clone();
    let outcome = match authorize(&ctx, &conn, &token, &req).await {
        Ok(kind) => ctx.handlers.dispatch(kind, &req, conn.key()).await,
        Err(e) => Err(e),
    };
    let (resp, close) = match outcome {
        Ok(HandlerOutcome::Reply(data)) => (Resp::ok(&req, data), false),
        Ok(HandlerOutcome::ReplyAndClose(data)) => (Resp::ok(&req, data), true),
        Err(e) => {
            match &e {
                ImError::Args(_) | ImError::NoPermission(_) => {
                    tracing::debug!(%operation_id, error = %e, "request rejected")
                }
                ImError::Token(_) => tracing::warn!(%operation_id, conn_id = conn.id(), error = %e, "request token rejected"),
                _ => tracing::error!(%operation_id, error = %e, "request failed"),
            }
            (Resp::error(&req, &e), false)
        }
    };
    if let Err(e) = conn.send_json(&resp).await {
        tracing::debug!(%operation_id, conn_id = conn.id(), error = %e, "reply not delivered");
    }
    if close {
        ctx.registry.remove(&conn, DisconnectReason::Logout).await;
    }
}

/// Structural check, then per-message token check.
async fn authorize(ctx: &GatewayContext, conn: &ConnHandle, token: &str, req: &Req) -> Result<crate::protocol::RequestKind> {
    let kind = req.validate()?;
    if req.send_id != conn.key().user_id {
        return Err(TokenError::DifferentUserId.into());
    }
    ctx.tokens.validate_for(token, conn.key()).await?;
    Ok(kind)
}
