use crate::error::{ImError, Result};
use crate::platform::Platform;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Duration};

/// Reasons why a client connection might be disconnected.
///
/// This enum categorizes the different conditions that can lead
/// to a connection termination for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote peer closed the connection
    PeerClosed,
    /// An undecodable frame was received
    ProtocolError,
    /// Handshake not completed in time, or the peer went quiet past the idle timeout
    Timeout,
    /// A newer connection took over the same session key
    Evicted,
    /// The session was kicked through the relay
    Kicked,
    /// The client asked to log out
    Logout,
    /// Disconnect reason is unknown or unspecified
    Unknown,
}

/// Identity of one allowed concurrent session: a user on a platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub user_id: String,
    pub platform: Platform,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, platform: Platform) -> Self {
        Self { user_id: user_id.into(), platform }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.platform)
    }
}

/// Write side of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one complete, already encoded frame.
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// [`FrameWriter`] over any tokio writer, e.g. the write half of a `TcpStream`.
pub struct StreamWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.0.write_all(frame).await?;
        self.0.flush().await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.0.shutdown().await
    }
}

/// One live client connection.
///
/// Writes are serialized by an exclusive lock so two frames are never
/// interleaved. Closing is idempotent and wakes the connection's read loop;
/// the first close decides the recorded reason.
pub struct ConnHandle {
    id: u64,
    key: SessionKey,
    /// Token presented on the handshake
    token: String,
    writer: Mutex<Box<dyn FrameWriter>>,
    reason: OnceLock<DisconnectReason>,
    shutdown: Notify,
    write_timeout: Duration,
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnHandle {
    pub fn new(id: u64, key: SessionKey, writer: Box<dyn FrameWriter>, write_timeout: Duration) -> Self {
        Self {
            id,
            key,
            token: String::new(),
            writer: Mutex::new(writer),
            reason: OnceLock::new(),
            shutdown: Notify::new(),
            write_timeout,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Why the handle was closed, once it is.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.reason.get().copied()
    }

    /// Write one frame under the write lock, bounded by the write timeout.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(ImError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        match time::timeout(self.write_timeout, writer.write_frame(frame)).await {
            Ok(res) => res.map_err(ImError::from),
            Err(_) => Err(ImError::Timeout(format!("write to conn {}", self.id))),
        }
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let frame = crate::protocol::encode_json(value)?;
        self.send(&frame).await
    }

    /// Flag the handle closed for `reason` and wake its read loop.
    ///
    /// Returns false if it was already closed.
    pub fn mark_closed(&self, reason: DisconnectReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            self.shutdown.notify_one();
        }
        first
    }

    /// Close the transport. A second close only logs.
    pub async fn close(&self, reason: DisconnectReason) {
        if !self.mark_closed(reason) {
            tracing::debug!(conn_id = self.id, ?reason, "close on already closed connection");
            return;
        }
        tracing::info!(conn_id = self.id, user_id = %self.key.user_id, platform = %self.key.platform, ?reason, "closing connection");
        self.finish(None).await;
    }

    /// Transport teardown for a handle already flagged closed: write `last`
    /// if given, then shut the writer down. Each step is bounded by the
    /// write timeout.
    pub(crate) async fn finish(&self, last: Option<&[u8]>) {
        let mut writer = self.writer.lock().await;
        if let Some(frame) = last {
            match time::timeout(self.write_timeout, writer.write_frame(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(conn_id = self.id, error = %e, "final frame not delivered"),
                Err(_) => tracing::debug!(conn_id = self.id, "final frame timed out"),
            }
        }
        match time::timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(conn_id = self.id, error = %e, "transport shutdown failed"),
            Err(_) => tracing::warn!(conn_id = self.id, "transport shutdown timed out"),
        }
    }

    /// Resolves once the handle has been closed.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn close_is_idempotent_and_wakes_reader() {
        let (h, w) = handle(1, "u1", Platform::Web);
        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.closed().await })
        };
        h.close(DisconnectReason::Kicked).await;
        h.close(DisconnectReason::Logout).await;
        waiter.await.unwrap();
        assert_eq!(w.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.close_reason(), Some(DisconnectReason::Kicked));
        assert!(matches!(h.send(b"x").await, Err(ImError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn stalled_write_times_out() {
        let (h, _) = stalled_handle(3, "u1", Platform::Web, Duration::from_millis(30));
        assert!(matches!(h.send(b"x").await, Err(ImError::Timeout(_))));
    }

    #[tokio::test]
    async fn send_reports_write_failure() {
        let h = failing_handle(2, "u1", Platform::Ios);
        assert!(matches!(h.send(b"x").await, Err(ImError::Io(_))));
    }
}
