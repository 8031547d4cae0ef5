//! Connection registry: which live connection belongs to which session key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::MultiLoginPolicy;
use crate::platform::Platform;
use crate::protocol::{self, Resp};
use crate::session::{ConnHandle, DisconnectReason, SessionKey};

#[derive(Default)]
struct Maps {
    by_user: HashMap<String, HashMap<Platform, Arc<ConnHandle>>>,
    by_conn: HashMap<u64, SessionKey>,
}

/// Per-instance map between session keys and live connections.
///
/// Both directions are updated together under one lock.
#[derive(Default)]
pub struct ConnRegistry {
    inner: Mutex<Maps>,
    policy: MultiLoginPolicy,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose `add` also evicts the user's other platforms that
    /// `policy` kicks.
    pub fn with_policy(policy: MultiLoginPolicy) -> Self {
        Self { inner: Mutex::default(), policy }
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        // A poisoned lock still holds consistent maps: every update below is
        // completed before any call that could panic.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Install `handle`, evicting any handle already holding its key and any
    /// of the user's other platforms the multi-login policy kicks.
    ///
    /// Evicted handles are flagged closed at once; their transports are torn
    /// down on a separate task so a stalled peer cannot hold up the caller.
    /// They get a kick notice unless they hold the new handle's token, which
    /// is a reconnect rather than a new login.
    pub fn add(&self, handle: Arc<ConnHandle>) {
        let key = handle.key().clone();
        let evicted = {
            let mut maps = self.lock();
            let Maps { by_user, by_conn } = &mut *maps;
            let platforms = by_user.entry(key.user_id.clone()).or_default();
            let kicked: Vec<Platform> = platforms
                .keys()
                .copied()
                .filter(|p| *p != key.platform && self.policy.kicks(key.platform, *p))
                .collect();
            let mut evicted: Vec<Arc<ConnHandle>> = kicked.iter().filter_map(|p| platforms.remove(p)).collect();
            evicted.extend(
                platforms
                    .insert(key.platform, Arc::clone(&handle))
                    .filter(|old| old.id() != handle.id()),
            );
            for old in &evicted {
                by_conn.remove(&old.id());
                old.mark_closed(DisconnectReason::Evicted);
            }
            by_conn.insert(handle.id(), key.clone());
            evicted
        };
        tracing::info!(user_id = %key.user_id, platform = %key.platform, conn_id = handle.id(), "connection registered");

        for old in evicted {
            let reconnect = !old.token().is_empty() && old.token() == handle.token();
            tracing::info!(
                user_id = %key.user_id,
                platform = %old.key().platform,
                conn_id = old.id(),
                reconnect,
                "evicting previous connection"
            );
            let notice = if reconnect {
                None
            } else {
                protocol::encode_json(&Resp::kick(&uuid::Uuid::new_v4().to_string())).ok()
            };
            tokio::spawn(async move { old.finish(notice.as_deref()).await });
        }
    }

    /// Drop `handle` if it is still registered, then close it.
    ///
    /// Returns whether it was registered.
    pub async fn remove(&self, handle: &ConnHandle, reason: DisconnectReason) -> bool {
        let removed = {
            let mut maps = self.lock();
            match maps.by_conn.remove(&handle.id()) {
                Some(key) => {
                    if let Some(platforms) = maps.by_user.get_mut(&key.user_id) {
                        platforms.remove(&key.platform);
                        if platforms.is_empty() {
                            maps.by_user.remove(&key.user_id);
                        }
                    }
                    true
                }
                None => false,
            }
        };
        handle.close(reason).await;
        removed
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<ConnHandle>> {
        self.lock()
            .by_user
            .get(&key.user_id)
            .and_then(|p| p.get(&key.platform))
            .cloned()
    }

    /// Every live platform of `user_id` on this instance.
    pub fn get_all(&self, user_id: &str) -> HashMap<Platform, Arc<ConnHandle>> {
        self.lock().by_user.get(user_id).cloned().unwrap_or_default()
    }

    /// Number of live connections.
    pub fn online_count(&self) -> usize {
        self.lock().by_conn.len()
    }

    /// Number of users with at least one live connection.
    pub fn online_user_count(&self) -> usize {
        self.lock().by_user.len()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let maps = self.lock();
        let forward: usize = maps.by_user.values().map(HashMap::len).sum();
        assert_eq!(forward, maps.by_conn.len());
        for (id, key) in &maps.by_conn {
            let h = &maps.by_user[&key.user_id][&key.platform];
            assert_eq!(h.id(), *id);
            assert_eq!(h.key(), key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use crate::session::test_support::{handle, settled, stalled_handle, RecordingWriter};
    use bytes::BytesMut;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn tokened(id: u64, user: &str, platform: Platform, token: &str) -> (Arc<ConnHandle>, RecordingWriter) {
        let w = RecordingWriter::default();
        let h = ConnHandle::new(id, SessionKey::new(user, platform), Box::new(w.clone()), Duration::from_secs(1))
            .with_token(token);
        (Arc::new(h), w)
    }

    fn frames_of(w: &RecordingWriter) -> Vec<Resp> {
        w.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| {
                let mut buf = BytesMut::from(&f[..]);
                let body = protocol::try_extract_frame(&mut buf, 1 << 20).unwrap().unwrap();
                protocol::decode_json(&body).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn add_evicts_and_closes_previous_handle_once() {
        let reg = ConnRegistry::new();
        let (h1, w1) = handle(1, "u1", Platform::Web);
        let (h2, _w2) = handle(2, "u1", Platform::Web);
        let (h3, w3) = handle(3, "u1", Platform::Web);

        reg.add(h1.clone());
        reg.add(h2.clone());
        assert!(h1.is_closed());
        assert_eq!(h1.close_reason(), Some(DisconnectReason::Evicted));
        assert!(!h2.is_closed());
        reg.add(h3.clone());
        assert!(h2.is_closed());
        reg.assert_consistent();

        assert_eq!(reg.get(&SessionKey::new("u1", Platform::Web)).unwrap().id(), 3);
        assert_eq!(reg.online_count(), 1);
        assert!(settled(|| w1.shutdowns.load(Ordering::SeqCst) == 1).await);

        // The evicted reader loop's remove must not drop the new handle.
        assert!(!reg.remove(&h1, DisconnectReason::Evicted).await);
        assert_eq!(w1.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!h3.is_closed());
        assert_eq!(w3.shutdowns.load(Ordering::SeqCst), 0);
        reg.assert_consistent();
    }

    #[tokio::test]
    async fn stalled_old_connection_does_not_block_add() {
        let reg = Arc::new(ConnRegistry::new());
        let (old, old_writer) = stalled_handle(1, "u1", Platform::Ios, Duration::from_secs(60));
        reg.add(old.clone());

        // A push is stuck writing to the old socket and holds its write lock.
        let push = {
            let old = old.clone();
            tokio::spawn(async move { old.send(b"frame").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (new, _) = handle(2, "u1", Platform::Ios);
        let add = {
            let reg = reg.clone();
            let new = new.clone();
            tokio::spawn(async move { reg.add(new) })
        };
        tokio::time::timeout(Duration::from_millis(500), add).await.unwrap().unwrap();
        assert!(old.is_closed());
        assert_eq!(reg.get(&SessionKey::new("u1", Platform::Ios)).unwrap().id(), 2);
        assert_eq!(old_writer.shutdowns.load(Ordering::SeqCst), 0);
        push.abort();
    }

    #[tokio::test]
    async fn new_login_gets_kick_notice_but_reconnect_does_not() {
        let reg = ConnRegistry::new();
        let (first, w1) = tokened(1, "u1", Platform::Android, "t1");
        let (again, w2) = tokened(2, "u1", Platform::Android, "t1");
        let (other, _) = tokened(3, "u1", Platform::Android, "t2");

        reg.add(first);
        reg.add(again.clone());
        assert!(settled(|| w1.shutdowns.load(Ordering::SeqCst) == 1).await);
        assert!(frames_of(&w1).is_empty());

        reg.add(other);
        assert!(again.is_closed());
        assert!(settled(|| w2.shutdowns.load(Ordering::SeqCst) == 1).await);
        let frames = frames_of(&w2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].req_identifier, protocol::req_id::KICK_ONLINE_MSG);
        assert_eq!(frames[0].err_code, code::TOKEN_KICKED);
    }

    #[tokio::test]
    async fn policy_evicts_other_platforms() {
        let reg = ConnRegistry::with_policy(MultiLoginPolicy::AllLoginButSameClassKick);
        let (ios, _) = tokened(1, "u1", Platform::Ios, "a");
        let (web, _) = tokened(2, "u1", Platform::Web, "b");
        reg.add(ios.clone());
        reg.add(web.clone());
        reg.add(tokened(3, "u1", Platform::Android, "c").0);
        assert!(ios.is_closed());
        assert!(!web.is_closed());
        let mut live: Vec<Platform> = reg.get_all("u1").into_keys().collect();
        live.sort();
        assert_eq!(live, vec![Platform::Android, Platform::Web]);
        reg.assert_consistent();

        let reg = ConnRegistry::with_policy(MultiLoginPolicy::PCAndOther);
        let (mac, _) = tokened(1, "u1", Platform::MacOs, "a");
        let (ipad, _) = tokened(2, "u1", Platform::IPad, "b");
        reg.add(mac.clone());
        reg.add(ipad.clone());
        reg.add(tokened(3, "u1", Platform::Web, "c").0);
        assert!(!mac.is_closed());
        assert!(ipad.is_closed());
        assert_eq!(reg.online_count(), 2);
        reg.assert_consistent();

        let reg = ConnRegistry::new();
        reg.add(tokened(1, "u1", Platform::Ios, "a").0);
        reg.add(tokened(2, "u1", Platform::Android, "b").0);
        assert_eq!(reg.online_count(), 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg = ConnRegistry::new();
        let (h, w) = handle(7, "u2", Platform::Ios);
        reg.add(h.clone());
        assert!(reg.remove(&h, DisconnectReason::PeerClosed).await);
        assert!(!reg.remove(&h, DisconnectReason::PeerClosed).await);
        assert_eq!(w.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(reg.online_count(), 0);
        assert_eq!(reg.online_user_count(), 0);
        reg.assert_consistent();
    }

    #[tokio::test]
    async fn get_all_lists_every_platform() {
        let reg = ConnRegistry::new();
        reg.add(handle(1, "u1", Platform::Ios).0);
        reg.add(handle(2, "u1", Platform::Windows).0);
        reg.add(handle(3, "u2", Platform::Web).0);
        let all = reg.get_all("u1");
        assert_eq!(all.len(), 2);
        assert!(all.contains_key(&Platform::Windows));
        assert!(reg.get_all("nobody").is_empty());
        assert_eq!(reg.online_user_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_adds_leave_one_live_handle() {
        let reg = Arc::new(ConnRegistry::new());
        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        for id in 0..32 {
            let (h, _) = handle(id, "u1", Platform::Android);
            handles.push(h.clone());
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move { reg.add(h) }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(handles.iter().filter(|h| !h.is_closed()).count(), 1);
        let live = reg.get(&SessionKey::new("u1", Platform::Android)).unwrap();
        assert!(!live.is_closed());
        reg.assert_consistent();
    }
}
