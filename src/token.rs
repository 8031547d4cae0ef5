//! Session tokens: signing, verification and the authoritative token record.
//!
//! A token is an HS256 JWT naming a user and a platform. Verifying the
//! signature is not enough: the token must also be recorded as `Normal` in the
//! [`TokenStore`] under its session key. Issuing a new token or kicking a
//! session rewrites that record, which is what makes a kick stick everywhere.

use async_trait::async_trait;
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::RelayFanout;
use crate::config::{AdminList, MultiLoginPolicy, TokenPolicy};
use crate::error::{ImError, Result, TokenError};
use crate::platform::Platform;
use crate::session::SessionKey;

/// Claims carried by every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "UID")]
    pub user_id: String,
    #[serde(rename = "PlatformID")]
    pub platform: Platform,
    pub jti: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
}

impl Claims {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.platform)
    }
}

/// State of one token inside a session's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Normal,
    Kicked,
}

/// One step of an atomic update to a session's token record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMutation {
    Set { token: String, status: TokenStatus },
    Delete { tokens: Vec<String> },
    /// Every token in the record becomes `Kicked`
    KickAll,
}

/// Admin tools share one identity, so this many admin tokens stay valid at once.
pub const MAX_ADMIN_TOKENS: usize = 30;

/// How a new token treats the tokens already recorded for its key.
pub struct IssuePlan<'a> {
    pub policy: MultiLoginPolicy,
    /// False for a recorded token that no longer verifies; such entries are dropped
    pub still_valid: &'a (dyn Fn(&str) -> bool + Send + Sync),
}

impl IssuePlan<'_> {
    /// Rewrite `record` for a new login on `platform` and return how many
    /// tokens were kicked.
    ///
    /// Entries that are not `Normal` or no longer verify are dropped. The
    /// remaining ones are kicked if the policy says so, except that up to
    /// [`MAX_ADMIN_TOKENS`] admin tokens survive.
    pub fn apply_to(&self, record: &mut HashMap<String, TokenStatus>, platform: Platform, token: &str) -> usize {
        record.retain(|t, status| *status == TokenStatus::Normal && (self.still_valid)(t));
        let mut kicked: Vec<String> = if self.policy.kicks(platform, platform) {
            record.keys().cloned().collect()
        } else {
            Vec::new()
        };
        if platform == Platform::Admin {
            let keep = kicked.len().min(MAX_ADMIN_TOKENS - 1);
            kicked.truncate(kicked.len() - keep);
        }
        for t in &kicked {
            record.insert(t.clone(), TokenStatus::Kicked);
        }
        record.insert(token.to_string(), TokenStatus::Normal);
        kicked.len()
    }
}

/// Shared store of token records, one per session key.
///
/// `apply` and `issue` must each run as a single atomic step per key; a
/// shared backend needs a transaction or server-side script for them.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_tokens(&self, key: &SessionKey) -> Result<HashMap<String, TokenStatus>>;
    async fn apply(&self, key: &SessionKey, mutations: Vec<TokenMutation>) -> Result<()>;
    /// Record `token` as a `Normal` token of `key` and settle the older
    /// entries per `plan` in the same step. Returns how many were kicked.
    async fn issue(&self, key: &SessionKey, token: &str, plan: IssuePlan<'_>) -> Result<usize>;
}

/// In-process [`TokenStore`].
#[derive(Default)]
pub struct MemoryTokenStore {
    records: Mutex<HashMap<SessionKey, HashMap<String, TokenStatus>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SessionKey, HashMap<String, TokenStatus>>>> {
        self.records.lock().map_err(|_| ImError::Internal("token store poisoned".into()))
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get_tokens(&self, key: &SessionKey) -> Result<HashMap<String, TokenStatus>> {
        Ok(self.lock()?.get(key).cloned().unwrap_or_default())
    }

    async fn apply(&self, key: &SessionKey, mutations: Vec<TokenMutation>) -> Result<()> {
        let mut records = self.lock()?;
        let record = records.entry(key.clone()).or_default();
        for m in mutations {
            match m {
                TokenMutation::Set { token, status } => {
                    record.insert(token, status);
                }
                TokenMutation::Delete { tokens } => {
                    for t in tokens {
                        record.remove(&t);
                    }
                }
                TokenMutation::KickAll => {
                    for status in record.values_mut() {
                        *status = TokenStatus::Kicked;
                    }
                }
            }
        }
        if record.is_empty() {
            records.remove(key);
        }
        Ok(())
    }

    async fn issue(&self, key: &SessionKey, token: &str, plan: IssuePlan<'_>) -> Result<usize> {
        let mut records = self.lock()?;
        let record = records.entry(key.clone()).or_default();
        Ok(plan.apply_to(record, key.platform, token))
    }
}

/// A freshly issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    /// Seconds until expiry
    #[serde(rename = "expireTimeSeconds")]
    pub expire_time_seconds: i64,
}

fn map_jwt_error(e: &jsonwebtoken::errors::Error) -> TokenError {
    match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotValidYet,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            TokenError::Malformed
        }
        _ => TokenError::Unknown,
    }
}

/// Issues, verifies and revokes session tokens.
pub struct TokenManager {
    policy: TokenPolicy,
    admins: AdminList,
    store: Arc<dyn TokenStore>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    fanout: Option<Arc<RelayFanout>>,
}

impl TokenManager {
    pub fn new(policy: TokenPolicy, admins: AdminList, store: Arc<dyn TokenStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(policy.secret.as_bytes()),
            decoding: DecodingKey::from_secret(policy.secret.as_bytes()),
            policy,
            admins,
            store,
            validation,
            fanout: None,
        }
    }

    /// Broadcast kicks through `fanout` on force-logout.
    pub fn with_fanout(mut self, fanout: Arc<RelayFanout>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn admins(&self) -> &AdminList {
        &self.admins
    }

    /// Sign a token for `(user_id, platform)` and make it the session's
    /// authoritative one.
    pub async fn issue_token(&self, user_id: &str, platform: Platform) -> Result<IssuedToken> {
        if user_id.is_empty() {
            return Err(ImError::Args("userID is required".into()));
        }
        let now = chrono::Utc::now().timestamp();
        let ttl = self.policy.expire_days * 24 * 60 * 60;
        let claims = Claims {
            user_id: user_id.to_string(),
            platform,
            jti: uuid::Uuid::new_v4().to_string(),
            exp: now + ttl,
            nbf: now - self.policy.not_before_skew_secs,
            iat: now,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ImError::Internal(format!("sign token: {e}")))?;

        let still_valid = |t: &str| self.parse(t).is_ok();
        let plan = IssuePlan { policy: self.policy.multi_login, still_valid: &still_valid };
        let kicked = self.store.issue(&claims.session_key(), &token, plan).await?;

        tracing::info!(user_id, platform = %platform, kicked, "token issued");
        Ok(IssuedToken { token, expire_time_seconds: ttl })
    }

    /// Verify signature and time claims only.
    pub fn parse(&self, token: &str) -> std::result::Result<Claims, TokenError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| map_jwt_error(&e))
    }

    /// Verify a token and check that it is still its session's authoritative one.
    ///
    /// Store failures reject the token.
    pub async fn validate_token(&self, token: &str) -> Result<Claims> {
        let claims = self.parse(token)?;
        let record = match self.store.get_tokens(&claims.session_key()).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(user_id = %claims.user_id, error = %e, "token store lookup failed");
                return Err(TokenError::Unknown.into());
            }
        };
        if record.is_empty() {
            return Err(TokenError::NotExist.into());
        }
        match record.get(token) {
            Some(TokenStatus::Normal) => Ok(claims),
            Some(TokenStatus::Kicked) => Err(TokenError::Kicked.into()),
            None => Err(TokenError::NotExist.into()),
        }
    }

    /// [`validate_token`](Self::validate_token) plus a check that the token
    /// belongs to `expected`.
    pub async fn validate_for(&self, token: &str, expected: &SessionKey) -> Result<Claims> {
        let claims = self.validate_token(token).await?;
        if claims.user_id != expected.user_id {
            return Err(TokenError::DifferentUserId.into());
        }
        if claims.platform != expected.platform {
            return Err(TokenError::DifferentPlatformId.into());
        }
        Ok(claims)
    }

    /// Flag every token of `key` as kicked.
    pub async fn set_kicked(&self, key: &SessionKey) -> Result<()> {
        self.store.apply(key, vec![TokenMutation::KickAll]).await
    }

    /// Privileged: invalidate the session's tokens, then kick its socket on
    /// every gateway instance.
    ///
    /// The store update is what makes the logout authoritative; a failed
    /// broadcast is only logged.
    pub async fn force_logout(&self, caller: &str, user_id: &str, platform: Platform, operation_id: &str) -> Result<()> {
        self.admins.check(caller, "force logout")?;
        let key = SessionKey::new(user_id, platform);
        self.set_kicked(&key).await?;
        tracing::info!(operation_id, user_id, platform = %platform, "force logout");
        if let Some(fanout) = &self.fanout {
            if let Err(e) = fanout.kick_offline(&key, operation_id).await {
                tracing::warn!(operation_id, user_id, error = %e, "kick broadcast failed");
            }
        }
        Ok(())
    }
}
