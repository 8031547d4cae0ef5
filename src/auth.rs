//! Token control RPC: how processes outside the gateway obtain and revoke
//! session tokens.
//!
//! An admin first trades the shared admin secret for an admin token, then
//! presents that token on `IssueToken` and `ForceLogout`. `ParseToken` is
//! open to anyone holding a token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{AdminList, GatewayConfig};
use crate::error::{ImError, Result};
use crate::platform::Platform;
use crate::rpc::{RpcResponse, RpcServer, RpcService};
use crate::token::{IssuedToken, TokenManager};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAdminTokenReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    pub secret: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTokenReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    /// Admin token of the caller
    pub token: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "platformID")]
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceLogoutReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    /// Admin token of the caller
    pub token: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "platformID")]
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseTokenReq {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedToken {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "platformID")]
    pub platform: Platform,
    /// Unix seconds
    #[serde(rename = "expireTime")]
    pub expire_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum AuthRequest {
    GetAdminToken(GetAdminTokenReq),
    IssueToken(IssueTokenReq),
    ForceLogout(ForceLogoutReq),
    ParseToken(ParseTokenReq),
}

impl AuthRequest {
    pub fn operation_id(&self) -> &str {
        match self {
            AuthRequest::GetAdminToken(r) => &r.operation_id,
            AuthRequest::IssueToken(r) => &r.operation_id,
            AuthRequest::ForceLogout(r) => &r.operation_id,
            AuthRequest::ParseToken(r) => &r.operation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "result")]
pub enum AuthReply {
    GetAdminToken(IssuedToken),
    IssueToken(IssuedToken),
    ForceLogout,
    ParseToken(ParsedToken),
}

pub type AuthResponse = RpcResponse<AuthReply>;

/// Serves [`AuthService`] over TCP.
pub type AuthServer = RpcServer<AuthService>;

/// Session/token control on top of [`TokenManager`].
pub struct AuthService {
    tokens: Arc<TokenManager>,
    admins: AdminList,
    admin_secret: String,
}

impl AuthService {
    pub fn new(config: &GatewayConfig, tokens: Arc<TokenManager>) -> Self {
        Self { tokens, admins: config.admin_user_ids.clone(), admin_secret: config.admin_secret.clone() }
    }

    pub async fn get_admin_token(&self, req: &GetAdminTokenReq) -> Result<IssuedToken> {
        if self.admin_secret.is_empty() || req.secret != self.admin_secret {
            return Err(ImError::NoPermission("admin secret invalid".into()));
        }
        if !self.admins.contains(&req.user_id) {
            return Err(ImError::Args(format!("{} is not an admin user", req.user_id)));
        }
        self.tokens.issue_token(&req.user_id, Platform::Admin).await
    }

    /// The admin behind `token`, which must be a live admin-platform token.
    async fn admin_caller(&self, token: &str, action: &str) -> Result<String> {
        let claims = self.tokens.validate_token(token).await?;
        if claims.platform != Platform::Admin {
            return Err(ImError::NoPermission(format!("{} may not {action} without an admin token", claims.user_id)));
        }
        self.admins.check(&claims.user_id, action)?;
        Ok(claims.user_id)
    }

    pub async fn issue_token(&self, req: &IssueTokenReq) -> Result<IssuedToken> {
        let caller = self.admin_caller(&req.token, "issue tokens").await?;
        if req.platform == Platform::Admin || self.admins.contains(&req.user_id) {
            return Err(ImError::NoPermission("admin tokens come from GetAdminToken".into()));
        }
        let issued = self.tokens.issue_token(&req.user_id, req.platform).await?;
        tracing::info!(operation_id = %req.operation_id, caller, user_id = %req.user_id, platform = %req.platform, "token issued for user");
        Ok(issued)
    }

    pub async fn force_logout(&self, req: &ForceLogoutReq) -> Result<()> {
        let caller = self.admin_caller(&req.token, "force logout").await?;
        self.tokens.force_logout(&caller, &req.user_id, req.platform, &req.operation_id).await
    }

    pub async fn parse_token(&self, req: &ParseTokenReq) -> Result<ParsedToken> {
        let claims = self.tokens.validate_token(&req.token).await?;
        Ok(ParsedToken { user_id: claims.user_id, platform: claims.platform, expire_time: claims.exp })
    }
}

#[async_trait]
impl RpcService for AuthService {
    type Request = AuthRequest;
    type Reply = AuthReply;
    const NAME: &'static str = "auth";

    async fn handle(&self, req: AuthRequest) -> AuthResponse {
        let result = match &req {
            AuthRequest::GetAdminToken(r) => self.get_admin_token(r).await.map(AuthReply::GetAdminToken),
            AuthRequest::IssueToken(r) => self.issue_token(r).await.map(AuthReply::IssueToken),
            AuthRequest::ForceLogout(r) => self.force_logout(r).await.map(|()| AuthReply::ForceLogout),
            AuthRequest::ParseToken(r) => self.parse_token(r).await.map(AuthReply::ParseToken),
        };
        match result {
            Ok(reply) => AuthResponse::Ok(reply),
            Err(e) => {
                tracing::warn!(operation_id = req.operation_id(), error = %e, "auth request failed");
                AuthResponse::error(&e)
            }
        }
    }
}
