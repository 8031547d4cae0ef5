mod common;

use common::{eventually, Cluster, ADMIN, ADMIN_SECRET};
use imgate::auth::{AuthReply, AuthRequest, ForceLogoutReq, GetAdminTokenReq, IssueTokenReq};
use imgate::protocol::{Req, RequestKind};
use imgate::relay::{KickOfflineReq, RelayReply};
use imgate::rpc;
use imgate::messages::{content_type, MsgData};
use imgate::protocol::req_id;
use imgate::relay::{QueryOnlineStatusReq, RelayRequest};
use imgate::{error::code, ImError, Platform, RelayConnector, ResultCode, SessionKey, TcpRelayConnector, TokenError};

#[tokio::test]
async fn push_reaches_platforms_on_different_instances() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    let b = cluster.start_node().await;
    let (mut phone, _) = a.login("u1", Platform::Ios).await;
    let (mut desktop, _) = b.login("u1", Platform::Windows).await;

    let msg = MsgData::builder().send_id("u9").recv_id("u1").content_type(content_type::TEXT).content("hi").seq(3).build();
    let outcome = a.pusher.deliver_to_user(&msg, "op-push").await.unwrap();

    assert_eq!(outcome.get(Platform::Ios), Some(ResultCode::Delivered));
    assert_eq!(outcome.get(Platform::Windows), Some(ResultCode::Delivered));
    assert_eq!(outcome.get(Platform::Android), Some(ResultCode::NotConnected));
    for client in [&mut phone, &mut desktop] {
        let push = client.recv().await.unwrap();
        assert_eq!(push.req_identifier, req_id::PUSH_MSG);
        assert_eq!(push.operation_id, "op-push");
        assert_eq!(push.payload::<MsgData>().unwrap().content, "hi");
    }
    assert!(cluster.offline.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unreached_push_platform_falls_back_to_offline_push() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    let (mut desktop, _) = a.login("u1", Platform::Windows).await;

    let msg = MsgData::builder().send_id("u9").recv_id("u1").content_type(content_type::TEXT).content("hi").build();
    let outcome = a.pusher.deliver_to_user(&msg, "op").await.unwrap();

    assert_eq!(outcome.get(Platform::Windows), Some(ResultCode::Delivered));
    assert_eq!(desktop.recv().await.unwrap().req_identifier, req_id::PUSH_MSG);
    assert_eq!(*cluster.offline.calls.lock().unwrap(), vec![vec!["u1".to_string()]]);
}

#[tokio::test]
async fn dead_instance_does_not_mask_delivery() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    cluster.discovery.register("messagegateway", "127.0.0.1:1");
    let (mut phone, _) = a.login("u1", Platform::Android).await;

    let outcome = a.fanout.online_push("u1", &[Platform::Android], b"{}".to_vec(), "op").await.unwrap();
    assert_eq!(outcome.get(Platform::Android), Some(ResultCode::Delivered));
    assert_eq!(phone.recv().await.unwrap().req_identifier, req_id::PUSH_MSG);
}

#[tokio::test]
async fn force_logout_kicks_session_on_other_instance() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    let b = cluster.start_node().await;
    let (mut client, token) = b.login("u1", Platform::Ios).await;
    let (mut other, _) = b.login("u1", Platform::Web).await;

    assert!(matches!(
        a.tokens.force_logout("u1", "u1", Platform::Ios, "op").await,
        Err(ImError::NoPermission(_))
    ));
    a.tokens.force_logout(ADMIN, "u1", Platform::Ios, "op-kick").await.unwrap();

    let kick = client.recv().await.unwrap();
    assert_eq!(kick.req_identifier, req_id::KICK_ONLINE_MSG);
    assert_eq!(kick.err_code, code::TOKEN_KICKED);
    assert!(client.recv().await.is_none());
    assert!(eventually(|| b.registry.get(&SessionKey::new("u1", Platform::Ios)).is_none()).await);
    assert!(matches!(a.tokens.validate_token(&token).await, Err(ImError::Token(TokenError::Kicked))));

    // The other platform is untouched.
    other.send(&Req::new(RequestKind::GetNewestSeq, "u1", "1")).await;
    assert_eq!(other.recv().await.unwrap().err_code, 0);
}

#[tokio::test]
async fn online_status_is_merged_and_admin_only() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    let b = cluster.start_node().await;
    let (_c1, _) = a.login("u1", Platform::Ios).await;
    let (_c2, _) = b.login("u1", Platform::Web).await;
    let (_c3, _) = b.login("u2", Platform::Android).await;

    let users = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
    let statuses = a.fanout.query_online_status(ADMIN, &users, "op").await.unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].user_id, "u1");
    let ids: Vec<i32> = statuses[0].detail.iter().map(|d| d.platform_id).collect();
    assert_eq!(ids, vec![Platform::Ios.id(), Platform::Web.id()]);
    assert_eq!(statuses[1].user_id, "u2");

    let req = RelayRequest::QueryOnlineStatus(QueryOnlineStatusReq {
        operation_id: "op".into(),
        caller_id: "u1".into(),
        user_ids: users,
    });
    let res = TcpRelayConnector::new(1 << 20).call(&b.relay_addr.to_string(), &req).await;
    assert!(matches!(res, Err(ImError::NoPermission(_))));
}

#[tokio::test]
async fn kicking_twice_is_not_an_error() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    let (mut client, _) = a.login("u1", Platform::Ios).await;

    let req = RelayRequest::KickOffline(KickOfflineReq {
        operation_id: "op-kick".into(),
        user_id: "u1".into(),
        platform: Platform::Ios,
    });
    let connector = TcpRelayConnector::new(1 << 20);
    for _ in 0..2 {
        let reply = connector.call(&a.relay_addr.to_string(), &req).await.unwrap();
        assert_eq!(reply, RelayReply::KickOffline);
    }
    assert_eq!(client.recv().await.unwrap().req_identifier, req_id::KICK_ONLINE_MSG);
    assert!(client.recv().await.is_none());
    assert!(eventually(|| a.registry.online_count() == 0).await);
}

#[tokio::test]
async fn token_lifecycle_over_the_auth_service() {
    let cluster = Cluster::new();
    let a = cluster.start_node().await;
    let b = cluster.start_node().await;
    let auth = a.auth_addr.to_string();
    let call = |req: AuthRequest| {
        let auth = auth.clone();
        async move { rpc::call::<_, AuthReply>(&auth, &req, 1 << 20).await }
    };

    let wrong = call(AuthRequest::GetAdminToken(GetAdminTokenReq {
        operation_id: "op".into(),
        secret: "guess".into(),
        user_id: ADMIN.into(),
    }))
    .await;
    assert!(matches!(wrong, Err(ImError::NoPermission(_))));

    let AuthReply::GetAdminToken(admin) = call(AuthRequest::GetAdminToken(GetAdminTokenReq {
        operation_id: "op".into(),
        secret: ADMIN_SECRET.into(),
        user_id: ADMIN.into(),
    }))
    .await
    .unwrap() else {
        panic!("wrong reply kind");
    };

    let AuthReply::IssueToken(issued) = call(AuthRequest::IssueToken(IssueTokenReq {
        operation_id: "op".into(),
        token: admin.token.clone(),
        user_id: "u1".into(),
        platform: Platform::Ios,
    }))
    .await
    .unwrap() else {
        panic!("wrong reply kind");
    };

    // The issued token logs in on another instance.
    let (mut client, reply) = common::TestClient::connect(b.gateway_addr, &issued.token, "u1", Platform::Ios).await;
    assert_eq!(reply.status, imgate::protocol::HandshakeReply::OK);

    let logout = call(AuthRequest::ForceLogout(ForceLogoutReq {
        operation_id: "op-logout".into(),
        token: admin.token,
        user_id: "u1".into(),
        platform: Platform::Ios,
    }))
    .await
    .unwrap();
    assert_eq!(logout, AuthReply::ForceLogout);

    assert_eq!(client.recv().await.unwrap().req_identifier, req_id::KICK_ONLINE_MSG);
    assert!(client.recv().await.is_none());
    assert!(matches!(b.tokens.validate_token(&issued.token).await, Err(ImError::Token(TokenError::Kicked))));
}
