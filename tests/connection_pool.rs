//! Connection Manager against real HTTP tool servers.

mod common;

use axum::http::StatusCode;
use common::Counters;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchboard::connections::{
    ConnectionManager, EndpointClassifier, HttpConnector, HttpSender, RemoteTarget, TransportKind,
};
use switchboard::secrets::StaticSecretResolver;
use switchboard::signing::{NoCredentials, RequestSigner};
use switchboard::types::{PoolConfig, ProtectedEndpoint, SigningConfig, ToolCallId};
use tokio_util::sync::CancellationToken;

fn manager(config: PoolConfig, signing: SigningConfig) -> Arc<ConnectionManager> {
    let signer = Arc::new(RequestSigner::new(Arc::new(NoCredentials), Duration::from_secs(300)));
    let sender = Arc::new(HttpSender::new(reqwest::Client::new(), signer));
    Arc::new(ConnectionManager::new(
        config,
        EndpointClassifier::new(&signing).unwrap(),
        Arc::new(StaticSecretResolver::new()),
        Arc::new(HttpConnector::new(sender)),
    ))
}

fn payload() -> serde_json::Value {
    json!({"name": "weather", "arguments": {"city": "Oslo"}})
}

#[tokio::test]
async fn concurrent_acquire_shares_one_handshake() {
    let (url, counters) =
        common::persistent_server(Duration::from_millis(150), Duration::ZERO).await;
    let pool = manager(PoolConfig::default(), SigningConfig::default());
    let target = RemoteTarget::new(url, TransportKind::Persistent);

    let leases = futures::future::join_all((0..8).map(|_| pool.acquire(&target))).await;
    let leases: Vec<_> = leases.into_iter().map(|l| l.unwrap()).collect();

    assert_eq!(Counters::get(&counters.initialize), 1);
    let first = leases[0].connection().id();
    assert!(leases.iter().all(|l| l.connection().id() == first));
    assert_eq!(pool.stats().await.leases, 8);
    drop(leases);
    assert_eq!(pool.stats().await.leases, 0);

    // calls reuse the session
    let cancel = CancellationToken::new();
    let result = pool
        .call(&target, &ToolCallId::new(), payload(), &cancel)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ok");
    assert_eq!(Counters::get(&counters.initialize), 1);
    assert_eq!(pool.stats().await.established_total, 1);
}

#[tokio::test]
async fn four_failures_evict_and_next_acquire_reconnects() {
    let (url, counters) = common::ephemeral_server(StatusCode::BAD_GATEWAY).await;
    let pool = manager(
        PoolConfig {
            max_retries: 0,
            eviction_backoff_base: Duration::from_millis(20),
            ..PoolConfig::default()
        },
        SigningConfig::default(),
    );
    let target = RemoteTarget::new(url, TransportKind::Ephemeral);
    let cancel = CancellationToken::new();

    let first = pool.acquire(&target).await.unwrap().connection().id();
    for _ in 0..4 {
        let err = pool
            .call(&target, &ToolCallId::new(), payload(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unreachable");
    }
    assert_eq!(Counters::get(&counters.calls), 4);
    let stats = pool.stats().await;
    assert_eq!(stats.evicted_total, 1);
    assert_eq!(stats.connections, 0);

    // the key cools down before it can be re-established
    let cooling = pool.acquire(&target).await.unwrap_err();
    assert_eq!(cooling.code(), "unreachable");
    assert_eq!(Counters::get(&counters.calls), 4);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = pool.acquire(&target).await.unwrap().connection().id();
    assert_ne!(first, second);
    assert_eq!(pool.stats().await.established_total, 2);
}

#[tokio::test]
async fn protected_endpoint_fails_closed_without_credentials() {
    let (url, counters) = common::ephemeral_server(StatusCode::OK).await;
    let signing = SigningConfig {
        protected: vec![ProtectedEndpoint {
            pattern: "127.0.0.*".into(),
            service: "lambda".into(),
            region: Some("eu-west-1".into()),
        }],
        ..SigningConfig::default()
    };
    let pool = manager(PoolConfig::default(), signing);
    let target = RemoteTarget::new(url, TransportKind::Ephemeral);

    let err = pool
        .call(&target, &ToolCallId::new(), payload(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "auth_unavailable");
    assert_eq!(Counters::get(&counters.requests), 0);
}

#[tokio::test]
async fn best_effort_signing_falls_back_to_unsigned() {
    let (url, counters) = common::ephemeral_server(StatusCode::OK).await;
    let pool = manager(PoolConfig::default(), SigningConfig::default());
    let mut target = RemoteTarget::new(url, TransportKind::Ephemeral);
    target.sign = true;

    let result = pool
        .call(&target, &ToolCallId::new(), payload(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result["city"], "Oslo");
    assert_eq!(Counters::get(&counters.requests), 1);
}

#[tokio::test]
async fn cancelled_persistent_call_notifies_server() {
    let (url, counters) =
        common::persistent_server(Duration::ZERO, Duration::from_secs(30)).await;
    let pool = manager(PoolConfig::default(), SigningConfig::default());
    let target = RemoteTarget::new(url, TransportKind::Persistent);
    let cancel = CancellationToken::new();

    let call = {
        let pool = Arc::clone(&pool);
        let target = target.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.call(&target, &ToolCallId::new(), payload(), &cancel).await })
    };
    while Counters::get(&counters.calls) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), "cancelled");
    assert_eq!(Counters::get(&counters.cancelled), 1);
}

#[tokio::test]
async fn shutdown_closes_persistent_sessions() {
    let (url, counters) = common::persistent_server(Duration::ZERO, Duration::ZERO).await;
    let pool = manager(PoolConfig::default(), SigningConfig::default());
    let target = RemoteTarget::new(url, TransportKind::Persistent);
    drop(pool.acquire(&target).await.unwrap());

    pool.shutdown().await;
    assert_eq!(Counters::get(&counters.closed), 1);
    assert_eq!(pool.stats().await.connections, 0);
}

#[tokio::test]
async fn descriptors_sharing_a_url_keep_their_own_headers() {
    let (url, counters) = common::ephemeral_server(StatusCode::OK).await;
    let pool = manager(PoolConfig::default(), SigningConfig::default());
    let tenant = |name: &str| {
        let mut target = RemoteTarget::new(url.clone(), TransportKind::Ephemeral);
        target.headers.insert("x-tenant".into(), name.into());
        target
    };
    let cancel = CancellationToken::new();

    pool.call(&tenant("alpha"), &ToolCallId::new(), payload(), &cancel)
        .await
        .unwrap();
    pool.call(&tenant("beta"), &ToolCallId::new(), payload(), &cancel)
        .await
        .unwrap();

    assert_eq!(
        counters.tenants(),
        vec![Some("alpha".to_string()), Some("beta".to_string())]
    );
    assert_eq!(pool.stats().await.established_total, 1);
}

#[tokio::test]
async fn expired_remote_session_is_re_established() {
    let (url, counters) = common::persistent_server(Duration::ZERO, Duration::ZERO).await;
    let pool = manager(
        PoolConfig {
            retry_backoff_base: Duration::from_millis(1),
            ..PoolConfig::default()
        },
        SigningConfig::default(),
    );
    let target = RemoteTarget::new(url, TransportKind::Persistent);
    let cancel = CancellationToken::new();

    pool.call(&target, &ToolCallId::new(), payload(), &cancel)
        .await
        .unwrap();
    counters
        .forget_session
        .store(true, std::sync::atomic::Ordering::SeqCst);

    // the stale session is dropped on the first 404, not after a failure streak
    let result = pool
        .call(&target, &ToolCallId::new(), payload(), &cancel)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ok");
    assert_eq!(Counters::get(&counters.initialize), 2);
    assert_eq!(Counters::get(&counters.calls), 2);
    let stats = pool.stats().await;
    assert_eq!(stats.evicted_total, 1);
    assert_eq!(stats.established_total, 2);
}

#[tokio::test]
async fn timed_out_persistent_call_notifies_server() {
    let (url, counters) =
        common::persistent_server(Duration::ZERO, Duration::from_secs(30)).await;
    let pool = manager(
        PoolConfig {
            call_timeout: Duration::from_millis(200),
            max_retries: 0,
            ..PoolConfig::default()
        },
        SigningConfig::default(),
    );
    let target = RemoteTarget::new(url, TransportKind::Persistent);

    let err = pool
        .call(&target, &ToolCallId::new(), payload(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert!(!err.to_string().contains("127.0.0.1"));
    assert_eq!(Counters::get(&counters.cancelled), 1);
}
