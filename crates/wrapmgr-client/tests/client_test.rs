//! Client Integration Tests
//!
//! Each test starts a real wrapper manager on an ephemeral port, backed by a
//! mock worker, and drives it through `ManagerClient`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wrapmgr_client::ManagerClient;
use wrapmgr_common::protocol::{DecryptData, ReplyHeader};
use wrapmgr_common::WrapmgrError;
use wrapmgr_manager::{
    AccountAuthenticator, AuthError, Credentials, ManagerConfig, ManagerHandle, WorkerProxyConfig,
    WrapperManager,
};
use wrapmgr_test_utils::{mock_decrypt, MockWorker};

/// Accepts every account once it presents the code `123456`.
struct CodeAuthenticator;

#[async_trait]
impl AccountAuthenticator for CodeAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), AuthError> {
        match credentials.two_factor_code.as_deref() {
            None => Err(AuthError::TwoFactorRequired),
            Some("123456") => Ok(()),
            Some(_) => Err(AuthError::TwoFactorRejected),
        }
    }
}

fn config_for(worker: &MockWorker) -> ManagerConfig {
    ManagerConfig {
        rpc_bind: "127.0.0.1:0".to_string(),
        proxy: WorkerProxyConfig {
            host: worker.host(),
            decrypt_port: worker.decrypt_port(),
            m3u8_port: worker.m3u8_port(),
            account_port: worker.account_port(),
            ..Default::default()
        },
        health_enabled: false,
        ..Default::default()
    }
}

async fn start(manager: WrapperManager) -> (ManagerHandle, ManagerClient) {
    let handle = Arc::new(manager).start().await.unwrap();
    let client = ManagerClient::new(handle.rpc_addr().to_string());
    (handle, client)
}

#[tokio::test]
async fn test_status_login_logout() {
    let worker = MockWorker::start().await;
    let (handle, client) = start(WrapperManager::new(config_for(&worker)).unwrap()).await;

    let status = client.status().await.unwrap();
    assert!(status.ready);
    assert!(!status.status);
    assert_eq!(status.client_count, 0);

    client
        .login("alice", "pw", || async { None })
        .await
        .unwrap();
    let status = client.status().await.unwrap();
    assert!(status.status);
    assert_eq!(status.client_count, 1);
    assert_eq!(status.regions, vec!["us".to_string()]);

    client.logout("alice").await.unwrap();
    assert_eq!(client.status().await.unwrap().client_count, 0);

    match client.logout("alice").await {
        Err(WrapmgrError::Rejected { code, .. }) => assert_eq!(code, ReplyHeader::FAILURE),
        other => panic!("expected rejection, got {:?}", other),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_login_with_two_factor_callback() {
    let worker = MockWorker::start().await;
    let manager =
        WrapperManager::with_authenticator(config_for(&worker), Arc::new(CodeAuthenticator))
            .unwrap();
    let (handle, client) = start(manager).await;

    let prompts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&prompts);
    client
        .login("bob", "pw", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Some("123456".to_string()) }
        })
        .await
        .unwrap();

    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    assert_eq!(client.status().await.unwrap().client_count, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_login_abandoned_without_code() {
    let worker = MockWorker::start().await;
    let manager =
        WrapperManager::with_authenticator(config_for(&worker), Arc::new(CodeAuthenticator))
            .unwrap();
    let (handle, client) = start(manager).await;

    let result = client.login("carol", "pw", || async { None }).await;
    assert!(result.is_err());
    assert_eq!(client.status().await.unwrap().client_count, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_wrong_code_fails_login() {
    let worker = MockWorker::start().await;
    let manager =
        WrapperManager::with_authenticator(config_for(&worker), Arc::new(CodeAuthenticator))
            .unwrap();
    let (handle, client) = start(manager).await;

    let result = client
        .login("dave", "pw", || async { Some("000000".to_string()) })
        .await;
    match result {
        Err(WrapmgrError::Rejected { code, .. }) => assert_eq!(code, ReplyHeader::FAILURE),
        other => panic!("expected rejection, got {:?}", other),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_decrypt_stream_round_trip() {
    let worker = MockWorker::start().await;
    let (handle, client) = start(WrapperManager::new(config_for(&worker)).unwrap()).await;
    client.login("alice", "pw", || async { None }).await.unwrap();

    let mut stream = client.decrypt_stream().await.unwrap();
    stream.keepalive().await.unwrap();

    for i in 0..5u32 {
        let sample = vec![i as u8; 16];
        let plaintext = stream
            .decrypt("1440818664", "skd://key", i, sample.clone())
            .await
            .unwrap();
        assert_eq!(plaintext, mock_decrypt(&sample));
    }
    assert!(stream.finish().await.unwrap().is_empty());
    assert_eq!(worker.state().samples_decrypted(), 5);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_pipelined_decrypt_replies_keep_order() {
    let worker = MockWorker::start().await;
    let (handle, client) = start(WrapperManager::new(config_for(&worker)).unwrap()).await;
    client.login("alice", "pw", || async { None }).await.unwrap();

    let mut stream = client.decrypt_stream().await.unwrap();
    for i in 0..10u32 {
        stream
            .send(&DecryptData {
                adam_id: "42".to_string(),
                key: "k".to_string(),
                sample_index: i,
                sample: vec![i as u8, 1, 2],
            })
            .await
            .unwrap();
    }

    let replies = stream.finish().await.unwrap();
    assert_eq!(replies.len(), 10);
    for (i, reply) in replies.into_iter().enumerate() {
        assert!(reply.is_success());
        let data = reply.data.unwrap();
        assert_eq!(data.sample_index, i as u32);
        assert_eq!(data.sample, mock_decrypt(&[i as u8, 1, 2]));
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_decrypt_failure_does_not_end_stream() {
    let worker = MockWorker::start().await;
    let (handle, client) = start(WrapperManager::new(config_for(&worker)).unwrap()).await;

    let mut stream = client.decrypt_stream().await.unwrap();
    let err = stream.decrypt("1", "k", 0, vec![1, 2, 3]).await.unwrap_err();
    assert!(err.to_string().contains("no available instance"));

    stream.keepalive().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_m3u8_through_client() {
    let worker = MockWorker::start().await;
    worker.set_m3u8_reply("https://example.com/master.m3u8");
    let (handle, client) = start(WrapperManager::new(config_for(&worker)).unwrap()).await;

    assert!(client.m3u8("1").await.is_err());

    client.login("alice", "pw", || async { None }).await.unwrap();
    let url = tokio::time::timeout(Duration::from_secs(5), client.m3u8("1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(url, "https://example.com/master.m3u8");

    handle.shutdown().await;
}
