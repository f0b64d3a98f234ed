//! CLI Integration Tests
//!
//! Runs the `wrapmgr` binary against a manager started in-process.

use serde_json::Value;
use std::sync::Arc;
use tokio::process::Command;
use wrapmgr_manager::{ManagerConfig, ManagerHandle, WorkerProxyConfig, WrapperManager};
use wrapmgr_test_utils::MockWorker;

async fn start_manager(worker: &MockWorker) -> ManagerHandle {
    let config = ManagerConfig {
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
    };
    Arc::new(WrapperManager::new(config).unwrap())
        .start()
        .await
        .unwrap()
}

fn wrapmgr(handle: &ManagerHandle, args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_wrapmgr"));
    command
        .args(args)
        .env("WRAPMGR_ADDR", handle.rpc_addr().to_string())
        .env_remove("WRAPMGR_PASSWORD");
    command
}

#[tokio::test]
async fn test_status_prints_json() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker).await;

    let output = wrapmgr(&handle, &["status"]).output().await.unwrap();
    assert!(output.status.success());
    let status: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["client_count"], 0);
    assert_eq!(status["ready"], true);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_login_then_m3u8() {
    let worker = MockWorker::start().await;
    worker.set_m3u8_reply("https://example.com/a.m3u8");
    let handle = start_manager(&worker).await;

    let output = wrapmgr(&handle, &["m3u8", "1"]).output().await.unwrap();
    assert!(!output.status.success());

    let output = wrapmgr(&handle, &["login", "alice", "-p", "pw"])
        .output()
        .await
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(handle.manager().pool().client_count(), 1);

    let output = wrapmgr(&handle, &["m3u8", "1"]).output().await.unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "https://example.com/a.m3u8"
    );

    let output = wrapmgr(&handle, &["logout", "alice"]).output().await.unwrap();
    assert!(output.status.success());
    assert!(handle.manager().pool().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_login_without_password_fails() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker).await;

    let output = wrapmgr(&handle, &["login", "alice"]).output().await.unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("WRAPMGR_PASSWORD"));

    handle.shutdown().await;
}
