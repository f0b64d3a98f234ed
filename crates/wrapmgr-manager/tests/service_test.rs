//! Wrapper Manager Integration Tests
//!
//! These tests start a complete manager (RPC front and admin HTTP server)
//! against mock workers and talk to it over real sockets:
//! - Unary calls and their reply shapes on the frame transport
//! - Decrypt streams, keep-alives and sticky release
//! - Admin HTTP views of the pool, metrics and health

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use wrapmgr_common::protocol::{
    DecryptData, LoginData, M3u8Data, Method, Reply, ReplyHeader, Request, StatusData,
};
use wrapmgr_common::transport::{receive_message, send_message, FrameTransport, JsonCodec};
use wrapmgr_manager::{
    HealthMonitorConfig, ManagerConfig, ManagerHandle, WorkerProxyConfig, WrapperManager,
};
use wrapmgr_test_utils::{mock_decrypt, MockWorker};

// ============================================================================
// Harness
// ============================================================================

fn proxy_for(worker: &MockWorker) -> WorkerProxyConfig {
    WorkerProxyConfig {
        host: worker.host(),
        decrypt_port: worker.decrypt_port(),
        m3u8_port: worker.m3u8_port(),
        account_port: worker.account_port(),
        m3u8_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn start_manager(worker: &MockWorker, health_enabled: bool) -> ManagerHandle {
    let config = ManagerConfig {
        rpc_bind: "127.0.0.1:0".to_string(),
        admin_bind: Some("127.0.0.1:0".to_string()),
        proxy: proxy_for(worker),
        health_enabled,
        health: HealthMonitorConfig {
            check_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        ..Default::default()
    };
    Arc::new(WrapperManager::new(config).unwrap())
        .start()
        .await
        .unwrap()
}

async fn unary<T: serde::de::DeserializeOwned>(
    handle: &ManagerHandle,
    method: Method,
    args: Value,
) -> Reply<T> {
    let transport = FrameTransport::new();
    let mut stream = transport
        .connect(&handle.rpc_addr().to_string())
        .await
        .unwrap();
    let request = Request::new(method, args);
    let response = transport.send_request(&mut stream, &request).await.unwrap();
    assert_eq!(response.id, request.id);
    response.into_reply().unwrap()
}

fn admin_url(handle: &ManagerHandle, path: &str) -> String {
    format!("http://{}{}", handle.admin_addr().unwrap(), path)
}

// ============================================================================
// RPC front
// ============================================================================

#[tokio::test]
async fn test_status_over_the_wire() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;

    let reply: Reply<StatusData> = unary(&handle, Method::Status, json!({})).await;
    assert!(reply.is_success());
    let status = reply.data.unwrap();
    assert!(status.ready);
    assert_eq!(status.client_count, 0);

    handle.manager().pool().add("alice", "pw", "jp").await.unwrap();
    let reply: Reply<StatusData> = unary(&handle, Method::Status, json!({})).await;
    let status = reply.data.unwrap();
    assert!(status.status);
    assert_eq!(status.regions, vec!["jp".to_string()]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unimplemented_methods_fail_on_the_wire() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;

    for method in [Method::License, Method::WebPlayback] {
        let reply: Reply<Value> = unary(&handle, method, json!({ "adam_id": "1" })).await;
        assert_eq!(reply.header.code, ReplyHeader::FAILURE);
        assert!(reply.header.msg.contains("not implemented"));
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_bad_arguments_fail_without_closing_connection() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;

    let transport = FrameTransport::new();
    let mut stream = transport
        .connect(&handle.rpc_addr().to_string())
        .await
        .unwrap();

    let bad = Request::new(Method::M3u8, json!({ "adam_id": 5 }));
    let response = transport.send_request(&mut stream, &bad).await.unwrap();
    assert_eq!(response.header.code, ReplyHeader::FAILURE);

    let ok = Request::new(Method::Status, json!({}));
    let response = transport.send_request(&mut stream, &ok).await.unwrap();
    assert!(response.header.is_success());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_m3u8_failure_keeps_adam_id() {
    let worker = MockWorker::start().await;
    worker.set_m3u8_reply("");
    let handle = start_manager(&worker, false).await;
    handle.manager().pool().add("alice", "pw", "us").await.unwrap();

    let reply: Reply<M3u8Data> = unary(&handle, Method::M3u8, json!({ "adam_id": "77" })).await;
    assert_eq!(reply.header.code, ReplyHeader::FAILURE);
    let data = reply.data.unwrap();
    assert_eq!(data.adam_id, "77");
    assert!(data.m3u8.is_empty());

    worker.set_m3u8_reply("not a url");
    let reply: Reply<M3u8Data> = unary(&handle, Method::M3u8, json!({ "adam_id": "77" })).await;
    assert_eq!(reply.header.code, ReplyHeader::FAILURE);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_decrypt_stream_releases_sticky_instances() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;
    let pool = Arc::clone(handle.manager().pool());
    let instance = pool.add("alice", "pw", "us").await.unwrap();

    let transport = FrameTransport::new();
    let stream = transport
        .connect(&handle.rpc_addr().to_string())
        .await
        .unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let frames = [
        DecryptData::keepalive(),
        DecryptData {
            adam_id: "900".to_string(),
            key: "skd://900".to_string(),
            sample_index: 0,
            sample: vec![1, 2, 3, 4],
        },
    ];
    for frame in &frames {
        let request = Request::with_payload(Method::Decrypt, frame).unwrap();
        send_message(&mut writer, &JsonCodec::encode_request(&request).unwrap())
            .await
            .unwrap();
    }

    let mut replies = Vec::new();
    for _ in 0..frames.len() {
        let frame = receive_message(&mut reader).await.unwrap().unwrap();
        let reply: Reply<DecryptData> = JsonCodec::decode_response(&frame)
            .unwrap()
            .into_reply()
            .unwrap();
        replies.push(reply);
    }

    assert_eq!(replies[0].data.as_ref().unwrap(), &DecryptData::keepalive());
    assert!(replies[1].is_success());
    assert_eq!(
        replies[1].data.as_ref().unwrap().sample,
        mock_decrypt(&[1, 2, 3, 4])
    );
    assert_eq!(instance.last_adam_id(), "900");

    writer.shutdown().await.unwrap();
    assert!(receive_message(&mut reader).await.unwrap().is_none());

    let released = async {
        while !instance.last_adam_id().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released)
        .await
        .expect("sticky marker was not released");

    handle.shutdown().await;
}

async fn decrypt_on_stream(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    adam_id: &str,
) -> Reply<DecryptData> {
    let frame = DecryptData {
        adam_id: adam_id.to_string(),
        key: format!("skd://{}", adam_id),
        sample_index: 0,
        sample: vec![9, 8, 7],
    };
    let request = Request::with_payload(Method::Decrypt, &frame).unwrap();
    send_message(writer, &JsonCodec::encode_request(&request).unwrap())
        .await
        .unwrap();
    let frame = receive_message(reader).await.unwrap().unwrap();
    JsonCodec::decode_response(&frame)
        .unwrap()
        .into_reply()
        .unwrap()
}

#[tokio::test]
async fn test_shared_song_stays_pinned_until_last_stream_ends() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;
    let instance = handle.manager().pool().add("alice", "pw", "us").await.unwrap();

    let transport = FrameTransport::new();
    let addr = handle.rpc_addr().to_string();
    let (mut reader_a, mut writer_a) = transport.connect(&addr).await.unwrap().into_split();
    let (mut reader_b, mut writer_b) = transport.connect(&addr).await.unwrap().into_split();

    assert!(decrypt_on_stream(&mut reader_a, &mut writer_a, "900").await.is_success());
    assert!(decrypt_on_stream(&mut reader_b, &mut writer_b, "900").await.is_success());

    writer_a.shutdown().await.unwrap();
    assert!(receive_message(&mut reader_a).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(instance.last_adam_id(), "900");

    writer_b.shutdown().await.unwrap();
    assert!(receive_message(&mut reader_b).await.unwrap().is_none());
    let released = async {
        while !instance.last_adam_id().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released)
        .await
        .expect("song stayed pinned after every stream ended");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_login_stream_reports_already_logged_in() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;

    let transport = FrameTransport::new();
    let stream = transport
        .connect(&handle.rpc_addr().to_string())
        .await
        .unwrap();
    let (mut reader, mut writer) = stream.into_split();

    for _ in 0..2 {
        let request = Request::with_payload(
            Method::Login,
            &LoginData {
                username: "alice".to_string(),
                password: "pw".to_string(),
                two_step_code: String::new(),
            },
        )
        .unwrap();
        send_message(&mut writer, &JsonCodec::encode_request(&request).unwrap())
            .await
            .unwrap();
    }
    writer.shutdown().await.unwrap();

    let mut codes = Vec::new();
    while let Some(frame) = receive_message(&mut reader).await.unwrap() {
        codes.push(JsonCodec::decode_response(&frame).unwrap().header.code);
    }
    assert_eq!(codes, vec![ReplyHeader::SUCCESS, ReplyHeader::FAILURE]);

    handle.shutdown().await;
}

// ============================================================================
// Admin HTTP
// ============================================================================

#[tokio::test]
async fn test_admin_liveness_and_status() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;
    let http = reqwest::Client::new();

    let body = http
        .get(admin_url(&handle, "/__health"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");

    handle.manager().pool().add("alice", "pw", "us").await.unwrap();
    let status: Value = http
        .get(admin_url(&handle, "/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["client_count"], 1);
    assert_eq!(status["ready"], true);

    let dispatcher: Value = http
        .get(admin_url(&handle, "/dispatcher"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dispatcher["total_instances"], 1);
    assert_eq!(dispatcher["idle_instances"], 1);

    let health = http
        .get(admin_url(&handle, "/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::NOT_FOUND);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_admin_instances_and_health() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, true).await;
    let http = reqwest::Client::new();
    handle.manager().pool().add("alice", "pw", "us").await.unwrap();

    let monitor = Arc::clone(handle.manager().health_monitor().unwrap());
    monitor.run_once().await;

    let instances: Value = http
        .get(admin_url(&handle, "/instances"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = instances.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["username"], "alice");
    assert_eq!(rows[0]["status"], "active");
    assert_eq!(rows[0]["health"], "healthy");

    let summary: Value = http
        .get(admin_url(&handle, "/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["enabled"], true);
    assert_eq!(summary["failure_threshold"], 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_admin_metrics_count_calls() {
    let worker = MockWorker::start().await;
    let handle = start_manager(&worker, false).await;

    for _ in 0..3 {
        let _: Reply<StatusData> = unary(&handle, Method::Status, json!({})).await;
    }
    let _: Reply<Value> = unary(&handle, Method::License, json!({})).await;

    let metrics: Value = reqwest::get(admin_url(&handle, "/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["operations"]["Status"]["call_count"], 3);
    assert_eq!(metrics["operations"]["Status"]["success_count"], 3);
    assert_eq!(metrics["operations"]["License"]["failure_count"], 1);

    handle.shutdown().await;
}
