//! Integration tests for the REST endpoints and the delegate push stream.
//!
//! Each test starts the router on a random port and talks to it over real
//! HTTP and WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use delegate_broker::api;
use delegate_broker::clock::SystemClock;
use delegate_broker::store::LibSqlBackend;
use delegate_broker::{BrokerConfig, BrokerDeps, DelegateBroker};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const ACCOUNT: &str = "acct-http";

/// Start the broker on a random port and return its base URL.
async fn start_server() -> String {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let config = BrokerConfig {
        sync_poll_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    };
    let (deps, services) = BrokerDeps::local(store, &config, Arc::new(SystemClock));
    let broker = Arc::new(DelegateBroker::new(config, deps));
    let app = api::router(broker, services.push, services.waiters);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("127.0.0.1:{port}")
}

async fn register(client: &reqwest::Client, addr: &str, host: &str) -> Value {
    let resp = client
        .post(format!("http://{addr}/api/delegates"))
        .json(&json!({
            "account_id": ACCOUNT,
            "host_name": host,
            "ip": "10.1.0.1",
            "supported_task_types": ["EXEC"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let body: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reregistration_keeps_delegate_id() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let first = register(&client, &addr, "build-box").await;
        let second = register(&client, &addr, "build-box").await;
        assert_eq!(first["id"], second["id"]);

        let list: Value = client
            .get(format!("http://{addr}/api/accounts/{ACCOUNT}/delegates"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn async_task_lifecycle_over_rest() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        let delegate = register(&client, &addr, "worker-1").await;
        let delegate_id = delegate["id"].as_str().unwrap().to_string();

        let resp = client
            .post(format!("http://{addr}/api/tasks"))
            .json(&json!({"account_id": ACCOUNT, "task_type": "EXEC", "parameters": {"cmd": "ls"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let queued: Value = resp.json().await.unwrap();
        let task_id = queued["task_id"].as_str().unwrap().to_string();
        let wait_id = queued["wait_id"].as_str().unwrap().to_string();

        let events: Value = client
            .get(format!(
                "http://{addr}/api/accounts/{ACCOUNT}/delegates/{delegate_id}/events?sync_only=false"
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(events["task_events"][0]["task_id"], task_id.as_str());
        assert_eq!(events["task_events"][0]["sync"], false);

        let task_url = format!("http://{addr}/api/accounts/{ACCOUNT}/tasks/{task_id}");
        let acquired: Value = client
            .post(format!("{task_url}/acquire"))
            .json(&json!({"delegate_id": delegate_id}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(acquired["delegate_id"], delegate_id.as_str());
        assert_eq!(acquired["status"], "started");

        // A second acquire finds nothing to take.
        let again = client
            .post(format!("{task_url}/acquire"))
            .json(&json!({"delegate_id": delegate_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 404);

        let resp = client
            .post(format!("{task_url}/start"))
            .json(&json!({"delegate_id": delegate_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("{task_url}/result"))
            .json(&json!({"delegate_id": delegate_id, "response": {"data": "done"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client.get(&task_url).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        // The caller collects the response with the wait id it was given.
        let resp = client
            .get(format!("http://{addr}/api/waits/{wait_id}?timeout_ms=1000"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let response: Value = resp.json().await.unwrap();
        assert_eq!(response["data"], "done");
        assert_eq!(response["failed"], false);

        // Collected once; a second wait finds nothing.
        let resp = client
            .get(format!("http://{addr}/api/waits/{wait_id}?timeout_ms=50"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 504);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn waiting_caller_receives_later_result() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        let delegate = register(&client, &addr, "worker-4").await;
        let delegate_id = delegate["id"].as_str().unwrap().to_string();

        let queued: Value = client
            .post(format!("http://{addr}/api/tasks"))
            .json(&json!({"account_id": ACCOUNT, "task_type": "EXEC", "wait_id": "caller-wait"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(queued["wait_id"], "caller-wait");
        let task_id = queued["task_id"].as_str().unwrap().to_string();

        let waiter = {
            let client = client.clone();
            let url = format!("http://{addr}/api/waits/caller-wait?timeout_ms=3000");
            tokio::spawn(async move { client.get(url).send().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task_url = format!("http://{addr}/api/accounts/{ACCOUNT}/tasks/{task_id}");
        client
            .post(format!("{task_url}/acquire"))
            .json(&json!({"delegate_id": delegate_id}))
            .send()
            .await
            .unwrap();
        client
            .post(format!("{task_url}/result"))
            .json(&json!({"delegate_id": delegate_id, "response": {"data": "later", "failed": true}}))
            .send()
            .await
            .unwrap();

        let resp = waiter.await.unwrap();
        assert_eq!(resp.status(), 200);
        let response: Value = resp.json().await.unwrap();
        assert_eq!(response["data"], "later");
        assert_eq!(response["failed"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sync_execute_times_out_with_504() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/tasks/execute"))
            .json(&json!({"account_id": ACCOUNT, "task_type": "EXEC", "timeout_ms": 100}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 504);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("Timed out"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        let delegate = register(&client, &addr, "worker-2").await;
        let delegate_id = delegate["id"].as_str().unwrap();

        let resp = client
            .put(format!("http://{addr}/api/accounts/{ACCOUNT}/delegates/{delegate_id}/scopes"))
            .json(&json!({"include_scopes": [{"name": "everything"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("http://{addr}/api/tasks"))
            .json(&json!({"account_id": ACCOUNT, "task_type": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("http://{addr}/api/tasks"))
            .json(&json!({"account_id": ACCOUNT, "task_type": "EXEC", "timeout_ms": u64::MAX}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("http://{addr}/api/accounts/{ACCOUNT}/delegates/missing/heartbeat"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!(
                "http://{addr}/api/accounts/{ACCOUNT}/tasks/{}/abort",
                uuid::Uuid::new_v4()
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_change_and_delete() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        let delegate = register(&client, &addr, "worker-3").await;
        let delegate_url = format!(
            "http://{addr}/api/accounts/{ACCOUNT}/delegates/{}",
            delegate["id"].as_str().unwrap()
        );

        let disabled: Value = client
            .put(format!("{delegate_url}/status"))
            .json(&json!({"status": "disabled"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(disabled["status"], "disabled");

        let resp = client.delete(&delegate_url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client.get(&delegate_url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_pushes_only_own_account() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let (mut ws, _) = connect_async(format!("ws://{addr}/stream/delegate/{ACCOUNT}"))
            .await
            .expect("failed to connect");
        // Let the server subscribe before anything is broadcast.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for account in ["someone-else", ACCOUNT] {
            let resp = client
                .post(format!("http://{addr}/api/tasks"))
                .json(&json!({"account_id": account, "task_type": "EXEC"}))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 201);
        }

        let pushed: Value = match ws.next().await.unwrap().unwrap() {
            Message::Text(txt) => serde_json::from_str(&txt).expect("invalid JSON from server"),
            other => panic!("expected Text frame, got {:?}", other),
        };
        assert_eq!(pushed["account_id"], ACCOUNT);
        assert_eq!(pushed["type"], "task_queued");
        assert_eq!(pushed["sync"], false);
    })
    .await
    .expect("test timed out");
}
