//! `HttpTransport` against a local task API on an ephemeral port.
//!
//! The fake API records method, path, and the idempotency and
//! authorization headers of every request it receives.

use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tasksync::models::task::Identity;
use tasksync::models::{MutationOp, MutationRecord, NewTask, Task, TaskPatch, TASK_ENTITY};
use tasksync::sync::network::spawn_reachability_probe;
use tasksync::sync::transport::IDEMPOTENCY_HEADER;
use tasksync::sync::{HttpTransport, NetworkMonitor, NetworkStatus, SendOutcome, Transport};
use tasksync::AppError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Seen {
    method: &'static str,
    path: String,
    idempotency_key: Option<String>,
    authorization: Option<String>,
}

#[derive(Default)]
struct Api {
    seen: Mutex<Vec<Seen>>,
}

impl Api {
    fn record(&self, method: &'static str, path: String, headers: &HeaderMap) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        self.seen.lock().unwrap().push(Seen {
            method,
            path,
            idempotency_key: header(&IDEMPOTENCY_HEADER.to_ascii_lowercase()),
            authorization: header("authorization"),
        });
    }
}

fn wire_task(id: &str, title: &str) -> Value {
    let now = Utc::now();
    json!({
        "id": id,
        "title": title,
        "completed": false,
        "priority": "medium",
        "tags": [],
        "created_at": now,
        "updated_at": now,
    })
}

async fn create_task(
    State(api): State<Arc<Api>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.record("POST", "/tasks".into(), &headers);
    let title = body["title"].as_str().unwrap_or_default().to_owned();
    (StatusCode::CREATED, Json(wire_task("srv-9", &title)))
}

async fn list_tasks(State(api): State<Arc<Api>>, headers: HeaderMap) -> Json<Value> {
    api.record("GET", "/tasks".into(), &headers);
    Json(json!([wire_task("srv-1", "one"), wire_task("srv-2", "two")]))
}

async fn patch_task(
    State(api): State<Arc<Api>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    api.record("PATCH", format!("/tasks/{id}"), &headers);
    match id.as_str() {
        "missing" => StatusCode::NOT_FOUND,
        "stale" => StatusCode::CONFLICT,
        "broken" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::NO_CONTENT,
    }
}

async fn delete_task(
    State(api): State<Arc<Api>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    api.record("DELETE", format!("/tasks/{id}"), &headers);
    if id == "missing" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

/// Serve the fake API on an ephemeral port; returns its base URL.
async fn spawn_api(api: Arc<Api>) -> String {
    let app = Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", patch(patch_task).delete(delete_task))
        .route("/health", get(|| async { "ok" }))
        .with_state(api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn transport(base_url: &str, token: Option<&str>) -> HttpTransport {
    HttpTransport::new(
        reqwest::Client::new(),
        format!("{base_url}/"),
        token.map(str::to_owned),
    )
}

fn update(id: &str) -> MutationRecord {
    MutationRecord::new(
        TASK_ENTITY,
        Identity::Permanent(id.into()),
        MutationOp::Update(TaskPatch::default().completed(true)),
        None,
    )
}

fn delete(id: &str) -> MutationRecord {
    MutationRecord::new(TASK_ENTITY, Identity::Permanent(id.into()), MutationOp::Delete, None)
}

#[tokio::test]
async fn create_posts_and_returns_permanent_task() {
    let api = Arc::new(Api::default());
    let base = spawn_api(Arc::clone(&api)).await;
    let transport = transport(&base, Some("secret"));

    let local = Task::from_new(Identity::new_temporary(), NewTask::titled("hello"), Utc::now());
    let item = MutationRecord::new(TASK_ENTITY, local.id.clone(), MutationOp::Create(local), None);

    let outcome = transport.send(&item).await.expect("send");
    match outcome {
        SendOutcome::Created(task) => {
            assert_eq!(task.id, Identity::Permanent("srv-9".into()));
            assert_eq!(task.title, "hello");
        }
        SendOutcome::Applied => panic!("create must return the server task"),
    }

    let seen = api.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].idempotency_key.as_deref(), Some(item.id.as_str()));
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn update_and_delete_address_permanent_id() {
    let api = Arc::new(Api::default());
    let base = spawn_api(Arc::clone(&api)).await;
    let transport = transport(&base, None);

    assert_eq!(transport.send(&update("srv-1")).await.expect("patch"), SendOutcome::Applied);
    assert_eq!(transport.send(&delete("srv-1")).await.expect("delete"), SendOutcome::Applied);

    let seen = api.seen.lock().unwrap().clone();
    assert_eq!(seen[0].method, "PATCH");
    assert_eq!(seen[0].path, "/tasks/srv-1");
    assert_eq!(seen[1].method, "DELETE");
    assert!(seen.iter().all(|s| s.authorization.is_none()));
}

#[tokio::test]
async fn status_codes_map_to_error_taxonomy() {
    let api = Arc::new(Api::default());
    let base = spawn_api(Arc::clone(&api)).await;
    let transport = transport(&base, None);

    assert!(matches!(
        transport.send(&update("stale")).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        transport.send(&update("missing")).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        transport.send(&update("broken")).await,
        Err(AppError::Transport(_))
    ));
    assert_eq!(
        transport.send(&delete("missing")).await.expect("gone is fine"),
        SendOutcome::Applied
    );
}

#[tokio::test]
async fn mutation_for_unresolved_identity_is_refused_locally() {
    let api = Arc::new(Api::default());
    let base = spawn_api(Arc::clone(&api)).await;
    let transport = transport(&base, None);

    let item = MutationRecord::new(
        TASK_ENTITY,
        Identity::new_temporary(),
        MutationOp::Delete,
        None,
    );
    assert!(matches!(transport.send(&item).await, Err(AppError::Transport(_))));
    assert!(api.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn fetch_all_returns_permanent_tasks() {
    let api = Arc::new(Api::default());
    let base = spawn_api(Arc::clone(&api)).await;

    let tasks = transport(&base, None).fetch_all().await.expect("fetch");
    let ids: Vec<Identity> = tasks.into_iter().map(|t| t.id).collect();
    assert_eq!(
        ids,
        vec![Identity::Permanent("srv-1".into()), Identity::Permanent("srv-2".into())]
    );
}

#[tokio::test]
async fn unreachable_server_is_transient() {
    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = transport(&format!("http://{addr}"), None)
        .send(&update("srv-1"))
        .await
        .expect_err("nothing listening");
    assert!(err.is_transient());
}

#[tokio::test]
async fn probe_marks_reachable_server_online() {
    let api = Arc::new(Api::default());
    let base = spawn_api(api).await;
    let status = Arc::new(NetworkStatus::new(false));
    let ct = CancellationToken::new();

    let handle = spawn_reachability_probe(
        Arc::clone(&status),
        reqwest::Client::new(),
        format!("{base}/health"),
        std::time::Duration::from_secs(60),
        ct.clone(),
    );
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    assert!(status.is_online());
    ct.cancel();
    handle.await.expect("probe exits");
}
