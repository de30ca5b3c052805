//! In-process mock controller for tests.
//!
//! Serves the same HTTP surface as a real controller (`/data`, `/hosts`,
//! `/info`) including the selector semantics of `POST /data`, plus test
//! knobs: scripted status sequences, request recording, artificial
//! handling delay, and silently dropped lock writes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::models::{Controller, Document};

pub struct MockController {
    addr: SocketAddr,
    state: Arc<MockState>,
}

struct MockState {
    document: Mutex<Document>,
    hosts: Mutex<Vec<Controller>>,
    script: Mutex<VecDeque<u16>>,
    posted: Mutex<Vec<Value>>,
    data_requests: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay_ms: AtomicU64,
    drop_lock_writes: AtomicBool,
}

impl MockController {
    pub async fn spawn() -> Self {
        let state = Arc::new(MockState {
            document: Mutex::new(Document::default()),
            hosts: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            posted: Mutex::new(Vec::new()),
            data_requests: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            drop_lock_writes: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/data", get(data_get).post(data_post))
            .route("/hosts", get(hosts_get))
            .route("/info", get(info_get))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock controller");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    /// Host key for the gateway: `127.0.0.1:<port>`.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn document(&self) -> Document {
        self.state.document.lock().unwrap().clone()
    }

    pub fn update_document(&self, f: impl FnOnce(&mut Document)) {
        f(&mut self.state.document.lock().unwrap());
    }

    pub fn set_hosts(&self, hosts: Vec<Controller>) {
        *self.state.hosts.lock().unwrap() = hosts;
    }

    /// Statuses to answer `/data` requests with before behaving
    /// normally, in order.
    pub fn script_statuses(&self, statuses: &[u16]) {
        self.state.script.lock().unwrap().extend(statuses);
    }

    pub fn posted_bodies(&self) -> Vec<Value> {
        self.state.posted.lock().unwrap().clone()
    }

    pub fn data_requests(&self) -> usize {
        self.state.data_requests.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn set_handling_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// When set, lock writes answer 2xx but are not applied — models
    /// firmwares that silently drop them.
    pub fn set_drop_lock_writes(&self, drop_writes: bool) {
        self.state
            .drop_lock_writes
            .store(drop_writes, Ordering::SeqCst);
    }
}

struct RequestGuard<'a>(&'a MockState);

impl<'a> RequestGuard<'a> {
    fn enter(state: &'a MockState) -> Self {
        state.data_requests.fetch_add(1, Ordering::SeqCst);
        let now_active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now_active, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn hold_and_script(state: &MockState) -> Option<StatusCode> {
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let scripted = state.script.lock().unwrap().pop_front();
    scripted.map(|s| StatusCode::from_u16(s).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
}

async fn data_get(State(state): State<Arc<MockState>>) -> Response {
    let _guard = RequestGuard::enter(&state);
    if let Some(status) = hold_and_script(&state).await {
        return (status, String::new()).into_response();
    }
    let doc = state.document.lock().unwrap().clone();
    Json(doc).into_response()
}

async fn data_post(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let _guard = RequestGuard::enter(&state);
    if let Some(status) = hold_and_script(&state).await {
        return (status, String::new()).into_response();
    }
    state.posted.lock().unwrap().push(body.clone());

    let drop_locks = state.drop_lock_writes.load(Ordering::SeqCst);
    let mut doc = state.document.lock().unwrap();
    match apply_patch(&mut doc, &body, drop_locks) {
        Ok(()) => (StatusCode::OK, "OK".to_string()).into_response(),
        Err(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
    }
}

async fn hosts_get(State(state): State<Arc<MockState>>) -> Json<Value> {
    let hosts = state.hosts.lock().unwrap().clone();
    Json(json!({ "hosts": hosts }))
}

async fn info_get() -> Json<Value> {
    Json(json!({ "deviceid": "mock-device", "version": "test" }))
}

const COLLECTIONS: [&str; 4] = ["presets", "scenes", "groups", "controllers"];

/// Applies the controller's `POST /data` selector semantics:
/// `coll[]` appends, `coll[id=X]` replaces or (with `[]` payload)
/// removes, `sync-lock` overwrites the lock. Unknown keys are ignored,
/// a selector that matches nothing is a `BadSelector` rejection.
fn apply_patch(doc: &mut Document, patch: &Value, drop_locks: bool) -> Result<(), String> {
    let patch = patch.as_object().ok_or("expected object body")?;
    let mut value = serde_json::to_value(&*doc).map_err(|e| e.to_string())?;
    let obj = value.as_object_mut().expect("document serializes to object");

    for (key, payload) in patch {
        if key == "sync-lock" {
            if !drop_locks {
                obj.insert(key.clone(), payload.clone());
            }
            continue;
        }

        if let Some(coll) = key.strip_suffix("[]") {
            if !COLLECTIONS.contains(&coll) {
                continue;
            }
            let arr = obj
                .entry(coll.to_string())
                .or_insert_with(|| json!([]))
                .as_array_mut()
                .ok_or("collection is not an array")?;
            arr.extend(payload.as_array().cloned().unwrap_or_default());
            continue;
        }

        if let Some((coll, id)) = parse_id_selector(key) {
            if !COLLECTIONS.contains(&coll) {
                continue;
            }
            let arr = obj
                .entry(coll.to_string())
                .or_insert_with(|| json!([]))
                .as_array_mut()
                .ok_or("collection is not an array")?;
            let pos = arr
                .iter()
                .position(|e| e.get("id").and_then(Value::as_str) == Some(id));
            let Some(pos) = pos else {
                return Err(format!("BadSelector: no {} entry with id={}", coll, id));
            };
            if payload.as_array().is_some_and(|a| a.is_empty()) {
                arr.remove(pos);
            } else {
                arr[pos] = payload.clone();
            }
        }
        // other keys: tolerated, ignored
    }

    *doc = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(())
}

fn parse_id_selector(key: &str) -> Option<(&str, &str)> {
    let open = key.find("[id=")?;
    let coll = &key[..open];
    let id = key[open + 4..].strip_suffix(']')?;
    Some((coll, id))
}
