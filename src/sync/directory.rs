//! Controller directory: the single writer of the known-host list.
//!
//! Both update sources — `/hosts` refreshes over HTTP and push
//! messages over WebSocket — funnel through one actor task that owns
//! the list, so partial writes can never interleave. Everything else
//! holds a cheap cloneable handle and reads snapshots.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::api::{ApiError, DocumentClient};
use crate::models::Controller;

/// Lifecycle of the directory contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStatus {
    Loading,
    Ready,
    Error,
}

enum Command {
    ReplaceAll(Vec<Controller>),
    Upsert(Controller),
    SetStatus(DirectoryStatus),
    Snapshot(oneshot::Sender<Vec<Controller>>),
    Status(oneshot::Sender<DirectoryStatus>),
}

/// Handle to the directory actor.
#[derive(Clone)]
pub struct Directory {
    tx: mpsc::Sender<Command>,
}

impl Directory {
    /// Spawns the owning actor and returns a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_actor(rx));
        Self { tx }
    }

    pub async fn snapshot(&self) -> Vec<Controller> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> DirectoryStatus {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Status(tx)).await.is_err() {
            return DirectoryStatus::Error;
        }
        rx.await.unwrap_or(DirectoryStatus::Error)
    }

    /// Controllers eligible for sync and lock participation.
    pub async fn syncable(&self) -> Vec<Controller> {
        self.snapshot()
            .await
            .into_iter()
            .filter(Controller::is_syncable)
            .collect()
    }

    pub async fn replace_all(&self, controllers: Vec<Controller>) {
        let _ = self.tx.send(Command::ReplaceAll(controllers)).await;
    }

    pub async fn upsert(&self, controller: Controller) {
        let _ = self.tx.send(Command::Upsert(controller)).await;
    }

    async fn set_status(&self, status: DirectoryStatus) {
        let _ = self.tx.send(Command::SetStatus(status)).await;
    }

    /// Re-reads the directory from the entry host's `/hosts` endpoint.
    ///
    /// Entries without an ip address are dropped and surrounding
    /// whitespace is trimmed off every address — several firmwares pad
    /// them. Returns the number of usable entries.
    pub async fn refresh(
        &self,
        client: &DocumentClient,
        entry_host: &str,
    ) -> Result<usize, ApiError> {
        self.set_status(DirectoryStatus::Loading).await;
        let hosts = match client.get_hosts(entry_host, true).await {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::warn!(entry_host, error = %e, "directory refresh failed");
                self.set_status(DirectoryStatus::Error).await;
                return Err(e);
            }
        };

        let cleaned = clean_hosts(hosts);
        let count = cleaned.len();
        self.replace_all(cleaned).await;
        self.set_status(DirectoryStatus::Ready).await;
        tracing::info!(entry_host, count, "directory refreshed");
        Ok(count)
    }
}

fn clean_hosts(hosts: Vec<Controller>) -> Vec<Controller> {
    hosts
        .into_iter()
        .filter_map(|mut c| {
            c.ip_address = c.ip_address.trim().to_string();
            if c.ip_address.is_empty() {
                None
            } else {
                Some(c)
            }
        })
        .collect()
}

async fn run_actor(mut rx: mpsc::Receiver<Command>) {
    let mut controllers: Vec<Controller> = Vec::new();
    let mut status = DirectoryStatus::Loading;

    while let Some(command) = rx.recv().await {
        match command {
            Command::ReplaceAll(new) => controllers = new,
            Command::Upsert(controller) => {
                match controllers.iter_mut().find(|c| c.id == controller.id) {
                    Some(existing) => *existing = controller,
                    None => controllers.push(controller),
                }
            }
            Command::SetStatus(new) => status = new,
            Command::Snapshot(reply) => {
                let _ = reply.send(controllers.clone());
            }
            Command::Status(reply) => {
                let _ = reply.send(status);
            }
        }
    }
}

/// How long the push channel may stay silent before it is declared lost.
const KEEP_ALIVE_GRACE: Duration = Duration::from_secs(65);
/// Reconnect backoff cap.
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

type PushSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Listens for push updates and feeds them into the directory.
///
/// Reconnects forever with capped exponential backoff; answers
/// `keep_alive` probes and treats a silent 65s window as a lost
/// connection. Runs until the process exits — spawn it.
pub async fn run_push_listener(url: String, directory: Directory) {
    let mut attempts: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                tracing::info!(%url, "push channel connected");
                attempts = 0;
                if let Err(reason) = pump_messages(socket, &directory).await {
                    tracing::warn!(%url, reason, "push channel lost");
                }
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "push connect failed");
            }
        }

        let delay = (1_000u64 * 2u64.saturating_pow(attempts)).min(MAX_RECONNECT_DELAY_MS);
        attempts = attempts.saturating_add(1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

async fn pump_messages(mut socket: PushSocket, directory: &Directory) -> Result<(), &'static str> {
    loop {
        let msg = match timeout(KEEP_ALIVE_GRACE, socket.next()).await {
            Err(_) => return Err("keep-alive window elapsed"),
            Ok(None) => return Err("stream ended"),
            Ok(Some(Err(_))) => return Err("socket error"),
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => handle_push(text.as_str(), &mut socket, directory).await?,
            Message::Ping(data) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    return Err("pong failed");
                }
            }
            Message::Close(_) => return Err("server closed"),
            _ => {}
        }
    }
}

async fn handle_push(
    text: &str,
    socket: &mut PushSocket,
    directory: &Directory,
) -> Result<(), &'static str> {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return Ok(()); // not JSON, ignore
    };

    match message.get("method").and_then(Value::as_str) {
        Some("keep_alive") => {
            let reply = json!({
                "id": message.get("id").cloned().unwrap_or(Value::Null),
                "method": "keep_alive",
                "params": {},
            });
            socket
                .send(Message::Text(reply.to_string().into()))
                .await
                .map_err(|_| "keep-alive reply failed")?;
        }
        Some("hosts") => {
            let hosts = message
                .get("params")
                .and_then(|p| p.get("hosts"))
                .cloned()
                .unwrap_or(Value::Null);
            match serde_json::from_value::<Vec<Controller>>(hosts) {
                Ok(hosts) => {
                    let cleaned = clean_hosts(hosts);
                    tracing::debug!(count = cleaned.len(), "push update replaced directory");
                    directory.replace_all(cleaned).await;
                }
                Err(e) => tracing::warn!(error = %e, "ignoring malformed hosts push"),
            }
        }
        _ => {}
    }
    Ok(())
}
