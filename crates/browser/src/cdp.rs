//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! One writer task owns the sink; one reader task routes command responses
//! back to their callers by request id.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CdpError {
    /// The WebSocket is gone; the browser crashed or was closed.
    #[error("CDP connection closed: {0}")]
    Closed(String),

    #[error("CDP command timed out: {0}")]
    Timeout(String),

    /// The browser answered with an error object or an unusable result.
    #[error("CDP error: {0}")]
    Protocol(String),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    command_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Closed(format!("failed to connect to {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    writer_closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        // Events carry no id and are not consumed here.
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Wake every waiter: their senders drop with the map entries.
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reader_handle,
            writer_handle,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a CDP command and wait for its `result`.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if self.is_closed() {
            return Err(CdpError::Closed(method.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CdpError::Closed(method.to_string()));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(CdpError::Protocol(format!("{}: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(CdpError::Closed(method.to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CdpError::Timeout(format!(
                    "'{}' after {}ms",
                    method,
                    self.command_timeout.as_millis()
                )))
            }
        }
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "DOM").
    pub async fn enable_domain(&self, domain: &str) -> Result<(), CdpError> {
        self.send_command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    /// Start a navigation. Fails when the browser reports a network error.
    pub async fn navigate(&self, url: &str) -> Result<Value, CdpError> {
        let result = self.send_command("Page.navigate", json!({"url": url})).await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(CdpError::Protocol(format!("navigation to {} failed: {}", url, err)));
        }
        Ok(result)
    }

    /// Evaluate JavaScript in the page and return its value.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| details.get("text").and_then(|t| t.as_str()))
                .unwrap_or("script threw");
            return Err(CdpError::Protocol(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Insert text into the focused element (bypasses key events).
    pub async fn insert_text(&self, text: &str) -> Result<(), CdpError> {
        self.send_command("Input.insertText", json!({"text": text})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
