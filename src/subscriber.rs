//! Live `eth_subscribe` feed over WebSocket.
//!
//! A subscription lives exactly as long as its [`LiveFeed`]: the ids the node
//! hands out are owned by the feed, and a reconnect builds a new feed rather
//! than reusing them.

use crate::error::IngestError;
use crate::events::{FilterQuery, LogEntry, parse_quantity};
use alloy_primitives::B256;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const LOGS_REQUEST_ID: u64 = 1;
const HEADS_REQUEST_ID: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHead {
    pub number: u64,
    pub hash: Option<B256>,
    pub parent_hash: Option<B256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHead {
    number: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    parent_hash: Option<String>,
}

impl BlockHead {
    pub fn from_value(value: Value) -> Option<Self> {
        let raw: RawHead = serde_json::from_value(value).ok()?;
        Some(BlockHead {
            number: parse_quantity("number", Some(&raw.number)).ok()?,
            hash: raw.hash.and_then(|h| B256::from_str(&h).ok()),
            parent_hash: raw.parent_hash.and_then(|h| B256::from_str(&h).ok()),
        })
    }
}

#[derive(Debug)]
pub enum LiveMessage {
    Log(LogEntry),
    Head(BlockHead),
    /// Last message of a feed.
    Closed(IngestError),
}

/// One established subscription and the queue its reader task fills.
pub struct LiveFeed {
    pub logs_subscription: String,
    pub heads_subscription: Option<String>,
    receiver: mpsc::Receiver<LiveMessage>,
    task: Option<JoinHandle<()>>,
}

impl LiveFeed {
    pub fn new(
        logs_subscription: String,
        heads_subscription: Option<String>,
        receiver: mpsc::Receiver<LiveMessage>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            logs_subscription,
            heads_subscription,
            receiver,
            task,
        }
    }

    pub async fn recv(&mut self) -> Option<LiveMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<LiveMessage, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait LiveSource: Send + Sync {
    /// Opens a fresh subscription for purchase logs and new heads.
    async fn subscribe(&self, filter: &FilterQuery, capacity: usize)
    -> Result<LiveFeed, IngestError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionParams {
    subscription: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<SubscriptionParams>,
}

fn classify_rpc_error(error: &RpcErrorBody) -> IngestError {
    let message = error.message.to_lowercase();
    if message.contains("filter not found") || message.contains("subscription not found") {
        IngestError::FilterExpired
    } else {
        IngestError::SubscribeFailed(format!("rpc error {}: {}", error.code, error.message))
    }
}

/// Maps one text frame onto the feed. `None` means the frame carries nothing
/// for the coordinator.
fn route_frame(text: &str, logs_id: &str, heads_id: Option<&str>) -> Option<LiveMessage> {
    let message: RpcMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unparseable frame: {}", e);
            return None;
        }
    };

    if let Some(error) = &message.error {
        return Some(LiveMessage::Closed(classify_rpc_error(error)));
    }

    if message.method.as_deref() != Some("eth_subscription") {
        debug!("Ignoring frame for request {:?}", message.id);
        return None;
    }
    let params = message.params?;

    if params.subscription == logs_id {
        match serde_json::from_value::<LogEntry>(params.result) {
            Ok(entry) => Some(LiveMessage::Log(entry)),
            Err(e) => {
                warn!("Dropping log notification with unexpected shape: {}", e);
                None
            }
        }
    } else if Some(params.subscription.as_str()) == heads_id {
        match BlockHead::from_value(params.result) {
            Some(head) => Some(LiveMessage::Head(head)),
            None => {
                warn!("Dropping head notification with unexpected shape");
                None
            }
        }
    } else {
        debug!("Ignoring notification for unknown subscription {}", params.subscription);
        None
    }
}

pub struct WsSubscriber {
    url: String,
}

impl WsSubscriber {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

fn subscribe_request(id: u64, params: Value) -> Message {
    Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_subscribe",
            "params": params,
        })
        .to_string(),
    )
}

#[async_trait]
impl LiveSource for WsSubscriber {
    async fn subscribe(
        &self,
        filter: &FilterQuery,
        capacity: usize,
    ) -> Result<LiveFeed, IngestError> {
        info!("Connecting to WebSocket {}", self.url);
        let failed = |e: String| IngestError::SubscribeFailed(e);

        let (ws_stream, _) = timeout(SUBSCRIBE_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| failed("WebSocket connect timed out".into()))?
            .map_err(|e| failed(format!("WebSocket connect: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(subscribe_request(
                LOGS_REQUEST_ID,
                json!(["logs", filter.subscription_params()]),
            ))
            .await
            .map_err(|e| failed(format!("WebSocket send: {e}")))?;
        write
            .send(subscribe_request(HEADS_REQUEST_ID, json!(["newHeads"])))
            .await
            .map_err(|e| failed(format!("WebSocket send: {e}")))?;

        // Notifications may arrive before both confirmations; keep them.
        let mut logs_id = None;
        let mut heads_id = None;
        let mut early_frames = Vec::new();
        let confirm = async {
            while logs_id.is_none() || heads_id.is_none() {
                let frame = read
                    .next()
                    .await
                    .ok_or_else(|| failed("connection closed while subscribing".into()))?
                    .map_err(|e| failed(format!("WebSocket read: {e}")))?;
                let Message::Text(text) = frame else {
                    continue;
                };
                let message: RpcMessage = serde_json::from_str(&text)
                    .map_err(|e| failed(format!("invalid subscribe response: {e}")))?;
                match message.id {
                    Some(id) if id == LOGS_REQUEST_ID || id == HEADS_REQUEST_ID => {
                        if let Some(error) = &message.error {
                            return Err(classify_rpc_error(error));
                        }
                        let sub = message
                            .result
                            .as_ref()
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| failed("subscribe response without id".into()))?;
                        if id == LOGS_REQUEST_ID {
                            logs_id = Some(sub);
                        } else {
                            heads_id = Some(sub);
                        }
                    }
                    _ => early_frames.push(text),
                }
            }
            Ok::<(), IngestError>(())
        };
        timeout(SUBSCRIBE_TIMEOUT, confirm)
            .await
            .map_err(|_| failed("subscription confirmation timed out".into()))??;

        let logs_id = logs_id.unwrap_or_default();
        info!(
            "Subscribed to logs ({}) and new heads ({:?})",
            logs_id, heads_id
        );

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task_logs_id = logs_id.clone();
        let task_heads_id = heads_id.clone();

        let task = tokio::spawn(async move {
            for text in early_frames {
                if let Some(message) = route_frame(&text, &task_logs_id, task_heads_id.as_deref()) {
                    let closed = matches!(message, LiveMessage::Closed(_));
                    if tx.send(message).await.is_err() || closed {
                        return;
                    }
                }
            }

            while let Some(frame) = read.next().await {
                let message = match frame {
                    Ok(Message::Text(text)) => {
                        route_frame(&text, &task_logs_id, task_heads_id.as_deref())
                    }
                    Ok(Message::Ping(payload)) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            Some(LiveMessage::Closed(IngestError::SubscribeFailed(format!(
                                "WebSocket pong: {e}"
                            ))))
                        } else {
                            None
                        }
                    }
                    Ok(Message::Close(frame)) => Some(LiveMessage::Closed(
                        IngestError::SubscribeFailed(format!("closed by node: {frame:?}")),
                    )),
                    Ok(_) => None,
                    Err(e) => Some(LiveMessage::Closed(IngestError::SubscribeFailed(format!(
                        "WebSocket read: {e}"
                    )))),
                };

                if let Some(message) = message {
                    let closed = matches!(message, LiveMessage::Closed(_));
                    if tx.send(message).await.is_err() || closed {
                        return;
                    }
                }
            }

            let _ = tx
                .send(LiveMessage::Closed(IngestError::SubscribeFailed(
                    "WebSocket stream ended".into(),
                )))
                .await;
        });

        Ok(LiveFeed::new(logs_id, heads_id, rx, Some(task)))
    }
}
