//! Phoenix-channel websocket client for database change notifications.
//!
//! Protocol:
//! - Client joins `realtime:public:messages` with a `postgres_changes` filter on
//!   `conversation_id` and waits for `{ "event": "phx_reply", "payload": { "status": "ok" } }`.
//! - Server streams `{ "event": "postgres_changes", "payload": { "data": { "type", "record" } } }`.
//! - Client sends `heartbeat` on topic `phoenix` every 30 s and `phx_leave` when done.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::errors::ChatError;
use crate::models::{ConversationId, MessageRecord, PushEvent, PushKind};
use crate::realtime::{PushChannel, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MESSAGES_TOPIC: &str = "realtime:public:messages";
const PHOENIX_TOPIC: &str = "phoenix";
const JOIN_REF: &str = "1";
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhxFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

impl PhxFrame {
    fn new(topic: &str, event: &str, payload: serde_json::Value, reference: impl ToString) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
        }
    }

    fn join(conversation_id: &ConversationId) -> Self {
        let payload = json!({
            "config": {
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": "messages",
                    "filter": format!("conversation_id=eq.{conversation_id}"),
                }]
            }
        });
        Self::new(MESSAGES_TOPIC, "phx_join", payload, JOIN_REF)
    }
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: serde_json::Value,
}

/// Decodes one text frame. `Ok(None)` for frames that carry no message change.
fn decode_change(text: &str) -> Result<Option<PushEvent>, ChatError> {
    let frame: PhxFrame = serde_json::from_str(text)
        .map_err(|e| ChatError::malformed(format!("invalid frame: {e}")))?;
    if frame.event != "postgres_changes" {
        return Ok(None);
    }

    let change: ChangePayload = serde_json::from_value(frame.payload)
        .map_err(|e| ChatError::malformed(format!("invalid change payload: {e}")))?;
    let kind = match change.data.kind.as_str() {
        "INSERT" => PushKind::Insert,
        "UPDATE" => PushKind::Update,
        other => {
            debug!(kind = other, "ignoring change type");
            return Ok(None);
        }
    };
    let record: MessageRecord = serde_json::from_value(change.data.record)
        .map_err(|e| ChatError::malformed(format!("invalid message record: {e}")))?;
    Ok(Some(PushEvent { kind, record }))
}

async fn send_frame(
    sink: &mut SplitSink<Socket, WsMessage>,
    frame: &PhxFrame,
) -> Result<(), tungstenite::Error> {
    // PhxFrame only holds strings and JSON values, so encoding cannot fail.
    let text = serde_json::to_string(frame).unwrap_or_default();
    sink.send(WsMessage::Text(text.into())).await
}

async fn await_join_ack<S>(stream: &mut S) -> Result<(), ChatError>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(WsMessage::Text(t)) => t,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(ChatError::subscription(format!("receive failed: {e}"))),
        };
        let Ok(frame) = serde_json::from_str::<PhxFrame>(text.as_str()) else {
            continue;
        };
        if frame.event != "phx_reply" || frame.reference.as_deref() != Some(JOIN_REF) {
            continue;
        }
        return match frame.payload.get("status").and_then(|s| s.as_str()) {
            Some("ok") => Ok(()),
            _ => Err(ChatError::subscription(format!("join rejected: {}", frame.payload))),
        };
    }
    Err(ChatError::subscription("connection closed before join was acknowledged"))
}

/// Realtime channel speaking the Supabase/Phoenix websocket protocol.
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    url: String,
    api_key: Option<String>,
    join_timeout: Duration,
    heartbeat: Duration,
}

impl WsPushChannel {
    pub fn new(url: &str, api_key: Option<String>) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            api_key,
            join_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(30),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    fn socket_url(&self) -> String {
        let base = if self.url.ends_with("/websocket") {
            self.url.clone()
        } else {
            format!("{}/websocket", self.url)
        };
        match &self.api_key {
            Some(key) => format!("{base}?apikey={key}&vsn=1.0.0"),
            None => format!("{base}?vsn=1.0.0"),
        }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription, ChatError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.socket_url())
            .await
            .map_err(|e| ChatError::subscription(format!("connect failed: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        send_frame(&mut sink, &PhxFrame::join(conversation_id))
            .await
            .map_err(|e| ChatError::subscription(format!("join failed: {e}")))?;
        tokio::time::timeout(self.join_timeout, await_join_ack(&mut stream))
            .await
            .map_err(|_| ChatError::subscription("timed out waiting for join reply"))??;
        info!(conversation = %conversation_id, "realtime channel joined");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (leave_tx, leave_rx) = oneshot::channel();
        let task = tokio::spawn(run_channel(
            sink,
            stream,
            tx,
            leave_rx,
            self.heartbeat,
            conversation_id.clone(),
        ));
        Ok(Subscription::new(rx, task, Some(leave_tx)))
    }
}

async fn run_channel(
    mut sink: SplitSink<Socket, WsMessage>,
    mut stream: SplitStream<Socket>,
    events: mpsc::Sender<PushEvent>,
    mut leave: oneshot::Receiver<()>,
    heartbeat: Duration,
    conversation_id: ConversationId,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = &mut leave => {
                let frame = PhxFrame::new(MESSAGES_TOPIC, "phx_leave", json!({}), next_ref);
                let _ = send_frame(&mut sink, &frame).await;
                let _ = sink.close().await;
                info!(conversation = %conversation_id, "realtime channel left");
                return;
            }
            _ = ticker.tick() => {
                let frame = PhxFrame::new(PHOENIX_TOPIC, "heartbeat", json!({}), next_ref);
                next_ref += 1;
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    warn!(conversation = %conversation_id, "realtime heartbeat failed: {e}");
                    return;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match decode_change(text.as_str()) {
                    Ok(Some(event)) => {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(conversation = %conversation_id, "dropping realtime frame: {e}"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    warn!(conversation = %conversation_id, ?frame, "realtime channel closed by server");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conversation = %conversation_id, "realtime receive failed: {e}");
                    return;
                }
                None => {
                    warn!(conversation = %conversation_id, "realtime stream ended");
                    return;
                }
            }
        }
    }
}
