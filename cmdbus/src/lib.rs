//! MQTT-backed command bus.
//!
//! Maps the engine's request/reply dispatch onto MQTT topics. A call
//! publishes a correlated request to `voxlink/rpc/<method>`:
//!
//! ```json
//! { "id": "<uuid>", "reply_to": "voxlink/rpc/reply/<client>", "body": "..." }
//! ```
//!
//! and waits for the handler's reply on the client's reply topic:
//!
//! ```json
//! { "id": "<uuid>", "status": 0, "body": "..." }
//! ```
//!
//! Status 0 is success; anything else surfaces as `BusError::Remote`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use voxlink_dialog::bus::{BusError, CommandBus};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RpcReply>>>>;

/// Request envelope published to the handler's topic.
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: &'a str,
    reply_to: &'a str,
    body: &'a str,
}

/// Reply envelope received on the reply topic.
#[derive(Debug, Deserialize)]
struct RpcReply {
    id: String,
    #[serde(default)]
    status: i32,
    #[serde(default)]
    body: String,
}

/// MQTT request/reply client implementing [`CommandBus`].
pub struct MqttBus {
    client: AsyncClient,
    reply_topic: String,
    pending: PendingMap,
}

impl MqttBus {
    /// Connects to the broker, subscribes the reply topic, and spawns the
    /// event-loop task. The connection reconnects on its own; calls made
    /// while the broker is unreachable fail with their timeout.
    pub async fn connect(host: &str, port: u16, client_id: &str) -> Result<Self, BusError> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(20));

        let (client, event_loop) = AsyncClient::new(options, 16);
        let reply_topic = format!("voxlink/rpc/reply/{client_id}");
        client
            .subscribe(&reply_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Transport(format!("subscribe {reply_topic}: {e}")))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(run_event_loop(event_loop, Arc::clone(&pending)));

        Ok(Self {
            client,
            reply_topic,
            pending,
        })
    }

    async fn call_once(
        &self,
        method: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<String, BusError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let request = RpcRequest {
            id: &id,
            reply_to: &self.reply_topic,
            body,
        };
        let payload =
            serde_json::to_vec(&request).map_err(|e| BusError::Transport(e.to_string()))?;
        let topic = format!("voxlink/rpc/{method}");

        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
        {
            self.pending.lock().remove(&id);
            return Err(BusError::Transport(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.status == 0 => Ok(reply.body),
            Ok(Ok(reply)) => Err(BusError::Remote(reply.status)),
            Ok(Err(_)) => Err(BusError::Transport("reply channel dropped".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(BusError::Timeout)
            }
        }
    }
}

#[async_trait]
impl CommandBus for MqttBus {
    async fn call(
        &self,
        method: &str,
        body: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<String, BusError> {
        let mut last = BusError::Timeout;
        for attempt in 0..=retries {
            match self.call_once(method, body, timeout).await {
                Ok(reply) => return Ok(reply),
                // The handler answered; a retry would not change the verdict.
                Err(e @ BusError::Remote(_)) => return Err(e),
                Err(e) => {
                    debug!(method, attempt, "rpc attempt failed: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

async fn run_event_loop(mut event_loop: EventLoop, pending: PendingMap) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match serde_json::from_slice::<RpcReply>(&publish.payload) {
                    Ok(reply) => {
                        if let Some(tx) = pending.lock().remove(&reply.id) {
                            let _ = tx.send(reply);
                        } else {
                            debug!(id = %reply.id, "reply for unknown or expired call");
                        }
                    }
                    Err(e) => warn!(topic = %publish.topic, "malformed rpc reply: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc re-dials on the next poll; back off a little so a
                // dead broker does not spin the loop.
                error!("mqtt event loop: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
