//! 推送通道 - SSE 长连接 + 重连
//!
//! 状态流转：`disconnected → connecting → connected`，出错后进入 `degraded`
//! （轮询仍在维持 store）并按 [`ReconnectPolicy`] 重试；重试预算耗尽后停在
//! `disconnected`，由 `NotificationEngine::reconnect` 手动恢复。
//!
//! 推送通道不做去重，每条事件直接交给 store。

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::{PushStream, PushTransport};
use super::backoff::ReconnectPolicy;
use super::model::{ConnectionState, Notification, NotificationId, NotificationType, OrderSummary};
use super::sse::{SseDecoder, SseFrame};
use super::store::{IngestSource, NotificationStore};

pub const NEW_ORDER_TITLE: &str = "Nouvelle commande";
pub const STATUS_UPDATE_TITLE: &str = "Commande mise à jour";

/// 推送事件解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown push event `{0}`")]
    UnknownEvent(String),
    #[error("push event `{event}` carries no notification id")]
    MissingId { event: String },
    #[error("malformed `{event}` payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `new_order` / `order_status_update` 的载荷
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(default, alias = "notificationId", alias = "notification_id")]
    id: Option<NotificationId>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    order: Option<serde_json::Value>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default, alias = "createdAt")]
    created_at: Option<DateTime<Utc>>,
}

/// 将一个命名事件解码为规范化通知
pub fn decode_event(event: &str, data: &str) -> Result<Notification, DecodeError> {
    let malformed = |source: serde_json::Error| DecodeError::Malformed {
        event: event.to_string(),
        source,
    };

    let kind = match event {
        "notification" => return serde_json::from_str::<Notification>(data).map_err(malformed),
        "new_order" => NotificationType::NewOrder,
        "order_status_update" => NotificationType::OrderStatusUpdate,
        other => return Err(DecodeError::UnknownEvent(other.to_string())),
    };

    let envelope: PushEnvelope = serde_json::from_str(data).map_err(malformed)?;
    let id = envelope.id.ok_or_else(|| DecodeError::MissingId {
        event: event.to_string(),
    })?;

    let raw_payload = match kind {
        NotificationType::NewOrder => envelope.order.or(envelope.data),
        _ => envelope.data.or(envelope.order),
    };
    let payload: Option<OrderSummary> = raw_payload
        .filter(|v| v.is_object())
        .map(serde_json::from_value)
        .transpose()
        .map_err(malformed)?;

    let title = envelope.title.unwrap_or_else(|| match kind {
        NotificationType::NewOrder => NEW_ORDER_TITLE.to_string(),
        _ => STATUS_UPDATE_TITLE.to_string(),
    });
    let message = envelope
        .message
        .unwrap_or_else(|| default_message(kind, payload.as_ref()));

    Ok(Notification {
        id,
        kind,
        title,
        message,
        payload,
        read: false,
        created_at: envelope.created_at.unwrap_or_else(Utc::now),
    })
}

fn default_message(kind: NotificationType, payload: Option<&OrderSummary>) -> String {
    let Some(order) = payload else {
        return String::new();
    };
    match kind {
        NotificationType::NewOrder => format!(
            "{} a commandé {} × {}",
            order.customer_name.as_deref().unwrap_or("Un client"),
            order.quantity.unwrap_or(1),
            order.product_name.as_deref().unwrap_or("Produit"),
        ),
        _ => match (&order.order_id, &order.status) {
            (Some(id), Some(status)) => format!("Commande #{} : {}", id, status),
            (None, Some(status)) => status.clone(),
            _ => String::new(),
        },
    }
}

/// 推送任务的结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// 会话被取消（disconnect）
    Cancelled,
    /// 重连预算耗尽
    RetriesExhausted { retries: u32 },
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(anyhow::Error),
}

/// 推送通道
pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    store: Arc<NotificationStore>,
    policy: ReconnectPolicy,
}

impl PushChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        store: Arc<NotificationStore>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            policy,
        }
    }

    /// 连接并持续接收，直到取消或重连预算耗尽
    pub async fn run(&self, cancel: CancellationToken) -> PushOutcome {
        let mut attempt: u32 = 0;

        loop {
            self.store.set_connection_state(ConnectionState::Connecting);

            let opened = tokio::select! {
                _ = cancel.cancelled() => return self.stopped(),
                opened = self.transport.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    info!("Push channel connected");
                    self.store.set_connection_state(ConnectionState::Connected);
                    attempt = 0;
                    match self.pump(stream, &cancel).await {
                        StreamEnd::Cancelled => return self.stopped(),
                        StreamEnd::Closed => warn!("Push stream closed by server"),
                        StreamEnd::Failed(e) => warn!(error = %e, "Push stream failed"),
                    }
                }
                Err(e) => warn!(error = %e, attempt = attempt + 1, "Push connection failed"),
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                warn!(
                    retries = attempt - 1,
                    "Push reconnect budget exhausted, relying on polling only"
                );
                self.store.set_connection_state(ConnectionState::Disconnected);
                return PushOutcome::RetriesExhausted {
                    retries: attempt - 1,
                };
            };

            self.store.set_connection_state(ConnectionState::Degraded);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling push reconnect");
            tokio::select! {
                _ = cancel.cancelled() => return self.stopped(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn stopped(&self) -> PushOutcome {
        self.store.set_connection_state(ConnectionState::Disconnected);
        PushOutcome::Cancelled
    }

    async fn pump(&self, mut stream: PushStream, cancel: &CancellationToken) -> StreamEnd {
        let mut decoder = SseDecoder::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(chunk)) => {
                    for frame in decoder.feed(&chunk) {
                        self.handle_frame(&frame);
                    }
                }
            }
        }
    }

    fn handle_frame(&self, frame: &SseFrame) {
        match decode_event(&frame.event, &frame.data) {
            Ok(notification) => {
                debug!(notification_id = notification.id, event = %frame.event, "Push event received");
                self.store.ingest(vec![notification], IngestSource::Push);
            }
            Err(DecodeError::UnknownEvent(name)) => {
                debug!(event = %name, "Ignoring unknown push event");
            }
            Err(e) => warn!(error = %e, "Dropping undecodable push event"),
        }
    }
}
