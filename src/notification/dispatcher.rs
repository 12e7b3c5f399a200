//! 效果分发器 - 新通知的提示音、语音、toast
//!
//! 只消费 store 的 delta 流（此前未知的 id），不看快照，因此同一 id 无论经由
//! 推送还是轮询、被 ingest 多少次，效果都只触发一次。分发器自身再按 id
//! 记录已触发集合，保证这一点不依赖上游。
//!
//! 会话首次轮询（baseline）默认同样触发效果；关闭 `announce_backlog` 后只跳过
//! 会话开始前创建的通知，会话期间到达的新订单无论先经由哪条链路都会提示。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{Notification, NotificationId, NotificationType};
use super::store::DeltaEvent;
use super::toast::{Toast, ToastBoard, ORDER_TOAST_TIMEOUT, STATUS_TOAST_TIMEOUT};
use crate::tone::{ToneCue, ToneEmitter};
use crate::voice::VoiceAnnouncer;

/// 效果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Tone,
    Voice,
    Toast,
}

/// 已触发的效果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub notification_id: NotificationId,
    pub kind: EffectKind,
}

/// 分发器配置
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub order_toast_timeout: Duration,
    pub status_toast_timeout: Duration,
    /// 为 false 时，baseline 中早于会话开始的通知不触发效果
    pub announce_backlog: bool,
    pub session_started_at: DateTime<Utc>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            order_toast_timeout: ORDER_TOAST_TIMEOUT,
            status_toast_timeout: STATUS_TOAST_TIMEOUT,
            announce_backlog: true,
            session_started_at: Utc::now(),
        }
    }
}

/// 效果分发器
pub struct EffectDispatcher {
    tone: Arc<dyn ToneEmitter>,
    voice: Arc<VoiceAnnouncer>,
    toasts: Arc<ToastBoard>,
    effects: broadcast::Sender<Effect>,
    config: DispatchConfig,
    /// 只增不减，与 store 一样随会话结束整体丢弃
    fired: Mutex<HashSet<NotificationId>>,
}

impl EffectDispatcher {
    pub fn new(
        tone: Arc<dyn ToneEmitter>,
        voice: Arc<VoiceAnnouncer>,
        toasts: Arc<ToastBoard>,
        effects: broadcast::Sender<Effect>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            tone,
            voice,
            toasts,
            effects,
            config,
            fired: Mutex::new(HashSet::new()),
        }
    }

    /// 处理一个 delta，返回触发了效果的通知数
    ///
    /// 按 id 升序处理，连续新订单时最后播报的是最新一单。
    pub fn handle_delta(&self, delta: &DeltaEvent) -> usize {
        let mut handled = 0;
        for notification in delta.notifications.iter().rev() {
            if notification.read {
                continue;
            }
            if delta.baseline && self.is_backlog(notification) {
                debug!(notification_id = notification.id, "Skipping effects for backlog notification");
                continue;
            }
            let first_time = self
                .fired
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(notification.id);
            if !first_time {
                debug!(notification_id = notification.id, "Effects already fired, skipping");
                continue;
            }
            if self.fire(notification) {
                handled += 1;
            }
        }
        handled
    }

    fn is_backlog(&self, notification: &Notification) -> bool {
        !self.config.announce_backlog && notification.created_at < self.config.session_started_at
    }

    fn fire(&self, notification: &Notification) -> bool {
        match notification.kind {
            NotificationType::NewOrder => {
                info!(notification_id = notification.id, "New order received");

                match self.tone.play(&ToneCue::new_order()) {
                    Ok(()) => self.emit(notification.id, EffectKind::Tone),
                    Err(e) => warn!(error = %e, emitter = self.tone.name(), "Failed to play tone"),
                }

                if self.voice.is_enabled() {
                    let voice = Arc::clone(&self.voice);
                    let target = notification.clone();
                    tokio::spawn(async move {
                        let outcome = voice.announce(&target).await;
                        debug!(notification_id = target.id, outcome = ?outcome, "Announcement finished");
                    });
                    self.emit(notification.id, EffectKind::Voice);
                }

                self.toasts
                    .show(Toast::order(notification, self.config.order_toast_timeout));
                self.emit(notification.id, EffectKind::Toast);
                true
            }
            NotificationType::OrderStatusUpdate => {
                self.toasts
                    .show(Toast::info(notification, self.config.status_toast_timeout));
                self.emit(notification.id, EffectKind::Toast);
                true
            }
            NotificationType::Generic => false,
        }
    }

    fn emit(&self, notification_id: NotificationId, kind: EffectKind) {
        let _ = self.effects.send(Effect {
            notification_id,
            kind,
        });
    }

    /// 消费 delta 流直到取消
    pub async fn run(self: Arc<Self>, mut deltas: broadcast::Receiver<DeltaEvent>, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = deltas.recv() => received,
            };
            match received {
                Ok(delta) => {
                    self.handle_delta(&delta);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Effect dispatcher lagged behind, some alerts were dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Effect dispatcher stopped");
    }
}
