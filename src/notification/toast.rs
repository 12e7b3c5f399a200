//! Toast 面板 - 可见提示及其自动消失计时
//!
//! 只管理状态和计时，渲染由表现层订阅 [`ToastEvent`] 完成。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::model::{Notification, NotificationId};

/// 新订单提示默认停留时长
pub const ORDER_TOAST_TIMEOUT: Duration = Duration::from_secs(10);
/// 状态变化提示默认停留时长
pub const STATUS_TOAST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    /// 新订单，带"查看订单"操作
    Order,
    /// 轻量提示
    Info,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Toast {
    pub notification_id: NotificationId,
    pub level: ToastLevel,
    pub title: String,
    pub message: String,
    pub timeout: Duration,
}

impl Toast {
    pub fn order(notification: &Notification, timeout: Duration) -> Self {
        Self {
            notification_id: notification.id,
            level: ToastLevel::Order,
            title: notification.title.clone(),
            message: notification.message.clone(),
            timeout,
        }
    }

    pub fn info(notification: &Notification, timeout: Duration) -> Self {
        Self {
            notification_id: notification.id,
            level: ToastLevel::Info,
            title: notification.title.clone(),
            message: notification.message.clone(),
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    Timeout,
    User,
    ViewOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToastEvent {
    Shown(Toast),
    Dismissed {
        notification_id: NotificationId,
        reason: DismissReason,
    },
}

struct VisibleToast {
    generation: u64,
    cancel: CancellationToken,
}

/// Toast 面板
pub struct ToastBoard {
    visible: Mutex<HashMap<NotificationId, VisibleToast>>,
    next_generation: Mutex<u64>,
    events: broadcast::Sender<ToastEvent>,
}

impl ToastBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            visible: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToastEvent> {
        self.events.subscribe()
    }

    /// 显示提示并启动自动消失计时；同一通知重复显示时替换旧计时
    pub fn show(self: &Arc<Self>, toast: Toast) {
        let id = toast.notification_id;
        let timeout = toast.timeout;
        let cancel = CancellationToken::new();
        let generation = {
            let mut next = self.next_generation.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };

        {
            let mut visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = visible.insert(
                id,
                VisibleToast {
                    generation,
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
            }
        }
        let _ = self.events.send(ToastEvent::Shown(toast));

        let board = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if board.remove_generation(id, generation) {
                        debug!(notification_id = id, "Toast auto-dismissed");
                        board.emit_dismissed(id, DismissReason::Timeout);
                    }
                }
            }
        });
    }

    /// 用户关闭
    pub fn dismiss(&self, id: NotificationId) -> bool {
        self.close(id, DismissReason::User)
    }

    /// 用户点击"查看订单"
    pub fn view_order(&self, id: NotificationId) -> bool {
        self.close(id, DismissReason::ViewOrder)
    }

    /// 取消所有计时，不发事件
    pub fn clear(&self) {
        let mut visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
        for (_, toast) in visible.drain() {
            toast.cancel.cancel();
        }
    }

    pub fn visible_ids(&self) -> Vec<NotificationId> {
        let visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = visible.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    fn close(&self, id: NotificationId, reason: DismissReason) -> bool {
        let removed = {
            let mut visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
            visible.remove(&id)
        };
        match removed {
            Some(toast) => {
                toast.cancel.cancel();
                self.emit_dismissed(id, reason);
                true
            }
            None => false,
        }
    }

    fn remove_generation(&self, id: NotificationId, generation: u64) -> bool {
        let mut visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
        match visible.get(&id) {
            Some(toast) if toast.generation == generation => {
                visible.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn emit_dismissed(&self, id: NotificationId, reason: DismissReason) {
        let _ = self.events.send(ToastEvent::Dismissed {
            notification_id: id,
            reason,
        });
    }
}

impl Default for ToastBoard {
    fn default() -> Self {
        Self::new()
    }
}
