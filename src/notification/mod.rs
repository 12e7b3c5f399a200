//! 通知层 - 推送、轮询对账、状态存储与效果分发
//!
//! 数据流：
//! ```text
//! PushChannel ──┐
//!               ├─> NotificationStore::ingest ──delta──> EffectDispatcher ──> 提示音 / 语音 / toast
//! PollReconciler┘            │
//!                            └──snapshot──> 订阅者（列表、未读数、连接状态）
//! ```

pub mod api;
pub mod backoff;
pub mod dispatcher;
pub mod model;
pub mod poller;
pub mod push;
pub mod sse;
pub mod store;
pub mod toast;

pub use api::{HttpApiConfig, HttpNotificationApi, NotificationApi, PushStream, PushTransport};
pub use backoff::{PollBackoff, ReconnectPolicy};
pub use dispatcher::{DispatchConfig, Effect, EffectDispatcher, EffectKind};
pub use model::{ConnectionState, Notification, NotificationId, NotificationType, OrderSummary};
pub use poller::PollReconciler;
pub use push::{decode_event, DecodeError, PushChannel, PushOutcome};
pub use store::{DeltaEvent, IngestSource, NotificationStore, ReadState, StoreSnapshot, Subscription};
pub use toast::{DismissReason, Toast, ToastBoard, ToastEvent, ToastLevel};
