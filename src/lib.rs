//! Vendor Notify - 商家端实时通知引擎
//!
//! 推送 + 轮询双通道接收订单通知，在单一 store 中去重对账，
//! 对每条新通知只触发一次提示音、语音播报和 toast。

pub mod config;
pub mod engine;
pub mod notification;
pub mod tone;
pub mod voice;

pub use config::EngineConfig;
pub use engine::{Capabilities, NotificationEngine};
pub use notification::{
    ConnectionState, DeltaEvent, Effect, EffectKind, IngestSource, Notification, NotificationApi,
    NotificationId, NotificationStore, NotificationType, OrderSummary, PushTransport, ReadState,
    ReconnectPolicy, StoreSnapshot, Subscription, Toast, ToastBoard, ToastEvent,
};
pub use tone::{CommandToneEmitter, NullToneEmitter, ToneCue, ToneEmitter};
pub use voice::{CommandSpeechEngine, NullSpeechEngine, SpeakOutcome, SpeechEngine, VoiceAnnouncer, VoiceEvent};
