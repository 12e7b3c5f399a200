//! 语音播报器
//!
//! ## 策略
//! - 默认关闭，开关只在本次会话有效
//! - 先取消再播报：新播报会打断正在进行的播报，不排队
//! - 引擎不可用或出错时只记日志，不向调用方抛错
//!
//! 状态：`idle → speaking → idle`。提前回到 idle 只有一种方式：显式取消
//! （新播报或 `stop`）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::speech::SpeechEngine;
use super::template::{order_announcement, DEFAULT_CURRENCY};
use crate::notification::model::Notification;

/// 播报状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Speaking,
}

/// 单次播报编号
pub type UtteranceId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Started { utterance: UtteranceId, text: String },
    Completed { utterance: UtteranceId },
    Cancelled { utterance: UtteranceId },
    Failed { utterance: UtteranceId },
}

/// `speak` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    Completed,
    /// 被新播报或 stop 打断
    Cancelled,
    /// 播报开关关闭
    Disabled,
    /// 引擎不可用
    Unavailable,
    Failed,
}

struct Current {
    state: VoiceState,
    utterance: UtteranceId,
    cancel: Option<CancellationToken>,
}

/// 语音播报器
pub struct VoiceAnnouncer {
    engine: Arc<dyn SpeechEngine>,
    enabled: AtomicBool,
    current: Mutex<Current>,
    events: broadcast::Sender<VoiceEvent>,
    currency: String,
}

impl VoiceAnnouncer {
    pub fn new(engine: Arc<dyn SpeechEngine>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            engine,
            enabled: AtomicBool::new(false),
            current: Mutex::new(Current {
                state: VoiceState::Idle,
                utterance: 0,
                cancel: None,
            }),
            events,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    /// 设置金额单位
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 打开/关闭播报；关闭时停止当前播报
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        debug!(enabled, "Voice announcements toggled");
        if !enabled {
            self.stop();
        }
    }

    pub fn state(&self) -> VoiceState {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// 播报新订单（开关关闭时不调用引擎）
    pub async fn announce(&self, notification: &Notification) -> SpeakOutcome {
        if !self.is_enabled() {
            return SpeakOutcome::Disabled;
        }
        let text = order_announcement(notification, &self.currency);
        self.speak(&text).await
    }

    /// 朗读任意文本，打断正在进行的播报，等待结束或被取消
    pub async fn speak(&self, text: &str) -> SpeakOutcome {
        if !self.engine.is_available() {
            warn!(engine = self.engine.name(), "Speech synthesis unavailable, skipping announcement");
            return SpeakOutcome::Unavailable;
        }

        let (utterance, cancel) = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = current.cancel.take() {
                previous.cancel();
            }
            current.utterance += 1;
            current.state = VoiceState::Speaking;
            let cancel = CancellationToken::new();
            current.cancel = Some(cancel.clone());
            (current.utterance, cancel)
        };
        let _ = self.events.send(VoiceEvent::Started {
            utterance,
            text: text.to_string(),
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => SpeakOutcome::Cancelled,
            result = self.engine.speak(text) => match result {
                Ok(()) => SpeakOutcome::Completed,
                Err(e) => {
                    warn!(error = %e, utterance, "Speech synthesis failed");
                    SpeakOutcome::Failed
                }
            },
        };

        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.utterance == utterance {
                current.state = VoiceState::Idle;
                current.cancel = None;
            }
        }

        let event = match outcome {
            SpeakOutcome::Completed => VoiceEvent::Completed { utterance },
            SpeakOutcome::Cancelled => VoiceEvent::Cancelled { utterance },
            _ => VoiceEvent::Failed { utterance },
        };
        let _ = self.events.send(event);
        outcome
    }

    /// 停止当前播报
    pub fn stop(&self) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cancel) = current.cancel.take() {
            cancel.cancel();
        }
        current.state = VoiceState::Idle;
    }
}
