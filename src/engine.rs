//! 通知引擎 - 会话生命周期
//!
//! 由应用根创建并持有。一次 `connect` 对应一个会话：推送通道、轮询对账、
//! 效果分发三个任务挂在同一个会话取消令牌下，`disconnect` 一次性收回。

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::notification::api::{HttpApiConfig, HttpNotificationApi, NotificationApi, PushTransport};
use crate::notification::dispatcher::{DispatchConfig, Effect, EffectDispatcher};
use crate::notification::model::NotificationId;
use crate::notification::poller::PollReconciler;
use crate::notification::push::{PushChannel, PushOutcome};
use crate::notification::store::NotificationStore;
use crate::notification::toast::ToastBoard;
use crate::tone::{CommandToneEmitter, NullToneEmitter, ToneEmitter};
use crate::voice::{CommandSpeechEngine, NullSpeechEngine, SpeechEngine, VoiceAnnouncer};

const EFFECT_CHANNEL_CAPACITY: usize = 128;

/// 平台能力（提示音、语音合成）
#[derive(Clone)]
pub struct Capabilities {
    pub tone: Arc<dyn ToneEmitter>,
    pub speech: Arc<dyn SpeechEngine>,
}

impl Capabilities {
    /// 探测本机可用的播放器和 TTS，找不到时退化为无声实现
    pub fn detect(config: &EngineConfig) -> Self {
        let tone: Arc<dyn ToneEmitter> = match CommandToneEmitter::detect(config.tone_command.as_deref()) {
            Some(emitter) => Arc::new(emitter),
            None => {
                warn!("No audio player found, new-order tone disabled");
                Arc::new(NullToneEmitter)
            }
        };
        let speech: Arc<dyn SpeechEngine> =
            match CommandSpeechEngine::detect(config.speech_command.as_deref()) {
                Some(engine) => Arc::new(engine),
                None => {
                    warn!("No speech synthesis command found, voice announcements unavailable");
                    Arc::new(NullSpeechEngine)
                }
            };
        Self { tone, speech }
    }

    pub fn headless() -> Self {
        Self {
            tone: Arc::new(NullToneEmitter),
            speech: Arc::new(NullSpeechEngine),
        }
    }
}

struct Session {
    cancel: CancellationToken,
    push: Arc<PushChannel>,
    push_task: JoinHandle<PushOutcome>,
    tasks: Vec<JoinHandle<()>>,
}

/// 通知引擎
pub struct NotificationEngine {
    config: EngineConfig,
    store: Arc<NotificationStore>,
    voice: Arc<VoiceAnnouncer>,
    toasts: Arc<ToastBoard>,
    tone: Arc<dyn ToneEmitter>,
    effects: broadcast::Sender<Effect>,
    session: Mutex<Option<Session>>,
}

impl NotificationEngine {
    pub fn new(config: EngineConfig, capabilities: Capabilities) -> Self {
        let voice = VoiceAnnouncer::new(capabilities.speech).with_currency(config.currency_label.clone());
        voice.set_enabled(config.voice_enabled);
        let (effects, _) = broadcast::channel(EFFECT_CHANNEL_CAPACITY);

        Self {
            store: Arc::new(NotificationStore::new()),
            voice: Arc::new(voice),
            toasts: Arc::new(ToastBoard::new()),
            tone: capabilities.tone,
            effects,
            session: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn voice(&self) -> &Arc<VoiceAnnouncer> {
        &self.voice
    }

    pub fn toasts(&self) -> &Arc<ToastBoard> {
        &self.toasts
    }

    /// 已触发效果的流
    pub fn effects(&self) -> broadcast::Receiver<Effect> {
        self.effects.subscribe()
    }

    /// 用 bearer token 连接后端
    pub async fn connect(&self, token: &str) -> Result<()> {
        let api = Arc::new(HttpNotificationApi::new(HttpApiConfig {
            base_url: self.config.api_base_url.clone(),
            token: token.to_string(),
            push_path: self.config.push_path.clone(),
            timeout: self.config.request_timeout(),
        })?);
        self.connect_with(api.clone(), api).await;
        Ok(())
    }

    /// 用给定的 API 和推送传输开始会话，已有会话先被拆除
    pub async fn connect_with(&self, api: Arc<dyn NotificationApi>, transport: Arc<dyn PushTransport>) {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            info!("Replacing active notification session");
            self.teardown(previous).await;
        }

        self.store.attach_api(api.clone());
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // 先订阅 delta，保证第一批通知不会在分发器就绪前发出
        let deltas = self.store.subscribe_deltas();
        let dispatcher = Arc::new(EffectDispatcher::new(
            self.tone.clone(),
            self.voice.clone(),
            self.toasts.clone(),
            self.effects.clone(),
            DispatchConfig {
                order_toast_timeout: self.config.toast_timeout(),
                status_toast_timeout: self.config.status_toast_timeout(),
                announce_backlog: self.config.announce_backlog,
                session_started_at: Utc::now(),
            },
        ));
        tasks.push(tokio::spawn(dispatcher.run(deltas, cancel.child_token())));

        let poller = PollReconciler::new(api, self.store.clone())
            .with_interval(self.config.poll_interval())
            .with_backoff(self.config.poll_backoff.clone());
        tasks.push(tokio::spawn(poller.run(cancel.child_token())));

        let push = Arc::new(PushChannel::new(
            transport,
            self.store.clone(),
            self.config.reconnect.clone(),
        ));
        let push_task = spawn_push(&push, cancel.child_token());

        info!(api = %self.config.api_base_url, "Notification session started");
        *slot = Some(Session {
            cancel,
            push,
            push_task,
            tasks,
        });
    }

    /// 结束会话：停止所有任务并清空通知
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                self.teardown(session).await;
                info!("Notification session closed");
            }
            None => debug!("Disconnect called without an active session"),
        }
    }

    /// 推送重连预算耗尽后手动恢复，返回是否重新启动了推送
    pub async fn reconnect(&self) -> bool {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            debug!("Reconnect ignored, no active session");
            return false;
        };
        if !session.push_task.is_finished() {
            debug!("Reconnect ignored, push channel still running");
            return false;
        }
        session.push_task = spawn_push(&session.push, session.cancel.child_token());
        info!("Push channel restarted");
        true
    }

    /// 当前是否有活动会话
    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// 标记已读，`None` 表示全部
    pub async fn mark_read(&self, ids: Option<Vec<NotificationId>>) -> Vec<NotificationId> {
        self.store.mark_read(ids).await
    }

    async fn teardown(&self, session: Session) {
        session.cancel.cancel();
        match session.push_task.await {
            Ok(outcome) => debug!(outcome = ?outcome, "Push task finished"),
            Err(e) => warn!(error = %e, "Push task panicked"),
        }
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task panicked");
            }
        }
        self.voice.stop();
        self.toasts.clear();
        self.store.detach_api();
        self.store.reset();
    }
}

fn spawn_push(push: &Arc<PushChannel>, cancel: CancellationToken) -> JoinHandle<PushOutcome> {
    let push = Arc::clone(push);
    tokio::spawn(async move { push.run(cancel).await })
}
