//! 引擎配置
//!
//! 读取优先级：
//! 1. 环境变量 `VNOTIFY_API_URL` / `VNOTIFY_POLL_INTERVAL_SECS` / `VNOTIFY_VOICE`
//! 2. 配置文件 `~/.config/vendor-notify/config.json`
//! 3. 默认值

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::notification::backoff::{PollBackoff, ReconnectPolicy};

pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub push_path: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub reconnect: ReconnectPolicy,
    pub poll_backoff: Option<PollBackoff>,
    pub toast_timeout_secs: u64,
    pub status_toast_timeout_secs: u64,
    pub voice_enabled: bool,
    /// 为 false 时，连接时已存在的历史通知不提示
    pub announce_backlog: bool,
    pub currency_label: String,
    /// 指定 TTS 命令（默认自动检测）
    pub speech_command: Option<String>,
    /// 指定音频播放命令（默认自动检测）
    pub tone_command: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            push_path: "/notifications/stream".to_string(),
            poll_interval_secs: 5,
            request_timeout_secs: 10,
            reconnect: ReconnectPolicy::default(),
            poll_backoff: None,
            toast_timeout_secs: 10,
            status_toast_timeout_secs: 5,
            voice_enabled: false,
            announce_backlog: true,
            currency_label: "euros".to_string(),
            speech_command: None,
            tone_command: None,
        }
    }
}

impl EngineConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("vendor-notify")
            .join("config.json")
    }

    /// 从默认路径加载并应用环境变量
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// 从指定路径加载（文件不存在时用默认值）并应用环境变量
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: EngineConfig = serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            debug!(path = %path.display(), "Loaded config file");
            config
        } else {
            EngineConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// 环境变量覆盖（注入读取函数便于测试）
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("VNOTIFY_API_URL").filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(secs) = get("VNOTIFY_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.poll_interval_secs = secs;
        }
        if let Some(voice) = get("VNOTIFY_VOICE") {
            self.voice_enabled = matches!(voice.to_lowercase().as_str(), "1" | "true" | "on" | "yes");
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn toast_timeout(&self) -> Duration {
        Duration::from_secs(self.toast_timeout_secs)
    }

    pub fn status_toast_timeout(&self) -> Duration {
        Duration::from_secs(self.status_toast_timeout_secs)
    }
}
