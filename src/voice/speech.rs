//! 语音合成能力

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// 语音合成引擎
///
/// `speak` 返回的 future 被 drop 即视为取消，实现必须在 drop 时停止发声。
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    /// 当前环境是否可用
    fn is_available(&self) -> bool;

    /// 朗读并等待结束
    async fn speak(&self, text: &str) -> Result<()>;
}

/// 不可用的引擎（无语音环境）
#[derive(Debug, Default)]
pub struct NullSpeechEngine;

#[async_trait]
impl SpeechEngine for NullSpeechEngine {
    fn name(&self) -> &str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn speak(&self, _text: &str) -> Result<()> {
        bail!("speech synthesis is not available")
    }
}

/// 已知的命令行 TTS 及其法语参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TtsFlavor {
    Say,
    Espeak,
    SpdSay,
    Custom,
}

impl TtsFlavor {
    fn from_program(name: &str) -> Self {
        match name {
            "say" => TtsFlavor::Say,
            "espeak" | "espeak-ng" => TtsFlavor::Espeak,
            "spd-say" => TtsFlavor::SpdSay,
            _ => TtsFlavor::Custom,
        }
    }

    fn args<'a>(&self, text: &'a str) -> Vec<&'a str> {
        match self {
            TtsFlavor::Say => vec!["-v", "Thomas", text],
            TtsFlavor::Espeak => vec!["-v", "fr", text],
            // -w: 等待朗读结束
            TtsFlavor::SpdSay => vec!["-l", "fr", "-w", text],
            TtsFlavor::Custom => vec![text],
        }
    }
}

const TTS_CANDIDATES: &[&str] = &["say", "espeak-ng", "espeak", "spd-say"];

/// 调用系统 TTS 命令
#[derive(Debug, Clone)]
pub struct CommandSpeechEngine {
    program: PathBuf,
    flavor: TtsFlavor,
}

impl CommandSpeechEngine {
    /// 在 PATH 中查找可用的 TTS 命令；`preferred` 优先
    pub fn detect(preferred: Option<&str>) -> Option<Self> {
        let candidates = preferred.into_iter().chain(TTS_CANDIDATES.iter().copied());
        for candidate in candidates {
            if let Ok(path) = which::which(candidate) {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(candidate)
                    .to_string();
                info!(engine = %path.display(), "Detected speech engine");
                return Some(Self {
                    program: path,
                    flavor: TtsFlavor::from_program(&name),
                });
            }
        }
        None
    }
}

#[async_trait]
impl SpeechEngine for CommandSpeechEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn is_available(&self) -> bool {
        self.program.exists()
    }

    async fn speak(&self, text: &str) -> Result<()> {
        debug!(program = %self.program.display(), chars = text.chars().count(), "Speaking");
        let status = Command::new(&self.program)
            .args(self.flavor.args(text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.program.display()))?;

        if !status.success() {
            bail!("{} exited with {}", self.program.display(), status);
        }
        Ok(())
    }
}
