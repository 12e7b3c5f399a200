//! 提示音 - 程序化合成，不依赖音频素材
//!
//! 提示音是几个短正弦音符（带淡入淡出避免爆音），渲染成 16-bit PCM，
//! 再封装为 WAV 交给系统播放器。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub const SAMPLE_RATE: u32 = 22_050;
const FADE_MS: u32 = 5;

/// 单个音符
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub frequency_hz: f32,
    pub duration_ms: u32,
}

/// 提示音序列
#[derive(Debug, Clone, PartialEq)]
pub struct ToneCue {
    pub notes: Vec<Note>,
    /// 音符间静音
    pub gap_ms: u32,
    /// 0.0 - 1.0
    pub volume: f32,
}

impl ToneCue {
    /// 新订单：A5 → D6 → G6 上行三音
    pub fn new_order() -> Self {
        Self {
            notes: vec![
                Note { frequency_hz: 880.0, duration_ms: 120 },
                Note { frequency_hz: 1174.66, duration_ms: 120 },
                Note { frequency_hz: 1567.98, duration_ms: 180 },
            ],
            gap_ms: 40,
            volume: 0.4,
        }
    }

    pub fn duration_ms(&self) -> u32 {
        let notes: u32 = self.notes.iter().map(|n| n.duration_ms).sum();
        let gaps = self.gap_ms * self.notes.len().saturating_sub(1) as u32;
        notes + gaps
    }

    /// 渲染为单声道 16-bit PCM
    pub fn synthesize(&self, sample_rate: u32) -> Vec<i16> {
        let per_ms = sample_rate as f32 / 1000.0;
        let gap_samples = (self.gap_ms as f32 * per_ms) as usize;
        let fade_samples = (FADE_MS as f32 * per_ms) as usize;
        let amplitude = self.volume.clamp(0.0, 1.0) * i16::MAX as f32;
        let mut samples = Vec::with_capacity((self.duration_ms() as f32 * per_ms) as usize);

        for (index, note) in self.notes.iter().enumerate() {
            if index > 0 {
                samples.extend(std::iter::repeat(0i16).take(gap_samples));
            }
            let count = (note.duration_ms as f32 * per_ms) as usize;
            let fade = fade_samples.min(count / 2).max(1);
            for i in 0..count {
                let t = i as f32 / sample_rate as f32;
                let envelope = if i < fade {
                    i as f32 / fade as f32
                } else if i >= count - fade {
                    (count - i) as f32 / fade as f32
                } else {
                    1.0
                };
                let value = (2.0 * std::f32::consts::PI * note.frequency_hz * t).sin();
                samples.push((value * envelope * amplitude) as i16);
            }
        }

        samples
    }

    /// 封装为 WAV（RIFF/PCM）
    pub fn to_wav(&self, sample_rate: u32) -> Vec<u8> {
        let samples = self.synthesize(sample_rate);
        let data_len = (samples.len() * 2) as u32;
        let mut wav = Vec::with_capacity(44 + data_len as usize);

        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&sample_rate.to_le_bytes());
        wav.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            wav.extend_from_slice(&sample.to_le_bytes());
        }

        wav
    }
}

/// 提示音播放能力
pub trait ToneEmitter: Send + Sync {
    fn name(&self) -> &str;

    /// 播放（立即返回，不等待播放结束）
    fn play(&self, cue: &ToneCue) -> Result<()>;
}

/// 无声实现（无音频环境、测试）
#[derive(Debug, Default)]
pub struct NullToneEmitter;

impl ToneEmitter for NullToneEmitter {
    fn name(&self) -> &str {
        "null"
    }

    fn play(&self, cue: &ToneCue) -> Result<()> {
        debug!(duration_ms = cue.duration_ms(), "Tone skipped (no audio output)");
        Ok(())
    }
}

/// 系统播放器候选，按优先级
const PLAYER_CANDIDATES: &[&str] = &["paplay", "aplay", "afplay"];

/// 通过系统播放器播放
///
/// 每次播放写入独立的临时 WAV，由后台任务等待播放器退出后回收进程并删除文件。
/// 需要在 tokio 运行时内调用。
#[derive(Debug)]
pub struct CommandToneEmitter {
    program: PathBuf,
    scratch_dir: PathBuf,
    next_cue: AtomicU64,
}

impl CommandToneEmitter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scratch_dir: std::env::temp_dir(),
            next_cue: AtomicU64::new(0),
        }
    }

    /// 在 PATH 中查找可用播放器；`preferred` 优先
    pub fn detect(preferred: Option<&str>) -> Option<Self> {
        let candidates = preferred.into_iter().chain(PLAYER_CANDIDATES.iter().copied());
        for candidate in candidates {
            if let Ok(path) = which::which(candidate) {
                info!(player = %path.display(), "Detected audio player");
                return Some(Self::new(path));
            }
        }
        None
    }

    fn next_cue_path(&self) -> PathBuf {
        let seq = self.next_cue.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("vnotify-cue-{}-{}.wav", std::process::id(), seq))
    }
}

impl ToneEmitter for CommandToneEmitter {
    fn name(&self) -> &str {
        "command"
    }

    fn play(&self, cue: &ToneCue) -> Result<()> {
        let runtime = Handle::try_current().context("Tone playback requires a tokio runtime")?;
        let program = self.program.clone();
        let path = self.next_cue_path();
        let wav = cue.to_wav(SAMPLE_RATE);

        runtime.spawn(async move {
            match play_file(&program, &path, wav).await {
                Ok(status) if !status.success() => {
                    warn!(player = %program.display(), %status, "Audio player exited with failure")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to play tone"),
            }
        });
        Ok(())
    }
}

/// 写入 WAV、运行播放器并等待退出，结束后删除临时文件
async fn play_file(program: &Path, path: &Path, wav: Vec<u8>) -> Result<ExitStatus> {
    tokio::fs::write(path, wav)
        .await
        .with_context(|| format!("Failed to write tone cue to {}", path.display()))?;

    let result = async {
        let mut child = Command::new(program)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;
        child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", program.display()))
    }
    .await;

    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(error = %e, path = %path.display(), "Failed to remove tone cue");
    }
    result
}
