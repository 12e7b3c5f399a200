//! Vendor Notify CLI
//!
//! 连接商家后端，实时显示订单通知

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use vendor_notify::notification::api::{HttpApiConfig, HttpNotificationApi};
use vendor_notify::{
    Capabilities, ConnectionState, EngineConfig, Notification, NotificationApi, NotificationEngine,
    SpeakOutcome, ToastEvent, VoiceAnnouncer,
};

#[derive(Parser)]
#[command(name = "vnotify")]
#[command(about = "Vendor Notify - 商家端实时订单通知")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/vendor-notify/config.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 覆盖后端地址
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// 登录 token
    #[arg(long, global = true, env = "VNOTIFY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// 开启新订单语音播报
    #[arg(long, global = true)]
    voice: bool,

    /// 不使用提示音和语音
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 连接并持续显示通知，Ctrl+C 退出
    Watch,
    /// 拉取一次通知列表
    List {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 标记已读（不带 ID 时标记全部）
    MarkRead {
        ids: Vec<u64>,
    },
    /// 朗读一段文本（检查语音环境）
    Say {
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vendor_notify=info,vnotify=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    if cli.voice {
        config.voice_enabled = true;
    }

    match cli.command {
        Commands::Watch => {
            let token = require_token(cli.token.as_deref())?;
            let capabilities = if cli.headless {
                Capabilities::headless()
            } else {
                Capabilities::detect(&config)
            };
            watch(NotificationEngine::new(config, capabilities), token).await?;
        }
        Commands::List { json } => {
            let token = require_token(cli.token.as_deref())?;
            let api = http_api(&config, token)?;
            let mut notifications = api.fetch_notifications().await?;
            notifications.sort_by(|a, b| b.id.cmp(&a.id));
            notifications.dedup_by_key(|n| n.id);

            if json {
                println!("{}", serde_json::to_string_pretty(&notifications)?);
            } else {
                let unread = notifications.iter().filter(|n| !n.read).count();
                println!("{} 条通知（{} 条未读）:\n", notifications.len(), unread);
                for n in &notifications {
                    print_notification(n);
                }
            }
        }
        Commands::MarkRead { ids } => {
            let token = require_token(cli.token.as_deref())?;
            let api = http_api(&config, token)?;
            if ids.is_empty() {
                api.acknowledge_read(None).await?;
                println!("已将全部通知标记为已读");
            } else {
                api.acknowledge_read(Some(ids.as_slice())).await?;
                println!("已标记 {} 条通知为已读", ids.len());
            }
        }
        Commands::Say { text } => {
            let capabilities = Capabilities::detect(&config);
            let voice = VoiceAnnouncer::new(capabilities.speech);
            info!(engine = voice.engine_name(), "Speaking");
            match voice.speak(&text).await {
                SpeakOutcome::Completed => {}
                SpeakOutcome::Unavailable => bail!("未找到可用的语音合成命令 (say / espeak-ng / espeak / spd-say)"),
                other => bail!("朗读失败: {:?}", other),
            }
        }
    }

    Ok(())
}

fn require_token(token: Option<&str>) -> Result<&str> {
    match token {
        Some(t) if !t.trim().is_empty() => Ok(t),
        _ => bail!("缺少 token，请使用 --token 或设置 VNOTIFY_TOKEN"),
    }
}

fn http_api(config: &EngineConfig, token: &str) -> Result<HttpNotificationApi> {
    HttpNotificationApi::new(HttpApiConfig {
        base_url: config.api_base_url.clone(),
        token: token.to_string(),
        push_path: config.push_path.clone(),
        timeout: config.request_timeout(),
    })
}

fn print_notification(n: &Notification) {
    let marker = if n.read { " " } else { "●" };
    println!(
        "  {} #{} [{}] {} | {} | {}",
        marker,
        n.id,
        n.kind,
        n.created_at.format("%Y-%m-%d %H:%M"),
        n.title,
        n.message
    );
}

async fn watch(engine: NotificationEngine, token: &str) -> Result<()> {
    let mut toasts = engine.toasts().subscribe();
    let (state_tx, mut state_rx) = tokio::sync::watch::channel((ConnectionState::Disconnected, 0usize));
    let subscription = engine.store().subscribe(move |snapshot| {
        let _ = state_tx.send((snapshot.connection_status, snapshot.unread_count));
    });

    engine.connect(token).await?;
    println!("正在监听通知，按 Ctrl+C 退出");

    let mut last_connection = ConnectionState::Disconnected;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = toasts.recv() => match event {
                Ok(ToastEvent::Shown(toast)) => {
                    println!("\n🔔 {} - {}", toast.title, toast.message);
                }
                Ok(ToastEvent::Dismissed { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Toast display lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let (connection, unread) = *state_rx.borrow_and_update();
                println!("[{}] 未读 {}", connection, unread);
                if connection == ConnectionState::Disconnected && last_connection == ConnectionState::Degraded {
                    warn!("Push channel gave up, polling continues");
                }
                last_connection = connection;
            }
        }
    }

    engine.disconnect().await;
    subscription.unsubscribe();
    Ok(())
}
