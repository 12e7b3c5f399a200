//! 通知 REST 客户端
//!
//! - `GET  {base}/notifications`           → `{notifications: [...]}`（完整列表）
//! - `POST {base}/notifications/mark-read` ← `{notificationIds: [..] | null}`
//! - `GET  {base}{push_path}`              → SSE 推送流

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::model::{Notification, NotificationId};

/// 通知服务端接口
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// 拉取当前完整通知列表
    async fn fetch_notifications(&self) -> Result<Vec<Notification>>;

    /// 确认已读，`None` 表示全部
    async fn acknowledge_read(&self, ids: Option<&[NotificationId]>) -> Result<()>;
}

/// 推送字节流
pub type PushStream = BoxStream<'static, Result<Vec<u8>>>;

/// 推送传输层（打开一条持久连接）
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self) -> Result<PushStream>;
}

#[derive(Debug, Deserialize)]
struct NotificationList {
    #[serde(default)]
    notifications: Vec<Notification>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest<'a> {
    notification_ids: Option<&'a [NotificationId]>,
}

/// HTTP 客户端配置
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub base_url: String,
    pub token: String,
    pub push_path: String,
    pub timeout: Duration,
}

/// 基于 reqwest 的实现
#[derive(Debug, Clone)]
pub struct HttpNotificationApi {
    client: Client,
    /// 推送流不能设置整体超时
    stream_client: Client,
    config: HttpApiConfig,
}

impl HttpNotificationApi {
    pub fn new(config: HttpApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;
        let stream_client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .context("Failed to create streaming HTTP client")?;

        Ok(Self {
            client,
            stream_client,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
        let response = self
            .client
            .get(self.url("/notifications"))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .context("GET /notifications failed")?
            .error_for_status()?;

        let list: NotificationList = response
            .json()
            .await
            .context("Failed to decode notification list")?;
        debug!(count = list.notifications.len(), "Fetched notification list");
        Ok(list.notifications)
    }

    async fn acknowledge_read(&self, ids: Option<&[NotificationId]>) -> Result<()> {
        self.client
            .post(self.url("/notifications/mark-read"))
            .bearer_auth(&self.config.token)
            .json(&MarkReadRequest {
                notification_ids: ids,
            })
            .send()
            .await
            .context("POST /notifications/mark-read failed")?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl PushTransport for HttpNotificationApi {
    async fn open(&self) -> Result<PushStream> {
        let response = self
            .stream_client
            .get(self.url(&self.config.push_path))
            .bearer_auth(&self.config.token)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("Failed to open push stream")?
            .error_for_status()?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(anyhow::Error::from));
        Ok(stream.boxed())
    }
}
