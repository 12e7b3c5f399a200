//! 轮询对账 - 定时拉取完整列表并走同一条 ingest 路径
//!
//! 不是推送断开时的兜底，而是一直运行的一致性保障：推送漏发、乱序、
//! 静默丢失都会在下一次轮询时补齐。单次失败只记日志，循环继续。

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::NotificationApi;
use super::backoff::PollBackoff;
use super::store::{IngestSource, NotificationStore};

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// 轮询对账器
pub struct PollReconciler {
    api: Arc<dyn NotificationApi>,
    store: Arc<NotificationStore>,
    interval: Duration,
    /// `None` 时固定间隔，失败也不退避
    backoff: Option<PollBackoff>,
    consecutive_failures: u32,
}

impl PollReconciler {
    pub fn new(api: Arc<dyn NotificationApi>, store: Arc<NotificationStore>) -> Self {
        Self {
            api,
            store,
            interval: DEFAULT_POLL_INTERVAL,
            backoff: None,
            consecutive_failures: 0,
        }
    }

    /// 设置轮询间隔
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// 启用失败退避
    pub fn with_backoff(mut self, backoff: Option<PollBackoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// 单次对账，返回新通知数量
    pub async fn tick(&mut self) -> Result<usize> {
        let batch = self.api.fetch_notifications().await?;
        let delta = self.store.ingest(batch, IngestSource::Poll);
        if !delta.is_empty() {
            info!(new = delta.len(), "Poll found new notifications");
        }
        self.store.flush_pending_acks().await;
        Ok(delta.len())
    }

    /// 下一次等待时长
    pub fn next_wait(&self) -> Duration {
        match &self.backoff {
            Some(backoff) => backoff.next_interval(self.interval, self.consecutive_failures),
            None => self.interval,
        }
    }

    /// 立即执行一次，之后按间隔循环，直到取消
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(interval_secs = self.interval.as_secs(), "Poll reconciler started");
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.tick() => result,
            };

            match result {
                Ok(_) => self.consecutive_failures = 0,
                Err(e) => {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        failures = self.consecutive_failures,
                        "Notification poll failed, keeping last known state"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.next_wait()) => {}
            }
        }
        debug!("Poll reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::model::{Notification, NotificationId, NotificationType};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedApi {
        responses: Mutex<Vec<Result<Vec<Notification>>>>,
    }

    #[async_trait]
    impl NotificationApi for ScriptedApi {
        async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                responses.remove(0)
            }
        }

        async fn acknowledge_read(&self, _ids: Option<&[NotificationId]>) -> Result<()> {
            Ok(())
        }
    }

    fn order(id: NotificationId) -> Notification {
        Notification::new(id, NotificationType::NewOrder)
    }

    #[tokio::test]
    async fn test_tick_ingests_full_list() {
        let store = Arc::new(NotificationStore::new());
        let api = Arc::new(ScriptedApi {
            responses: Mutex::new(vec![Ok(vec![order(1), order(2)]), Ok(vec![order(1), order(2), order(3)])]),
        });
        let mut poller = PollReconciler::new(api, store.clone());

        assert_eq!(poller.tick().await.unwrap(), 2);
        assert_eq!(poller.tick().await.unwrap(), 1);
        assert_eq!(store.get_state().notifications.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_store_state() {
        let store = Arc::new(NotificationStore::new());
        let api = Arc::new(ScriptedApi {
            responses: Mutex::new(vec![Ok(vec![order(1)]), Err(anyhow!("timeout"))]),
        });
        let mut poller = PollReconciler::new(api, store.clone());

        poller.tick().await.unwrap();
        assert!(poller.tick().await.is_err());
        assert_eq!(store.get_state().notifications.len(), 1);
    }

    #[test]
    fn test_next_wait_is_fixed_without_backoff() {
        let store = Arc::new(NotificationStore::new());
        let api = Arc::new(ScriptedApi {
            responses: Mutex::new(Vec::new()),
        });
        let mut poller = PollReconciler::new(api, store);
        poller.consecutive_failures = 10;
        assert_eq!(poller.next_wait(), DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failures_and_keeps_polling() {
        let store = Arc::new(NotificationStore::new());
        let api = Arc::new(ScriptedApi {
            responses: Mutex::new(vec![
                Err(anyhow!("dns")),
                Err(anyhow!("dns")),
                Ok(vec![order(7)]),
            ]),
        });
        let poller = PollReconciler::new(api, store.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.get_state().notifications.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
