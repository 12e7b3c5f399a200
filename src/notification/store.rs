//! 通知存储 - 会话内的权威通知状态机
//!
//! 推送和轮询两条链路都通过 [`NotificationStore::ingest`] 写入。所有变更串行经过
//! `dispatch` 锁：状态修改、快照构建、delta 广播、监听器回调在同一临界区内完成，
//! 因此监听器看到的快照顺序与变更顺序一致。
//!
//! ## 读状态规则
//! - 新 id：采用服务端的 `read` 值
//! - 已知 id：忽略批次中的 `read` 字段，本地已读永不回退为未读
//! - 已知且未读的 id：刷新展示字段（标题、内容、订单快照）
//! - 已知且已读的 id：完全不动
//!
//! 监听器回调期间持有 `dispatch` 锁，回调内不能再调用 `ingest` / `mark_read` /
//! `subscribe`，读取 `get_state` 和取消订阅是安全的。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::api::NotificationApi;
use super::model::{ConnectionState, Notification, NotificationId};

const DELTA_CHANNEL_CAPACITY: usize = 256;

/// 读状态（本地暂定 / 服务端已确认）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Unread,
    /// 本地已标记，确认请求未成功
    Tentative,
    /// 服务端已确认
    Confirmed,
}

impl ReadState {
    pub fn is_read(&self) -> bool {
        !matches!(self, ReadState::Unread)
    }
}

/// 数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Push,
    Poll,
}

/// 新通知增量（只包含此前未知的 id）
#[derive(Debug, Clone)]
pub struct DeltaEvent {
    pub source: IngestSource,
    /// 会话内第一次轮询的结果（历史通知）
    pub baseline: bool,
    /// 按 id 降序
    pub notifications: Arc<Vec<Notification>>,
}

/// 不可变快照
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    /// 按 id 降序
    pub notifications: Arc<Vec<Notification>>,
    pub unread_count: usize,
    /// 本地已读但服务端尚未确认的数量
    pub pending_ack_count: usize,
    pub connection_status: ConnectionState,
    /// 每次变更递增
    pub version: u64,
}

impl StoreSnapshot {
    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.notifications.iter().find(|n| n.id == id)
    }
}

pub type Listener = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    notification: Notification,
    read_state: ReadState,
}

impl Entry {
    /// 刷新展示字段，返回是否有变化
    fn refresh(&mut self, incoming: &Notification) -> bool {
        let current = &mut self.notification;
        if current.title == incoming.title
            && current.message == incoming.message
            && current.payload == incoming.payload
        {
            return false;
        }
        current.title = incoming.title.clone();
        current.message = incoming.message.clone();
        current.payload = incoming.payload.clone();
        true
    }

    fn view(&self) -> Notification {
        let mut n = self.notification.clone();
        n.read = self.read_state.is_read();
        n
    }
}

struct StoreState {
    entries: BTreeMap<NotificationId, Entry>,
    connection: ConnectionState,
    version: u64,
    baseline_done: bool,
}

impl StoreState {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            connection: ConnectionState::Disconnected,
            version: 0,
            baseline_done: false,
        }
    }

    fn snapshot(&self) -> StoreSnapshot {
        let notifications: Vec<Notification> = self.entries.values().rev().map(Entry::view).collect();
        let unread_count = self
            .entries
            .values()
            .filter(|e| e.read_state == ReadState::Unread)
            .count();
        let pending_ack_count = self
            .entries
            .values()
            .filter(|e| e.read_state == ReadState::Tentative)
            .count();
        StoreSnapshot {
            notifications: Arc::new(notifications),
            unread_count,
            pending_ack_count,
            connection_status: self.connection,
            version: self.version,
        }
    }
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// 订阅句柄
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl Subscription {
    /// 取消订阅
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// 通知存储
pub struct NotificationStore {
    dispatch: Mutex<()>,
    state: Mutex<StoreState>,
    registry: Arc<Mutex<ListenerRegistry>>,
    deltas: broadcast::Sender<DeltaEvent>,
    api: Mutex<Option<Arc<dyn NotificationApi>>>,
}

impl NotificationStore {
    pub fn new() -> Self {
        let (deltas, _) = broadcast::channel(DELTA_CHANNEL_CAPACITY);
        Self {
            dispatch: Mutex::new(()),
            state: Mutex::new(StoreState::new()),
            registry: Arc::new(Mutex::new(ListenerRegistry::default())),
            deltas,
            api: Mutex::new(None),
        }
    }

    /// 合并一批通知，返回此前未知的通知（按 id 降序）
    pub fn ingest(&self, batch: Vec<Notification>, source: IngestSource) -> Vec<Notification> {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let (delta, baseline, snapshot) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut delta = Vec::new();
            let mut changed = false;

            for incoming in batch {
                match state.entries.get_mut(&incoming.id) {
                    None => {
                        let read_state = if incoming.read {
                            ReadState::Confirmed
                        } else {
                            ReadState::Unread
                        };
                        delta.push(incoming.clone());
                        state.entries.insert(
                            incoming.id,
                            Entry {
                                notification: incoming,
                                read_state,
                            },
                        );
                        changed = true;
                    }
                    Some(entry) if entry.read_state == ReadState::Unread => {
                        changed |= entry.refresh(&incoming);
                    }
                    Some(_) => {}
                }
            }

            let baseline = source == IngestSource::Poll && !state.baseline_done;
            if source == IngestSource::Poll {
                state.baseline_done = true;
            }

            // 没有变化时不递增 version，也不通知监听者
            if !changed {
                return Vec::new();
            }

            delta.sort_by(|a, b| b.id.cmp(&a.id));
            delta.dedup_by_key(|n| n.id);
            state.version += 1;
            (delta, baseline, state.snapshot())
        };

        debug!(
            source = ?source,
            new = delta.len(),
            total = snapshot.notifications.len(),
            unread = snapshot.unread_count,
            "Ingested notification batch"
        );

        if !delta.is_empty() {
            // 没有接收方时 send 返回 Err，属于正常情况
            let _ = self.deltas.send(DeltaEvent {
                source,
                baseline,
                notifications: Arc::new(delta.clone()),
            });
        }
        self.notify_listeners(&snapshot);
        delta
    }

    /// 本地标记已读（乐观更新）并尽力发送确认
    ///
    /// `ids` 为 `None` 时标记全部。返回本次由未读变为已读的 id。
    /// 确认失败不回滚本地状态。
    pub async fn mark_read(&self, ids: Option<Vec<NotificationId>>) -> Vec<NotificationId> {
        let changed = self.apply_read(ids.as_deref());
        if changed.is_empty() {
            return changed;
        }

        let Some(api) = self.current_api() else {
            debug!(count = changed.len(), "No API attached, read state stays tentative");
            return changed;
        };

        match api.acknowledge_read(ids.as_deref()).await {
            Ok(()) => self.confirm_read(&changed),
            Err(e) => warn!(
                error = %e,
                count = changed.len(),
                "Mark-read acknowledgement failed, keeping local read state"
            ),
        }
        changed
    }

    /// 重发所有暂定已读的确认
    pub async fn flush_pending_acks(&self) -> usize {
        let pending = self.pending_ack_ids();
        if pending.is_empty() {
            return 0;
        }
        let Some(api) = self.current_api() else {
            return 0;
        };

        match api.acknowledge_read(Some(pending.as_slice())).await {
            Ok(()) => {
                info!(count = pending.len(), "Pending read acknowledgements confirmed");
                self.confirm_read(&pending);
                pending.len()
            }
            Err(e) => {
                warn!(error = %e, count = pending.len(), "Retrying read acknowledgements failed");
                0
            }
        }
    }

    /// 同步的本地已读标记
    pub fn apply_read(&self, ids: Option<&[NotificationId]>) -> Vec<NotificationId> {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let (changed, snapshot) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut changed = Vec::new();
            match ids {
                None => {
                    for (id, entry) in state.entries.iter_mut() {
                        if entry.read_state == ReadState::Unread {
                            entry.read_state = ReadState::Tentative;
                            changed.push(*id);
                        }
                    }
                }
                Some(ids) => {
                    for id in ids {
                        if let Some(entry) = state.entries.get_mut(id) {
                            if entry.read_state == ReadState::Unread {
                                entry.read_state = ReadState::Tentative;
                                changed.push(*id);
                            }
                        }
                    }
                }
            }
            if changed.is_empty() {
                return changed;
            }
            state.version += 1;
            (changed, state.snapshot())
        };

        self.notify_listeners(&snapshot);
        changed
    }

    /// 服务端确认后将暂定已读提升为已确认
    pub fn confirm_read(&self, ids: &[NotificationId]) {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut changed = false;
            for id in ids {
                if let Some(entry) = state.entries.get_mut(id) {
                    if entry.read_state == ReadState::Tentative {
                        entry.read_state = ReadState::Confirmed;
                        changed = true;
                    }
                }
            }
            if !changed {
                return;
            }
            state.version += 1;
            state.snapshot()
        };

        self.notify_listeners(&snapshot);
    }

    pub fn read_state(&self, id: NotificationId) -> Option<ReadState> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.get(&id).map(|e| e.read_state)
    }

    fn pending_ack_ids(&self) -> Vec<NotificationId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|(_, e)| e.read_state == ReadState::Tentative)
            .map(|(id, _)| *id)
            .collect()
    }

    /// 更新推送连接状态（只由推送通道调用）
    pub fn set_connection_state(&self, connection: ConnectionState) {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.connection == connection {
                return;
            }
            debug!(from = %state.connection, to = %connection, "Connection state changed");
            state.connection = connection;
            state.version += 1;
            state.snapshot()
        };

        self.notify_listeners(&snapshot);
    }

    /// 会话结束：清空所有通知
    pub fn reset(&self) {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let version = state.version + 1;
            *state = StoreState::new();
            state.version = version;
            state.snapshot()
        };

        self.notify_listeners(&snapshot);
    }

    /// 获取当前快照
    pub fn get_state(&self) -> StoreSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.snapshot()
    }

    /// 注册监听器，并立即用当前快照回调一次
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreSnapshot) + Send + Sync + 'static,
    {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let listener: Listener = Arc::new(listener);
        let id = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.next_id += 1;
            let id = registry.next_id;
            registry.listeners.push((id, listener.clone()));
            id
        };

        listener(&self.get_state());

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// 新通知增量流
    pub fn subscribe_deltas(&self) -> broadcast::Receiver<DeltaEvent> {
        self.deltas.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.listeners.len()
    }

    pub fn attach_api(&self, api: Arc<dyn NotificationApi>) {
        *self.api.lock().unwrap_or_else(|e| e.into_inner()) = Some(api);
    }

    pub fn detach_api(&self) {
        *self.api.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn current_api(&self) -> Option<Arc<dyn NotificationApi>> {
        self.api.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn notify_listeners(&self, snapshot: &StoreSnapshot) {
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(snapshot);
        }
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::model::NotificationType;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    fn order(id: NotificationId) -> Notification {
        Notification::new(id, NotificationType::NewOrder).with_title(format!("Commande #{}", id))
    }

    fn ids(snapshot: &StoreSnapshot) -> Vec<NotificationId> {
        snapshot.notifications.iter().map(|n| n.id).collect()
    }

    struct FakeApi {
        fail: bool,
        acks: Mutex<Vec<Option<Vec<NotificationId>>>>,
    }

    impl FakeApi {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                acks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NotificationApi for FakeApi {
        async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
            Ok(Vec::new())
        }

        async fn acknowledge_read(&self, ids: Option<&[NotificationId]>) -> Result<()> {
            self.acks.lock().unwrap().push(ids.map(|i| i.to_vec()));
            if self.fail {
                Err(anyhow!("network down"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_ingest_returns_only_unknown_ids() {
        let store = NotificationStore::new();
        let delta = store.ingest(vec![order(1), order(2)], IngestSource::Push);
        assert_eq!(delta.len(), 2);

        let delta = store.ingest(vec![order(2), order(3)], IngestSource::Poll);
        assert_eq!(delta.iter().map(|n| n.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(store.get_state().notifications.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_within_one_batch_create_one_entry() {
        let store = NotificationStore::new();
        let delta = store.ingest(vec![order(5), order(5)], IngestSource::Poll);
        assert_eq!(delta.len(), 1);
        assert_eq!(store.get_state().notifications.len(), 1);
    }

    #[test]
    fn test_snapshot_is_descending_regardless_of_arrival_order() {
        let store = NotificationStore::new();
        store.ingest(vec![order(3)], IngestSource::Push);
        store.ingest(vec![order(10), order(1)], IngestSource::Poll);
        store.ingest(vec![order(7)], IngestSource::Push);
        assert_eq!(ids(&store.get_state()), vec![10, 7, 3, 1]);
    }

    #[test]
    fn test_known_unread_entry_refreshes_display_fields() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1).with_message("En attente")], IngestSource::Push);
        store.ingest(vec![order(1).with_message("Expédiée")], IngestSource::Poll);
        let snapshot = store.get_state();
        assert_eq!(snapshot.get(1).unwrap().message, "Expédiée");
    }

    #[test]
    fn test_known_read_entry_is_left_untouched() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1).with_message("v1")], IngestSource::Push);
        store.apply_read(Some(&[1]));
        store.ingest(vec![order(1).with_message("v2").with_read(false)], IngestSource::Poll);

        let snapshot = store.get_state();
        let n = snapshot.get(1).unwrap();
        assert!(n.read);
        assert_eq!(n.message, "v1");
        assert_eq!(snapshot.unread_count, 0);
    }

    #[test]
    fn test_new_id_takes_server_read_flag() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1).with_read(true), order(2)], IngestSource::Poll);
        assert_eq!(store.read_state(1), Some(ReadState::Confirmed));
        assert_eq!(store.read_state(2), Some(ReadState::Unread));
        assert_eq!(store.get_state().unread_count, 1);
    }

    #[test]
    fn test_server_read_flag_on_known_id_is_ignored() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1)], IngestSource::Push);
        store.ingest(vec![order(1).with_read(true)], IngestSource::Poll);
        assert_eq!(store.read_state(1), Some(ReadState::Unread));
    }

    #[test]
    fn test_apply_read_marks_exactly_listed_ids() {
        let store = NotificationStore::new();
        store.ingest((1..=8).map(order).collect(), IngestSource::Poll);
        let changed = store.apply_read(Some(&[5, 7, 99]));
        assert_eq!(changed, vec![5, 7]);

        let snapshot = store.get_state();
        for n in snapshot.notifications.iter() {
            assert_eq!(n.read, n.id == 5 || n.id == 7, "id {}", n.id);
        }
        assert_eq!(snapshot.unread_count, 6);
    }

    #[test]
    fn test_apply_read_without_ids_marks_all() {
        let store = NotificationStore::new();
        store.ingest((1..=4).map(order).collect(), IngestSource::Poll);
        assert_eq!(store.apply_read(None).len(), 4);
        assert_eq!(store.get_state().unread_count, 0);
        assert!(store.apply_read(None).is_empty());
    }

    #[test]
    fn test_subscribe_receives_current_snapshot_immediately() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1), order(2)], IngestSource::Poll);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.subscribe(move |s| sink.lock().unwrap().push(s.notifications.len()));

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_unsubscribe_stops_callbacks() {
        let store = NotificationStore::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let sub = store.subscribe(move |_| *sink.lock().unwrap() += 1);
        store.ingest(vec![order(1)], IngestSource::Push);
        assert_eq!(*count.lock().unwrap(), 2);

        sub.unsubscribe();
        assert_eq!(store.listener_count(), 0);
        store.ingest(vec![order(2)], IngestSource::Push);
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_listener_can_read_state_during_callback() {
        let store = Arc::new(NotificationStore::new());
        let inner = Arc::downgrade(&store);
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let _sub = store.subscribe(move |_| {
            if let Some(store) = inner.upgrade() {
                *sink.lock().unwrap() = store.get_state().notifications.len();
            }
        });
        store.ingest(vec![order(1), order(2)], IngestSource::Push);
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn test_unchanged_batch_does_not_notify() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1)], IngestSource::Poll);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let _sub = store.subscribe(move |_| *sink.lock().unwrap() += 1);

        store.ingest(vec![order(1)], IngestSource::Poll);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_first_poll_delta_is_baseline() {
        let store = NotificationStore::new();
        let mut rx = store.subscribe_deltas();

        store.ingest(vec![order(1)], IngestSource::Push);
        store.ingest(vec![order(2)], IngestSource::Poll);
        store.ingest(vec![order(3)], IngestSource::Poll);

        let first = rx.try_recv().unwrap();
        assert!(!first.baseline);
        assert_eq!(first.source, IngestSource::Push);
        assert!(rx.try_recv().unwrap().baseline);
        assert!(!rx.try_recv().unwrap().baseline);
    }

    #[test]
    fn test_reset_clears_everything() {
        let store = NotificationStore::new();
        store.ingest(vec![order(1)], IngestSource::Poll);
        store.set_connection_state(ConnectionState::Connected);
        store.reset();

        let snapshot = store.get_state();
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.connection_status, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_mark_read_confirms_after_successful_ack() {
        let store = NotificationStore::new();
        let api = Arc::new(FakeApi::new(false));
        store.attach_api(api.clone());
        store.ingest(vec![order(5), order(7), order(9)], IngestSource::Poll);

        let changed = store.mark_read(Some(vec![5, 7])).await;
        assert_eq!(changed, vec![5, 7]);
        assert_eq!(store.read_state(5), Some(ReadState::Confirmed));
        assert_eq!(store.read_state(9), Some(ReadState::Unread));
        assert_eq!(*api.acks.lock().unwrap(), vec![Some(vec![5, 7])]);
    }

    #[tokio::test]
    async fn test_mark_all_sends_null_ids() {
        let store = NotificationStore::new();
        let api = Arc::new(FakeApi::new(false));
        store.attach_api(api.clone());
        store.ingest(vec![order(1), order(2)], IngestSource::Poll);

        store.mark_read(None).await;
        assert_eq!(*api.acks.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_failed_ack_keeps_local_state_tentative() {
        let store = NotificationStore::new();
        store.attach_api(Arc::new(FakeApi::new(true)));
        store.ingest(vec![order(1)], IngestSource::Poll);

        store.mark_read(Some(vec![1])).await;
        assert_eq!(store.read_state(1), Some(ReadState::Tentative));

        let snapshot = store.get_state();
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(snapshot.pending_ack_count, 1);
    }

    #[tokio::test]
    async fn test_flush_pending_acks_confirms_tentative_entries() {
        let store = NotificationStore::new();
        store.attach_api(Arc::new(FakeApi::new(true)));
        store.ingest(vec![order(1), order(2)], IngestSource::Poll);
        store.mark_read(None).await;

        let api = Arc::new(FakeApi::new(false));
        store.attach_api(api.clone());
        assert_eq!(store.flush_pending_acks().await, 2);
        assert_eq!(store.get_state().pending_ack_count, 0);
        assert_eq!(*api.acks.lock().unwrap(), vec![Some(vec![1, 2])]);
    }
}
