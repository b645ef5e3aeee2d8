//! 会话同步服务层
//!
//! 维护单个观察者视角下打开会话的权威消息列表：
//! 历史加载、乐观本地回显、双通道（直发广播 + 表变更流）合并去重、
//! 已读/未读记账。观察者状态机：Closed -> Loading -> Ready，
//! 只有 Ready 状态才应用入站事件，切换会话先退订再重开。

use crate::lf::bus::{
    conversation_channel, BusEvent, LocalBus, Subscription, ALL_MESSAGES_CHANGES,
};
use crate::lf::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::lf::error::SyncError;
use crate::lf::store::PortalStore;
use crate::lf::types::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// 观察者状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPhase {
    /// 未打开任何会话
    Closed,
    /// 历史加载中，入站事件不应用
    Loading,
    /// 历史已加载、订阅已建立，入站事件正常应用
    Ready,
}

/// 观察者独占的可变状态；观察者之间只通过总线和重查数据库取得一致
struct ObserverState {
    phase: ConversationPhase,
    /// 当前打开的会话 ID；入站回调用它做同一性比对，丢弃过期事件
    active_id: Option<String>,
    messages: Vec<Message>,
    /// 去重集合：广播与变更流可能对同一消息各触发一次
    seen_ids: HashSet<String>,
    unread_cache: HashMap<String, i64>,
}

impl ObserverState {
    fn new() -> Self {
        Self {
            phase: ConversationPhase::Closed,
            active_id: None,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            unread_cache: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.phase = ConversationPhase::Closed;
        self.active_id = None;
        self.messages.clear();
        self.seen_ids.clear();
    }
}

/// 会话同步器（单观察者）
pub struct ConversationSyncer {
    store: Arc<PortalStore>,
    bus: Arc<LocalBus>,
    user_id: String,
    listener: Arc<dyn ConversationListener>,
    state: Arc<Mutex<ObserverState>>,
    subscription: Option<Subscription>,
}

impl ConversationSyncer {
    /// 创建同步器（使用默认空监听器）
    pub fn new(store: Arc<PortalStore>, bus: Arc<LocalBus>, user_id: String) -> Self {
        Self::with_listener(store, bus, user_id, Arc::new(EmptyConversationListener))
    }

    /// 创建同步器（带自定义监听器）
    pub fn with_listener(
        store: Arc<PortalStore>,
        bus: Arc<LocalBus>,
        user_id: String,
        listener: Arc<dyn ConversationListener>,
    ) -> Self {
        Self {
            store,
            bus,
            user_id,
            listener,
            state: Arc::new(Mutex::new(ObserverState::new())),
            subscription: None,
        }
    }

    /// 打开会话：加载历史（升序）、批量置已读、建立合并订阅
    ///
    /// 历史加载失败时观察者停在空列表的 Closed 状态，绝不展示半截列表；
    /// 置已读失败只记录，不阻塞会话展示
    pub async fn open(&mut self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        self.close().await;

        {
            let mut state = self.state.lock().await;
            state.phase = ConversationPhase::Loading;
            state.active_id = Some(conversation_id.to_string());
        }
        info!(
            "[ConvSync] 打开会话: id={}, user={}",
            conversation_id, self.user_id
        );

        let history = match self
            .store
            .messages
            .messages_by_conversation(conversation_id)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                self.state.lock().await.reset();
                return Err(SyncError::LoadFailed(e));
            }
        };

        // 已读是尽力而为的记账，失败不能挡住会话展示
        match self
            .store
            .messages
            .mark_conversation_read(conversation_id, &self.user_id)
            .await
        {
            Ok(updated) => {
                debug!(
                    "[ConvSync] 打开时置已读: conversation={}, 更新 {} 行",
                    conversation_id, updated
                );
            }
            Err(e) => {
                warn!("[ConvSync] 打开时置已读失败: {:?}", e);
            }
        }

        {
            let mut state = self.state.lock().await;
            state.seen_ids = history.iter().map(|m| m.message_id.clone()).collect();
            state.messages = history.clone();
            state.unread_cache.insert(conversation_id.to_string(), 0);
        }

        // 直发广播与表变更流两路都订阅，同一消息 ID 只应用一次
        let broadcast_rx = self.bus.subscribe(&conversation_channel(conversation_id));
        let changes_rx = self.bus.subscribe(ALL_MESSAGES_CHANGES);
        let t1 = self.spawn_ingest(broadcast_rx, "new_message");
        let t2 = self.spawn_ingest(changes_rx, "insert");
        self.subscription = Some(Subscription::new(vec![t1, t2]));

        self.state.lock().await.phase = ConversationPhase::Ready;
        self.listener
            .on_conversation_opened(conversation_id.to_string())
            .await;
        Ok(history)
    }

    /// 入站事件消费任务：两路通道共用同一套过滤/去重规则
    fn spawn_ingest(
        &self,
        mut rx: broadcast::Receiver<BusEvent>,
        event_name: &'static str,
    ) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let listener = self.listener.clone();
        let self_user_id = self.user_id.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[ConvSync] 订阅滞后，丢弃 {} 条事件", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.event != event_name {
                    continue;
                }
                let message: Message = match serde_json::from_value(event.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("[ConvSync] 入站消息载荷解析失败: {:?}", e);
                        continue;
                    }
                };
                Self::apply_incoming(&state, &listener, &self_user_id, message).await;
            }
        })
    }

    /// 入站消息应用规则（广播与变更流共用）：
    /// 只在 Ready 状态应用；回调时与当前会话 ID 做同一性比对，
    /// 过滤自己发出的回声，再按消息 ID 去重
    async fn apply_incoming(
        state: &Arc<Mutex<ObserverState>>,
        listener: &Arc<dyn ConversationListener>,
        self_user_id: &str,
        message: Message,
    ) {
        {
            let mut guard = state.lock().await;
            if guard.phase != ConversationPhase::Ready {
                return;
            }
            if guard.active_id.as_deref() != Some(message.conversation_id.as_str()) {
                debug!(
                    "[ConvSync] 丢弃非当前会话的事件: conversation={}",
                    message.conversation_id
                );
                return;
            }
            if message.user_id == self_user_id {
                // 自己的广播回声，本地已乐观追加
                return;
            }
            if !guard.seen_ids.insert(message.message_id.clone()) {
                debug!("[ConvSync] 去重命中: message={}", message.message_id);
                return;
            }
            guard.messages.push(message.clone());
        }
        listener.on_message_received(message).await;
    }

    /// 发送消息：先落库，再本地乐观回显，最后向会话广播频道发布
    ///
    /// 落库失败时把原文通过 `SendFailed::draft` 带回调用方恢复输入框，
    /// 列表中不会留下"幽灵"消息
    pub async fn send(&self, content: &str) -> Result<Message, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let conversation_id = {
            let state = self.state.lock().await;
            if state.phase != ConversationPhase::Ready {
                return Err(SyncError::ConversationNotOpen);
            }
            state
                .active_id
                .clone()
                .ok_or(SyncError::ConversationNotOpen)?
        };

        let message = self
            .store
            .messages
            .insert_message(&conversation_id, content.trim(), &self.user_id)
            .await
            .map_err(|e| SyncError::SendFailed {
                draft: content.to_string(),
                source: e,
            })?;

        {
            let mut state = self.state.lock().await;
            // 等待落库期间可能已切换会话，迟到的响应不应用到新状态
            if state.active_id.as_deref() == Some(conversation_id.as_str()) {
                state.seen_ids.insert(message.message_id.clone());
                state.messages.push(message.clone());
            }
        }

        if let Ok(payload) = serde_json::to_value(&message) {
            self.bus
                .publish(&conversation_channel(&conversation_id), "new_message", payload);
        }
        debug!(
            "[ConvSync] 发送消息: conversation={}, message={}",
            conversation_id, message.message_id
        );
        Ok(message)
    }

    /// 对当前会话批量置已读，返回更新行数并清零本地未读缓存
    pub async fn mark_read(&self) -> Result<u64, SyncError> {
        let conversation_id = {
            let state = self.state.lock().await;
            state
                .active_id
                .clone()
                .ok_or(SyncError::ConversationNotOpen)?
        };
        let updated = self
            .store
            .messages
            .mark_conversation_read(&conversation_id, &self.user_id)
            .await
            .map_err(SyncError::ReadMarkFailed)?;

        self.state
            .lock()
            .await
            .unread_cache
            .insert(conversation_id.clone(), 0);
        self.listener.on_unread_changed(conversation_id, 0).await;
        Ok(updated)
    }

    /// 单会话未读数（同时刷新本地缓存）
    pub async fn unread_count(&self, conversation_id: &str) -> Result<i64, SyncError> {
        let count = self
            .store
            .messages
            .unread_count(conversation_id, &self.user_id)
            .await
            .map_err(SyncError::LoadFailed)?;
        self.state
            .lock()
            .await
            .unread_cache
            .insert(conversation_id.to_string(), count);
        Ok(count)
    }

    /// 批量未读数：整批一次聚合查询（收件箱列表用）
    pub async fn unread_counts(
        &self,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, i64>, SyncError> {
        let counts = self
            .store
            .messages
            .unread_counts(conversation_ids, &self.user_id)
            .await
            .map_err(SyncError::LoadFailed)?;
        let mut state = self.state.lock().await;
        for (id, count) in &counts {
            state.unread_cache.insert(id.clone(), *count);
        }
        Ok(counts)
    }

    /// 按条目聚合的批量未读数
    pub async fn unread_counts_by_items(
        &self,
        item_ids: &[i64],
    ) -> Result<HashMap<i64, i64>, SyncError> {
        self.store
            .messages
            .unread_counts_by_items(item_ids, &self.user_id)
            .await
            .map_err(SyncError::LoadFailed)
    }

    /// 关闭当前会话：退订并回到 Closed；可重复调用
    pub async fn close(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        let mut state = self.state.lock().await;
        if let Some(ref id) = state.active_id {
            debug!("[ConvSync] 关闭会话: id={}", id);
        }
        state.reset();
    }

    /// 当前消息列表快照
    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    /// 当前状态机阶段
    pub async fn phase(&self) -> ConversationPhase {
        self.state.lock().await.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lf::types::now_millis;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn setup() -> (Arc<PortalStore>, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(PortalStore::connect_in_memory(bus.clone()).await.unwrap());
        (store, bus)
    }

    fn fake_message(conversation_id: &str, user_id: &str, content: &str) -> Message {
        Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            user_id: user_id.to_string(),
            created_at: now_millis(),
            is_read: false,
        }
    }

    /// 事件经由订阅任务异步送达，留出一个调度窗口
    async fn settle() {
        sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_open_loads_history_and_marks_read() {
        let (store, bus) = setup().await;
        store.messages.insert_message("c1", "在吗", "stu_u").await.unwrap();
        store.messages.insert_message("c1", "我的校园卡", "stu_u").await.unwrap();

        let mut syncer = ConversationSyncer::new(store.clone(), bus, "admin_a".to_string());
        let history = syncer.open("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(syncer.phase().await, ConversationPhase::Ready);
        // 打开即置已读
        assert_eq!(store.messages.unread_count("c1", "admin_a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dedup_across_broadcast_and_change_feed() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store, bus.clone(), "admin_a".to_string());
        syncer.open("c1").await.unwrap();

        // 同一消息 ID 先广播后变更流
        let m1 = fake_message("c1", "stu_u", "先广播");
        let payload = serde_json::to_value(&m1).unwrap();
        bus.publish(&conversation_channel("c1"), "new_message", payload.clone());
        settle().await;
        bus.publish(ALL_MESSAGES_CHANGES, "insert", payload);
        settle().await;

        // 再来一条：先变更流后广播
        let m2 = fake_message("c1", "stu_u", "先变更流");
        let payload = serde_json::to_value(&m2).unwrap();
        bus.publish(ALL_MESSAGES_CHANGES, "insert", payload.clone());
        settle().await;
        bus.publish(&conversation_channel("c1"), "new_message", payload);
        settle().await;

        let messages = syncer.messages().await;
        assert_eq!(messages.len(), 2);
        let count_m1 = messages.iter().filter(|m| m.message_id == m1.message_id).count();
        let count_m2 = messages.iter().filter(|m| m.message_id == m2.message_id).count();
        assert_eq!(count_m1, 1);
        assert_eq!(count_m2, 1);
    }

    #[tokio::test]
    async fn test_self_echo_excluded() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store, bus, "stu_u".to_string());
        syncer.open("c1").await.unwrap();

        // 自己发送：落库会触发变更流，publish 会触发广播，
        // 但列表里只能有乐观回显那一份
        let sent = syncer.send("我丢了一把钥匙").await.unwrap();
        settle().await;

        let messages = syncer.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_two_observers_receive_exactly_once() {
        let (store, bus) = setup().await;
        let mut sender =
            ConversationSyncer::new(store.clone(), bus.clone(), "stu_u".to_string());
        let mut receiver = ConversationSyncer::new(store, bus, "admin_a".to_string());
        sender.open("c1").await.unwrap();
        receiver.open("c1").await.unwrap();

        // 发送方的落库 + 广播会让接收方两路各收到一次，去重后恰好一条
        let sent = sender.send("有人捡到黑色钱包吗").await.unwrap();
        settle().await;

        let received = receiver.messages().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_foreign_conversation_events_discarded() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store, bus.clone(), "admin_a".to_string());
        syncer.open("c1").await.unwrap();

        // 变更流上出现其他会话的插入事件，不得串进当前列表
        let other = fake_message("c2", "stu_u", "别的会话");
        bus.publish(ALL_MESSAGES_CHANGES, "insert", serde_json::to_value(&other).unwrap());
        settle().await;

        assert!(syncer.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_switching_conversation_releases_old_subscription() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store, bus.clone(), "admin_a".to_string());
        syncer.open("c1").await.unwrap();
        syncer.open("c2").await.unwrap();
        assert_eq!(syncer.phase().await, ConversationPhase::Ready);

        // 旧会话的广播已退订，也过不了同一性比对
        let stale = fake_message("c1", "stu_u", "迟到的消息");
        bus.publish(
            &conversation_channel("c1"),
            "new_message",
            serde_json::to_value(&stale).unwrap(),
        );
        settle().await;
        assert!(syncer.messages().await.is_empty());

        // 新会话正常接收
        let fresh = fake_message("c2", "stu_u", "新会话的消息");
        bus.publish(
            &conversation_channel("c2"),
            "new_message",
            serde_json::to_value(&fresh).unwrap(),
        );
        settle().await;
        assert_eq!(syncer.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_empty_rejected_and_not_open_rejected() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store, bus, "stu_u".to_string());
        assert!(matches!(
            syncer.send("你好").await,
            Err(SyncError::ConversationNotOpen)
        ));

        syncer.open("c1").await.unwrap();
        assert!(matches!(
            syncer.send("   ").await,
            Err(SyncError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn test_send_failure_returns_draft_without_ghost() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store.clone(), bus, "stu_u".to_string());
        syncer.open("c1").await.unwrap();

        // 模拟存储故障
        sqlx::query("DROP TABLE messages")
            .execute(store.messages.pool())
            .await
            .unwrap();

        match syncer.send("这条必须还给我").await {
            Err(SyncError::SendFailed { draft, .. }) => {
                assert_eq!(draft, "这条必须还给我");
            }
            other => panic!("应返回 SendFailed，实际: {:?}", other.map(|m| m.message_id)),
        }
        // 不留幽灵消息
        assert!(syncer.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_leaves_closed_empty_state() {
        let (store, bus) = setup().await;
        sqlx::query("DROP TABLE messages")
            .execute(store.messages.pool())
            .await
            .unwrap();

        let mut syncer = ConversationSyncer::new(store, bus, "stu_u".to_string());
        assert!(matches!(
            syncer.open("c1").await,
            Err(SyncError::LoadFailed(_))
        ));
        assert_eq!(syncer.phase().await, ConversationPhase::Closed);
        assert!(syncer.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_twice_returns_k_then_zero() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store.clone(), bus, "admin_a".to_string());
        syncer.open("c1").await.unwrap();

        // 打开后对方又发了三条
        for i in 0..3 {
            store
                .messages
                .insert_message("c1", &format!("追加 {}", i), "stu_u")
                .await
                .unwrap();
        }
        assert_eq!(syncer.mark_read().await.unwrap(), 3);
        assert_eq!(syncer.mark_read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (store, bus) = setup().await;
        let mut syncer = ConversationSyncer::new(store, bus, "stu_u".to_string());
        syncer.open("c1").await.unwrap();
        syncer.close().await;
        syncer.close().await;
        assert_eq!(syncer.phase().await, ConversationPhase::Closed);
    }
}
