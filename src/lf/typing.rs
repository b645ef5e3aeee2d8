//! 输入状态子系统（瞬态，不落库）
//!
//! 发送侧：首次调用立即广播 is_typing=true，3 秒内无后续按键再广播 false，
//! 窗口内的重复调用只重置计时器，不重复发 false。
//! 接收侧：独立的 5 秒自动清除，即使"停止输入"广播丢失也能回落；
//! 输入状态按会话 ID 各自独立，收件箱可同时观察 N 个会话。
//! 计时器统一放在按会话 ID 索引的 arena 里，关闭/切换时一次性清扫，
//! 不会留下泄漏的计时器。

use crate::lf::bus::{conversation_typing_channel, LocalBus, Subscription};
use crate::lf::types::{now_millis, TypingEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// 发送侧停止输入去抖窗口
const TYPING_DEBOUNCE: Duration = Duration::from_secs(3);
/// 接收侧自动清除窗口
const TYPING_AUTO_CLEAR: Duration = Duration::from_secs(5);

/// 输入状态变更回调
#[async_trait]
pub trait TypingListener: Send + Sync {
    /// 某会话的对方输入状态发生转变
    async fn on_typing_changed(&self, conversation_id: String, user_name: String, is_typing: bool);
}

/// 空实现（默认监听器）
pub struct EmptyTypingListener;

#[async_trait]
impl TypingListener for EmptyTypingListener {
    async fn on_typing_changed(
        &self,
        _conversation_id: String,
        _user_name: String,
        _is_typing: bool,
    ) {
    }
}

/// 输入状态发送端（按键时调用 announce）
pub struct TypingAnnouncer {
    bus: Arc<LocalBus>,
    user_id: String,
    user_name: String,
    /// 会话 ID -> 待发 false 的去抖计时器
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TypingAnnouncer {
    pub fn new(bus: Arc<LocalBus>, user_id: String, user_name: String) -> Self {
        Self {
            bus,
            user_id,
            user_name,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn publish(bus: &LocalBus, conversation_id: &str, user_id: &str, user_name: &str, is_typing: bool) {
        let event = TypingEvent {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            is_typing,
            timestamp: now_millis(),
        };
        match serde_json::to_value(&event) {
            Ok(payload) => {
                bus.publish(&conversation_typing_channel(conversation_id), "typing", payload);
            }
            Err(e) => warn!("[Typing] 输入事件序列化失败: {:?}", e),
        }
    }

    /// 按键触发：立即广播 true，并重置 3 秒后的 false 广播
    pub fn announce(&self, conversation_id: &str) {
        Self::publish(&self.bus, conversation_id, &self.user_id, &self.user_name, true);

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timers.remove(conversation_id) {
            old.abort();
        }
        let bus = self.bus.clone();
        let user_id = self.user_id.clone();
        let user_name = self.user_name.clone();
        let conv = conversation_id.to_string();
        let timers_ref = self.timers.clone();
        let handle = tokio::spawn(async move {
            sleep(TYPING_DEBOUNCE).await;
            Self::publish(&bus, &conv, &user_id, &user_name, false);
            timers_ref
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&conv);
        });
        timers.insert(conversation_id.to_string(), handle);
    }

    /// 取消某会话的待发计时器（会话关闭时调用）
    pub fn cancel(&self, conversation_id: &str) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timers.remove(conversation_id) {
            handle.abort();
            debug!("[Typing] 取消去抖计时器: conversation={}", conversation_id);
        }
    }
}

impl Drop for TypingAnnouncer {
    fn drop(&mut self) {
        // 统一清扫，避免泄漏计时器
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

/// 单个被观察会话的状态
struct WatchEntry {
    is_typing: bool,
    /// 自动清除计时器
    clear_timer: Option<JoinHandle<()>>,
    /// 频道订阅（条目移除时随之退订）
    _subscription: Subscription,
}

/// 输入状态接收端：按会话 ID 维护一组独立的输入标志
pub struct TypingWatcher {
    bus: Arc<LocalBus>,
    self_user_id: String,
    listener: Arc<dyn TypingListener>,
    entries: Arc<Mutex<HashMap<String, WatchEntry>>>,
}

impl TypingWatcher {
    pub fn new(bus: Arc<LocalBus>, self_user_id: String, listener: Arc<dyn TypingListener>) -> Self {
        Self {
            bus,
            self_user_id,
            listener,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 开始观察某会话的输入状态；重复调用会重建条目
    pub fn watch(&self, conversation_id: &str) {
        let rx = self.bus.subscribe(&conversation_typing_channel(conversation_id));
        let task = self.spawn_ingest(rx);
        let entry = WatchEntry {
            is_typing: false,
            clear_timer: None,
            _subscription: Subscription::new(vec![task]),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = entries.insert(conversation_id.to_string(), entry) {
            if let Some(timer) = old.clear_timer {
                timer.abort();
            }
        }
        debug!("[Typing] 开始观察会话: {}", conversation_id);
    }

    /// 停止观察某会话（退订 + 清扫计时器）
    pub fn unwatch(&self, conversation_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.remove(conversation_id) {
            if let Some(timer) = entry.clear_timer {
                timer.abort();
            }
            debug!("[Typing] 停止观察会话: {}", conversation_id);
        }
    }

    /// 某会话当前是否显示"对方正在输入…"
    pub fn is_typing(&self, conversation_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .map(|e| e.is_typing)
            .unwrap_or(false)
    }

    fn spawn_ingest(&self, mut rx: broadcast::Receiver<crate::lf::bus::BusEvent>) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let listener = self.listener.clone();
        let self_user_id = self.self_user_id.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.event != "typing" {
                    continue;
                }
                let typing: TypingEvent = match serde_json::from_value(event.payload) {
                    Ok(typing) => typing,
                    Err(e) => {
                        warn!("[Typing] 输入事件载荷解析失败: {:?}", e);
                        continue;
                    }
                };
                // 与消息订阅同一条规则：过滤自己的事件
                if typing.user_id == self_user_id {
                    continue;
                }
                Self::apply_event(&entries, &listener, typing).await;
            }
        })
    }

    /// 应用一条输入事件；只在状态实际转变时回调
    async fn apply_event(
        entries: &Arc<Mutex<HashMap<String, WatchEntry>>>,
        listener: &Arc<dyn TypingListener>,
        typing: TypingEvent,
    ) {
        let transition = {
            let mut guard = entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = match guard.get_mut(&typing.conversation_id) {
                Some(entry) => entry,
                None => return,
            };
            let changed = entry.is_typing != typing.is_typing;
            entry.is_typing = typing.is_typing;

            if let Some(timer) = entry.clear_timer.take() {
                timer.abort();
            }
            if typing.is_typing {
                // 独立的 5 秒自动清除：显式 false 丢失时兜底
                entry.clear_timer = Some(Self::spawn_auto_clear(
                    entries.clone(),
                    listener.clone(),
                    typing.conversation_id.clone(),
                    typing.user_name.clone(),
                ));
            }
            changed
        };

        if transition {
            listener
                .on_typing_changed(typing.conversation_id, typing.user_name, typing.is_typing)
                .await;
        }
    }

    fn spawn_auto_clear(
        entries: Arc<Mutex<HashMap<String, WatchEntry>>>,
        listener: Arc<dyn TypingListener>,
        conversation_id: String,
        user_name: String,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            sleep(TYPING_AUTO_CLEAR).await;
            let cleared = {
                let mut guard = entries.lock().unwrap_or_else(|e| e.into_inner());
                match guard.get_mut(&conversation_id) {
                    Some(entry) if entry.is_typing => {
                        entry.is_typing = false;
                        entry.clear_timer = None;
                        true
                    }
                    _ => false,
                }
            };
            if cleared {
                debug!("[Typing] 自动清除输入状态: conversation={}", conversation_id);
                listener
                    .on_typing_changed(conversation_id, user_name, false)
                    .await;
            }
        })
    }
}

impl Drop for TypingWatcher {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in entries.drain() {
            if let Some(timer) = entry.clear_timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    /// 记录回调序列的监听器
    struct RecordingListener {
        events: AsyncMutex<Vec<(String, bool)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TypingListener for RecordingListener {
        async fn on_typing_changed(
            &self,
            conversation_id: String,
            _user_name: String,
            is_typing: bool,
        ) {
            self.events.lock().await.push((conversation_id, is_typing));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_debounce_resets_timer() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.subscribe(&conversation_typing_channel("c1"));
        let announcer = TypingAnnouncer::new(bus.clone(), "stu_u".into(), "小明".into());

        announcer.announce("c1");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.payload["is_typing"], true);

        // 2 秒后再次按键：窗口内重置计时器，不发 false
        sleep(Duration::from_secs(2)).await;
        announcer.announce("c1");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.payload["is_typing"], true);

        // 第一次的 3 秒点（距第二次仅 1 秒）不应有 false
        sleep(Duration::from_millis(1500)).await;
        assert!(rx.try_recv().is_err());

        // 距第二次按键超过 3 秒，恰好一条 false
        sleep(Duration::from_secs(2)).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.payload["is_typing"], false);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_stop_broadcast() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.subscribe(&conversation_typing_channel("c1"));
        let announcer = TypingAnnouncer::new(bus.clone(), "stu_u".into(), "小明".into());

        announcer.announce("c1");
        rx.recv().await.unwrap();
        announcer.cancel("c1");

        sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_auto_clears_after_five_seconds() {
        let bus = Arc::new(LocalBus::new());
        let listener = RecordingListener::new();
        let watcher = TypingWatcher::new(bus.clone(), "admin_a".into(), listener.clone());
        watcher.watch("c1");

        let announcer = TypingAnnouncer::new(bus.clone(), "stu_u".into(), "小明".into());
        announcer.announce("c1");
        // 阻止发送端 3 秒后的显式 false，模拟"停止输入"广播丢失
        sleep(Duration::from_millis(10)).await;
        announcer.cancel("c1");
        assert!(watcher.is_typing("c1"));

        // T+5s 内仍显示输入中
        sleep(Duration::from_secs(4)).await;
        assert!(watcher.is_typing("c1"));

        // 超过 5 秒自动回落
        sleep(Duration::from_secs(2)).await;
        assert!(!watcher.is_typing("c1"));
        let events = listener.events.lock().await.clone();
        assert_eq!(events, vec![("c1".to_string(), true), ("c1".to_string(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_false_clears_immediately() {
        let bus = Arc::new(LocalBus::new());
        let listener = RecordingListener::new();
        let watcher = TypingWatcher::new(bus.clone(), "admin_a".into(), listener);
        watcher.watch("c1");

        let announcer = TypingAnnouncer::new(bus.clone(), "stu_u".into(), "小明".into());
        announcer.announce("c1");
        sleep(Duration::from_millis(10)).await;
        assert!(watcher.is_typing("c1"));

        // 去抖窗口走完，发送端广播 false
        sleep(Duration::from_secs(4)).await;
        assert!(!watcher.is_typing("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_events_filtered() {
        let bus = Arc::new(LocalBus::new());
        let watcher = TypingWatcher::new(bus.clone(), "stu_u".into(), RecordingListener::new());
        watcher.watch("c1");

        // 自己的输入事件不改变本地标志
        let announcer = TypingAnnouncer::new(bus.clone(), "stu_u".into(), "小明".into());
        announcer.announce("c1");
        sleep(Duration::from_millis(10)).await;
        assert!(!watcher.is_typing("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_state_independent_per_conversation() {
        let bus = Arc::new(LocalBus::new());
        let watcher = TypingWatcher::new(bus.clone(), "admin_a".into(), RecordingListener::new());
        watcher.watch("c1");
        watcher.watch("c2");

        let announcer = TypingAnnouncer::new(bus.clone(), "stu_u".into(), "小明".into());
        announcer.announce("c1");
        sleep(Duration::from_millis(10)).await;

        // 收件箱场景：c1 行显示输入中，c2 不受影响
        assert!(watcher.is_typing("c1"));
        assert!(!watcher.is_typing("c2"));

        watcher.unwatch("c1");
        assert!(!watcher.is_typing("c1"));
    }
}
