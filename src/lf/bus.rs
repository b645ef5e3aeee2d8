//! 实时总线：命名频道 + 广播发布/订阅 + 表变更事件流
//!
//! 进程内实现，按频道名维护一组 tokio broadcast 发送端。
//! 频道命名约定：
//! - `conversation_<id>`          会话消息直发广播
//! - `conversation_typing_<id>`   会话输入状态广播
//! - `all-messages-changes`       messages 表插入变更流
//! - `admin_support_conversations` 客服会话插入变更流（管理员收件箱用）
//! - `user_notifications_changes` user_notifications 表插入变更流

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// 广播频道缓冲大小
const CHANNEL_CAPACITY: usize = 64;

/// 总线事件：事件名 + JSON 载荷
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// 所属频道
    pub channel: String,
    /// 事件名，例如 "new_message" / "insert" / "typing"
    pub event: String,
    /// JSON 载荷
    pub payload: Value,
}

/// 进程内实时总线
#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusEvent>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusEvent> {
        let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// 发布事件；没有订阅者时静默丢弃
    pub fn publish(&self, channel: &str, event: &str, payload: Value) {
        let sender = self.sender_for(channel);
        let delivered = sender
            .send(BusEvent {
                channel: channel.to_string(),
                event: event.to_string(),
                payload,
            })
            .unwrap_or(0);
        debug!(
            "[Bus] 发布事件: channel={}, event={}, 送达 {} 个订阅者",
            channel, event, delivered
        );
    }

    /// 订阅频道，返回原始接收端；服务层一般通过 [`Subscription`] 持有
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusEvent> {
        debug!("[Bus] 订阅频道: {}", channel);
        self.sender_for(channel).subscribe()
    }
}

/// 会话消息广播频道名
pub fn conversation_channel(conversation_id: &str) -> String {
    format!("conversation_{}", conversation_id)
}

/// 会话输入状态频道名
pub fn conversation_typing_channel(conversation_id: &str) -> String {
    format!("conversation_typing_{}", conversation_id)
}

/// messages 表变更流频道名
pub const ALL_MESSAGES_CHANGES: &str = "all-messages-changes";

/// 客服会话插入变更流频道名
pub const ADMIN_SUPPORT_CONVERSATIONS: &str = "admin_support_conversations";

/// user_notifications 表变更流频道名
pub const USER_NOTIFICATIONS_CHANGES: &str = "user_notifications_changes";

/// 订阅句柄：持有转发任务，Drop 时统一中止
///
/// 取代"模块级可空变量 + 手工判空再退订"的写法：
/// 打开时获取、关闭/切换时释放，释放由所有权保证
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// 主动释放；可重复调用
    pub fn unsubscribe(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
