//! 会话观察者回调接口

use crate::lf::types::Message;
use async_trait::async_trait;

/// 会话观察者回调接口（由视图层注册）
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 会话打开完成（历史已加载、订阅已建立）
    async fn on_conversation_opened(&self, conversation_id: String);

    /// 收到对方的新消息（去重后恰好回调一次）
    async fn on_message_received(&self, message: Message);

    /// 某会话未读数变更
    async fn on_unread_changed(&self, conversation_id: String, count: i64);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_conversation_opened(&self, _conversation_id: String) {}
    async fn on_message_received(&self, _message: Message) {}
    async fn on_unread_changed(&self, _conversation_id: String, _count: i64) {}
}
