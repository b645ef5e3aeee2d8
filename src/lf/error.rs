//! 同步核心错误分类
//!
//! DAO 内部统一使用 anyhow + context，服务层对外收敛为本枚举

use thiserror::Error;

/// 同步核心对外错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 历史消息加载失败：调用方应把会话视为"未加载"，不得展示半截列表
    #[error("加载历史消息失败: {0}")]
    LoadFailed(#[source] anyhow::Error),

    /// 发送失败：draft 原样带回调用方，用于恢复输入框内容
    #[error("发送消息失败")]
    SendFailed {
        /// 用户输入的原文，失败时必须还给调用方
        draft: String,
        #[source]
        source: anyhow::Error,
    },

    /// 去掉首尾空白后为空的消息，拒绝发送
    #[error("消息内容不能为空")]
    EmptyMessage,

    /// 当前没有打开的会话
    #[error("当前没有打开的会话")]
    ConversationNotOpen,

    /// 频道订阅建立失败（核心不自动重试，重试策略归调用方）
    #[error("订阅频道失败: {0}")]
    SubscriptionFailed(#[source] anyhow::Error),

    /// 批量置已读失败：只记录并上报，不阻塞会话展示
    #[error("标记已读失败: {0}")]
    ReadMarkFailed(#[source] anyhow::Error),

    /// 通知扇出部分失败：相对触发它的主操作永远吞掉，仅日志
    #[error("通知扇出部分失败: 成功 {delivered} 个, 失败 {failed} 个")]
    BroadcastPartialFailure { delivered: usize, failed: usize },
}
