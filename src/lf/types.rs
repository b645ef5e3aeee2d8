//! 失物招领门户核心数据结构
//!
//! 所有持久化实体与总线载荷的统一定义，时间戳一律使用毫秒级整数

use serde::{Deserialize, Serialize};

/// 物品状态：丢失 / 拾获 / 已认领
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// 丢失（寻物启事）
    Lost,
    /// 拾获（招领启事）
    Found,
    /// 已认领（认领后由 lost/found 迁移而来）
    Claimed,
}

impl ItemStatus {
    /// 数据库存储用的字符串表示
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Lost => "lost",
            ItemStatus::Found => "found",
            ItemStatus::Claimed => "claimed",
        }
    }

    /// 从数据库字符串解析，未知值兜底为 lost
    pub fn parse(s: &str) -> Self {
        match s {
            "found" => ItemStatus::Found,
            "claimed" => ItemStatus::Claimed,
            _ => ItemStatus::Lost,
        }
    }
}

/// 失物/拾物条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// 条目 ID（自增）
    pub id: i64,
    /// 标题
    pub title: String,
    /// 描述
    #[serde(default)]
    pub description: String,
    /// 状态：lost / found / claimed
    pub status: ItemStatus,
    /// 发布者用户 ID
    pub user_id: String,
    /// 认领者用户 ID（未认领时为空）
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// 创建时间（毫秒）
    pub created_at: i64,
}

/// 会话（两个用户之间的线程，可选关联到某个条目）
///
/// item_id 为空表示通用的管理员客服会话；
/// (item_id, sender_id, receiver_id) 三元组全局唯一，由先查后建保证
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// 会话 ID（UUID）
    pub conversation_id: String,
    /// 关联条目 ID（客服会话为空）
    #[serde(default)]
    pub item_id: Option<i64>,
    /// 发起方用户 ID
    pub sender_id: String,
    /// 接收方用户 ID
    pub receiver_id: String,
    /// 创建时间（毫秒）
    pub created_at: i64,
}

/// 聊天消息
///
/// is_read 的语义是"非作者是否已读"，因此所有已读/未读统计
/// 必须排除查询者自己发出的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 消息 ID（UUID）
    pub message_id: String,
    /// 所属会话 ID
    pub conversation_id: String,
    /// 消息正文
    pub content: String,
    /// 作者用户 ID
    pub user_id: String,
    /// 创建时间（毫秒）
    pub created_at: i64,
    /// 非作者是否已读
    #[serde(default)]
    pub is_read: bool,
}

/// 输入状态事件（仅作为总线载荷，不落库）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingEvent {
    /// 会话 ID
    pub conversation_id: String,
    /// 输入者用户 ID
    pub user_id: String,
    /// 输入者昵称（用于列表行展示"xxx 正在输入…"）
    pub user_name: String,
    /// 是否正在输入
    pub is_typing: bool,
    /// 事件时间（毫秒）
    pub timestamp: i64,
}

/// 广播通知（本体不携带任何按用户的状态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// 通知 ID（自增）
    pub id: i64,
    /// 标题
    pub title: String,
    /// 描述（可空）
    #[serde(default)]
    pub description: Option<String>,
    /// 创建时间（毫秒）
    pub created_at: i64,
}

/// 用户-通知关联行：每个接收者的已读状态唯一记录处
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    /// 关联行 ID（自增）
    pub id: i64,
    /// 接收者用户 ID
    pub user_id: String,
    /// 通知 ID
    pub notification_id: i64,
    /// 是否已读
    #[serde(default)]
    pub is_read: bool,
    /// 创建时间（毫秒）
    pub created_at: i64,
    /// 关联的通知本体（列表查询时联表带出）
    #[serde(default)]
    pub notification: Option<Notification>,
}

/// 角色（权限桶）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub title: String,
}

/// 角色-页面映射，每行一个 (role_id, route)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePage {
    pub role_id: i64,
    pub route: String,
}

/// 用户角色（封闭枚举，取代散落各处的 role == 1 魔法值比较）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// 管理员
    Admin,
    /// 学生
    Student,
}

impl UserRole {
    /// 角色 ID 的唯一解析入口
    pub fn resolve(role_id: i64) -> Self {
        match role_id {
            1 => UserRole::Admin,
            _ => UserRole::Student,
        }
    }

    /// 展示用标签
    pub fn label(&self) -> &'static str {
        match self {
            UserRole::Admin => "管理员",
            UserRole::Student => "学生",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_status_round() {
        assert_eq!(ItemStatus::parse("found"), ItemStatus::Found);
        assert_eq!(ItemStatus::parse("claimed"), ItemStatus::Claimed);
        // 未知值兜底为 lost
        assert_eq!(ItemStatus::parse("whatever"), ItemStatus::Lost);
        assert_eq!(ItemStatus::Claimed.as_str(), "claimed");
    }

    #[test]
    fn test_resolve_role() {
        assert!(UserRole::resolve(1).is_admin());
        assert!(!UserRole::resolve(2).is_admin());
        assert!(!UserRole::resolve(0).is_admin());
        assert_eq!(UserRole::resolve(1).label(), "管理员");
    }
}
