//! 会话数据访问层（DAO）
//!
//! (item_id, sender_id, receiver_id) 三元组唯一，由先查后建保证；
//! 查找同时匹配正反两个方向，同一对用户共享一条线程

use crate::lf::bus::{LocalBus, ADMIN_SUPPORT_CONVERSATIONS};
use crate::lf::types::{now_millis, Conversation};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// 会话 DAO
pub struct ConversationDao {
    db: Pool<Sqlite>,
    bus: Arc<LocalBus>,
}

impl ConversationDao {
    pub fn new(db: Pool<Sqlite>, bus: Arc<LocalBus>) -> Self {
        Self { db, bus }
    }

    /// 首次联系时惰性建会话：存在即返回，不存在则创建
    pub async fn find_or_create(
        &self,
        item_id: Option<i64>,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<Conversation> {
        if let Some(existing) = self.find(item_id, sender_id, receiver_id).await? {
            debug!(
                "[Store/Conv] 命中已有会话: {}",
                existing.conversation_id
            );
            return Ok(existing);
        }

        let conversation = Conversation {
            conversation_id: Uuid::new_v4().to_string(),
            item_id,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            created_at: now_millis(),
        };
        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, item_id, sender_id, receiver_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.conversation_id)
        .bind(conversation.item_id)
        .bind(&conversation.sender_id)
        .bind(&conversation.receiver_id)
        .bind(conversation.created_at)
        .execute(&self.db)
        .await
        .context("创建会话失败")?;

        info!(
            "[Store/Conv] 新建会话: id={}, item_id={:?}, {} <-> {}",
            conversation.conversation_id, item_id, sender_id, receiver_id
        );

        // 客服会话（item_id 为空）插入时通知管理员收件箱变更流
        if item_id.is_none() {
            if let Ok(payload) = serde_json::to_value(&conversation) {
                self.bus.publish(ADMIN_SUPPORT_CONVERSATIONS, "insert", payload);
            }
        }
        Ok(conversation)
    }

    /// 查找既有会话：item_id 精确匹配（含 IS NULL），用户对正反向均可
    async fn find(
        &self,
        item_id: Option<i64>,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<Option<Conversation>> {
        let sql = if item_id.is_some() {
            r#"
            SELECT conversation_id, item_id, sender_id, receiver_id, created_at
            FROM conversations
            WHERE item_id = ?
              AND ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))
            LIMIT 1
            "#
        } else {
            r#"
            SELECT conversation_id, item_id, sender_id, receiver_id, created_at
            FROM conversations
            WHERE item_id IS NULL
              AND ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))
            LIMIT 1
            "#
        };

        let mut query = sqlx::query(sql);
        if let Some(id) = item_id {
            query = query.bind(id);
        }
        let row = query
            .bind(sender_id)
            .bind(receiver_id)
            .bind(receiver_id)
            .bind(sender_id)
            .fetch_optional(&self.db)
            .await
            .context("查询会话失败")?;
        Ok(row.map(Self::row_to_conversation))
    }

    /// 按 ID 查询会话
    pub async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, item_id, sender_id, receiver_id, created_at
            FROM conversations WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await
        .context("查询会话失败")?;
        Ok(row.map(Self::row_to_conversation))
    }

    /// 某条目下的全部会话
    pub async fn conversations_for_item(&self, item_id: i64) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, item_id, sender_id, receiver_id, created_at
            FROM conversations WHERE item_id = ?
            ORDER BY created_at DESC, conversation_id DESC
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.db)
        .await
        .context("查询条目会话失败")?;
        Ok(rows.into_iter().map(Self::row_to_conversation).collect())
    }

    /// 客服会话分页列表（item_id 为空的线程），按创建时间降序
    ///
    /// page 从 1 开始；同一时间戳用 conversation_id 兜底排序，保证分页确定性
    pub async fn support_conversations(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Conversation>> {
        let page = page.max(1);
        let offset = (page - 1) * page_size;
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, item_id, sender_id, receiver_id, created_at
            FROM conversations WHERE item_id IS NULL
            ORDER BY created_at DESC, conversation_id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.db)
        .await
        .context("分页查询客服会话失败")?;
        debug!(
            "[Store/Conv] 客服会话分页: page={}, page_size={}, 返回 {} 条",
            page,
            page_size,
            rows.len()
        );
        Ok(rows.into_iter().map(Self::row_to_conversation).collect())
    }

    /// 客服会话总数（分页器计算总页数用）
    pub async fn count_support_conversations(&self) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM conversations WHERE item_id IS NULL
            "#,
        )
        .fetch_one(&self.db)
        .await
        .context("统计客服会话失败")?;
        Ok(row.get("total"))
    }

    fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> Conversation {
        Conversation {
            conversation_id: row.get("conversation_id"),
            item_id: row.get("item_id"),
            sender_id: row.get("sender_id"),
            receiver_id: row.get("receiver_id"),
            created_at: row.get("created_at"),
        }
    }
}
