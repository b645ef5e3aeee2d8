//! 消息数据访问层（DAO）
//!
//! 已读语义：is_read 表示"非作者已读"，所有统计都排除查询者自己发的消息

use crate::lf::bus::{LocalBus, ALL_MESSAGES_CHANGES};
use crate::lf::types::{now_millis, Message};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// 消息 DAO
pub struct MessageDao {
    db: Pool<Sqlite>,
    bus: Arc<LocalBus>,
}

impl MessageDao {
    pub fn new(db: Pool<Sqlite>, bus: Arc<LocalBus>) -> Self {
        Self { db, bus }
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(",")
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.db
    }

    /// 插入消息（is_read 固定为未读），成功后发出表变更事件
    pub async fn insert_message(
        &self,
        conversation_id: &str,
        content: &str,
        user_id: &str,
    ) -> Result<Message> {
        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            user_id: user_id.to_string(),
            created_at: now_millis(),
            is_read: false,
        };
        sqlx::query(
            r#"
            INSERT INTO messages (message_id, conversation_id, content, user_id, created_at, is_read)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.conversation_id)
        .bind(&message.content)
        .bind(&message.user_id)
        .bind(message.created_at)
        .execute(&self.db)
        .await
        .context("插入消息失败")?;

        debug!(
            "[Store/Msg] 插入消息: id={}, conversation={}",
            message.message_id, conversation_id
        );

        // 表变更流：与会话直发广播互为冗余，订阅端按消息 ID 去重
        if let Ok(payload) = serde_json::to_value(&message) {
            self.bus.publish(ALL_MESSAGES_CHANGES, "insert", payload);
        }
        Ok(message)
    }

    /// 会话历史消息，按创建时间升序
    pub async fn messages_by_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, conversation_id, content, user_id, created_at, is_read
            FROM messages WHERE conversation_id = ?
            ORDER BY created_at ASC, message_id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await
        .context("查询历史消息失败")?;
        Ok(rows.into_iter().map(Self::row_to_message).collect())
    }

    /// 批量置已读：会话内所有"非 reader 所发且未读"的消息
    ///
    /// 条件化批量 UPDATE，天然幂等；返回实际更新的行数
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_user_id: &str,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE messages SET is_read = 1
            WHERE conversation_id = ? AND user_id != ? AND is_read = 0
            "#,
        )
        .bind(conversation_id)
        .bind(reader_user_id)
        .execute(&self.db)
        .await
        .context("标记已读失败")?;
        debug!(
            "[Store/Msg] 标记已读: conversation={}, reader={}, 更新 {} 行",
            conversation_id,
            reader_user_id,
            res.rows_affected()
        );
        Ok(res.rows_affected())
    }

    /// 单个会话的未读数（排除 reader 自己发的消息）
    pub async fn unread_count(&self, conversation_id: &str, reader_user_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM messages
            WHERE conversation_id = ? AND user_id != ? AND is_read = 0
            "#,
        )
        .bind(conversation_id)
        .bind(reader_user_id)
        .fetch_one(&self.db)
        .await
        .context("统计未读数失败")?;
        Ok(row.get("total"))
    }

    /// 批量未读数：一次聚合查询覆盖整批会话，而不是逐个查询
    pub async fn unread_counts(
        &self,
        conversation_ids: &[String],
        reader_user_id: &str,
    ) -> Result<HashMap<String, i64>> {
        if conversation_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT conversation_id, COUNT(*) AS total FROM messages \
             WHERE user_id != ? AND is_read = 0 AND conversation_id IN ({}) \
             GROUP BY conversation_id",
            Self::placeholders(conversation_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(reader_user_id);
        for id in conversation_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.db)
            .await
            .context("批量统计未读数失败")?;

        // 没有未读消息的会话补 0
        let mut counts: HashMap<String, i64> = conversation_ids
            .iter()
            .map(|id| (id.clone(), 0))
            .collect();
        for row in rows {
            counts.insert(row.get("conversation_id"), row.get("total"));
        }
        Ok(counts)
    }

    /// 按条目聚合的批量未读数：汇总条目下所有会话的未读消息
    pub async fn unread_counts_by_items(
        &self,
        item_ids: &[i64],
        reader_user_id: &str,
    ) -> Result<HashMap<i64, i64>> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT c.item_id AS item_id, COUNT(*) AS total \
             FROM messages m JOIN conversations c ON m.conversation_id = c.conversation_id \
             WHERE m.user_id != ? AND m.is_read = 0 AND c.item_id IN ({}) \
             GROUP BY c.item_id",
            Self::placeholders(item_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(reader_user_id);
        for id in item_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.db)
            .await
            .context("按条目批量统计未读数失败")?;

        let mut counts: HashMap<i64, i64> = item_ids.iter().map(|id| (*id, 0)).collect();
        for row in rows {
            counts.insert(row.get("item_id"), row.get("total"));
        }
        Ok(counts)
    }

    fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Message {
        let is_read: i64 = row.get("is_read");
        Message {
            message_id: row.get("message_id"),
            conversation_id: row.get("conversation_id"),
            content: row.get("content"),
            user_id: row.get("user_id"),
            created_at: row.get("created_at"),
            is_read: is_read != 0,
        }
    }
}
