//! 通知数据访问层（DAO）
//!
//! Notification 本体不携带任何按用户的状态；
//! 每个接收者的已读状态只记录在 user_notifications 关联行上

use crate::lf::bus::{LocalBus, USER_NOTIFICATIONS_CHANGES};
use crate::lf::types::{now_millis, Notification, UserNotification};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use tracing::debug;

/// 通知 DAO
pub struct NotificationDao {
    db: Pool<Sqlite>,
    bus: Arc<LocalBus>,
}

impl NotificationDao {
    pub fn new(db: Pool<Sqlite>, bus: Arc<LocalBus>) -> Self {
        Self { db, bus }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.db
    }

    /// 新建通知本体
    pub async fn insert_notification(
        &self,
        title: &str,
        description: Option<&str>,
    ) -> Result<Notification> {
        let created_at = now_millis();
        let res = sqlx::query(
            r#"
            INSERT INTO notifications (title, description, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(title)
        .bind(description)
        .bind(created_at)
        .execute(&self.db)
        .await
        .context("插入通知失败")?;

        let id = res.last_insert_rowid();
        debug!("[Store/Notify] 新建通知: id={}, title={}", id, title);
        Ok(Notification {
            id,
            title: title.to_string(),
            description: description.map(|s| s.to_string()),
            created_at,
        })
    }

    /// 为单个接收者插入关联行，成功后发出表变更事件
    pub async fn insert_user_notification(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<UserNotification> {
        let created_at = now_millis();
        let res = sqlx::query(
            r#"
            INSERT INTO user_notifications (user_id, notification_id, is_read, created_at)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(user_id)
        .bind(notification_id)
        .bind(created_at)
        .execute(&self.db)
        .await
        .context("插入用户通知失败")?;

        let row = UserNotification {
            id: res.last_insert_rowid(),
            user_id: user_id.to_string(),
            notification_id,
            is_read: false,
            created_at,
            notification: None,
        };
        if let Ok(payload) = serde_json::to_value(&row) {
            self.bus.publish(USER_NOTIFICATIONS_CHANGES, "insert", payload);
        }
        Ok(row)
    }

    /// 某用户的通知列表：关联行联表通知本体，按创建时间降序
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<UserNotification>> {
        let rows = sqlx::query(
            r#"
            SELECT un.id AS un_id, un.user_id, un.notification_id, un.is_read,
                   un.created_at AS un_created_at,
                   n.title, n.description, n.created_at AS n_created_at
            FROM user_notifications un
            JOIN notifications n ON n.id = un.notification_id
            WHERE un.user_id = ?
            ORDER BY un.created_at DESC, un.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("查询用户通知列表失败")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let is_read: i64 = row.get("is_read");
                UserNotification {
                    id: row.get("un_id"),
                    user_id: row.get("user_id"),
                    notification_id: row.get("notification_id"),
                    is_read: is_read != 0,
                    created_at: row.get("un_created_at"),
                    notification: Some(Notification {
                        id: row.get("notification_id"),
                        title: row.get("title"),
                        description: row.get("description"),
                        created_at: row.get("n_created_at"),
                    }),
                }
            })
            .collect())
    }

    /// 单条置已读；已读时更新 0 行，不报错
    pub async fn mark_read(&self, user_notification_id: i64) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE user_notifications SET is_read = 1 WHERE id = ? AND is_read = 0
            "#,
        )
        .bind(user_notification_id)
        .execute(&self.db)
        .await
        .context("标记通知已读失败")?;
        Ok(res.rows_affected())
    }

    /// 全部置已读；幂等
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE user_notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0
            "#,
        )
        .bind(user_id)
        .execute(&self.db)
        .await
        .context("批量标记通知已读失败")?;
        debug!(
            "[Store/Notify] 全部置已读: user={}, 更新 {} 行",
            user_id,
            res.rows_affected()
        );
        Ok(res.rows_affected())
    }

    /// 某用户的未读通知数
    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM user_notifications
            WHERE user_id = ? AND is_read = 0
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await
        .context("统计未读通知失败")?;
        Ok(row.get("total"))
    }
}
