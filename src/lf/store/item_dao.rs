//! 条目数据访问层（DAO）

use crate::lf::types::{now_millis, Item, ItemStatus};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 条目 DAO
pub struct ItemDao {
    db: Pool<Sqlite>,
}

impl ItemDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 新建条目（丢失/拾获）
    pub async fn insert_item(
        &self,
        title: &str,
        description: &str,
        status: ItemStatus,
        user_id: &str,
    ) -> Result<Item> {
        let created_at = now_millis();
        let res = sqlx::query(
            r#"
            INSERT INTO items (title, description, status, user_id, claimed_by, created_at)
            VALUES (?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(title)
        .bind(description)
        .bind(status.as_str())
        .bind(user_id)
        .bind(created_at)
        .execute(&self.db)
        .await
        .context("插入条目失败")?;

        let id = res.last_insert_rowid();
        debug!("[Store/Item] 新建条目: id={}, title={}", id, title);
        Ok(Item {
            id,
            title: title.to_string(),
            description: description.to_string(),
            status,
            user_id: user_id.to_string(),
            claimed_by: None,
            created_at,
        })
    }

    /// 按 ID 查询条目
    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, description, status, user_id, claimed_by, created_at
            FROM items WHERE id = ?
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.db)
        .await
        .context("查询条目失败")?;
        Ok(row.map(Self::row_to_item))
    }

    /// 条目列表，按创建时间降序
    pub async fn list_items(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description, status, user_id, claimed_by, created_at
            FROM items ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询条目列表失败")?;
        Ok(rows.into_iter().map(Self::row_to_item).collect())
    }

    /// 条目搜索：关键字匹配标题/描述，可按状态过滤
    pub async fn search_items(
        &self,
        keyword: Option<&str>,
        status: Option<ItemStatus>,
    ) -> Result<Vec<Item>> {
        let mut clauses = vec!["1=1".to_string()];
        let mut binds: Vec<String> = Vec::new();

        if let Some(kw) = keyword {
            clauses.push("(title LIKE ? OR description LIKE ?)".to_string());
            let pattern = format!("%{}%", kw);
            binds.push(pattern.clone());
            binds.push(pattern);
        }
        if let Some(st) = status {
            clauses.push("status = ?".to_string());
            binds.push(st.as_str().to_string());
        }

        let sql = format!(
            "SELECT id, title, description, status, user_id, claimed_by, created_at \
             FROM items WHERE {} ORDER BY created_at DESC, id DESC",
            clauses.join(" AND ")
        );
        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.db).await.context("搜索条目失败")?;
        Ok(rows.into_iter().map(Self::row_to_item).collect())
    }

    /// 标记条目已被认领：status -> claimed, claimed_by -> 认领人
    pub async fn mark_claimed(&self, item_id: i64, claimed_by: &str) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE items SET status = 'claimed', claimed_by = ? WHERE id = ?
            "#,
        )
        .bind(claimed_by)
        .bind(item_id)
        .execute(&self.db)
        .await
        .context("标记条目已认领失败")?;
        debug!(
            "[Store/Item] 标记认领: id={}, claimed_by={}",
            item_id, claimed_by
        );
        Ok(res.rows_affected())
    }

    /// 取消认领：claimed_by 置空，状态回退为 lost
    pub async fn mark_unclaimed(&self, item_id: i64) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE items SET status = 'lost', claimed_by = NULL WHERE id = ?
            "#,
        )
        .bind(item_id)
        .execute(&self.db)
        .await
        .context("取消认领失败")?;
        debug!("[Store/Item] 取消认领: id={}", item_id);
        Ok(res.rows_affected())
    }

    /// 删除条目（管理员操作）
    pub async fn delete_item(&self, item_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(item_id)
            .execute(&self.db)
            .await
            .context("删除条目失败")?;
        Ok(res.rows_affected())
    }

    fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Item {
        let status: String = row.get("status");
        Item {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            status: ItemStatus::parse(&status),
            user_id: row.get("user_id"),
            claimed_by: row.get("claimed_by"),
            created_at: row.get("created_at"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lf::bus::LocalBus;
    use crate::lf::store::PortalStore;
    use std::sync::Arc;

    async fn store() -> PortalStore {
        PortalStore::connect_in_memory(Arc::new(LocalBus::new()))
            .await
            .expect("内存库初始化失败")
    }

    #[tokio::test]
    async fn test_claim_and_unclaim_round_trip() {
        let store = store().await;
        let item = store
            .items
            .insert_item("黑色钱包", "图书馆三楼拾获", ItemStatus::Found, "admin_1")
            .await
            .unwrap();
        assert!(item.claimed_by.is_none());

        store.items.mark_claimed(item.id, "stu_42").await.unwrap();
        let claimed = store.items.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, ItemStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("stu_42"));

        store.items.mark_unclaimed(item.id).await.unwrap();
        let reset = store.items.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(reset.status, ItemStatus::Lost);
        assert!(reset.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_search_items_by_keyword_and_status() {
        let store = store().await;
        store
            .items
            .insert_item("校园卡", "食堂丢失", ItemStatus::Lost, "stu_1")
            .await
            .unwrap();
        store
            .items
            .insert_item("蓝色雨伞", "教学楼拾获", ItemStatus::Found, "stu_2")
            .await
            .unwrap();

        let hits = store
            .items
            .search_items(Some("雨伞"), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "蓝色雨伞");

        let lost = store
            .items
            .search_items(None, Some(ItemStatus::Lost))
            .await
            .unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].title, "校园卡");
    }

    #[tokio::test]
    async fn test_delete_item() {
        let store = store().await;
        let item = store
            .items
            .insert_item("钥匙串", "", ItemStatus::Lost, "stu_1")
            .await
            .unwrap();
        assert_eq!(store.items.delete_item(item.id).await.unwrap(), 1);
        assert!(store.items.get_item(item.id).await.unwrap().is_none());
        // 再删一次影响 0 行
        assert_eq!(store.items.delete_item(item.id).await.unwrap(), 0);
    }
}
