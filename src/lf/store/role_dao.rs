//! 角色与页面权限数据访问层（DAO）
//!
//! 角色到路由的多对多关系按 (role_id, route) 一行一条存储；
//! 角色语义解析统一走 [`crate::lf::types::UserRole::resolve`]

use crate::lf::types::{Role, RolePage};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};

/// 角色 DAO
pub struct RoleDao {
    db: Pool<Sqlite>,
}

impl RoleDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 新建角色
    pub async fn insert_role(&self, title: &str) -> Result<Role> {
        let res = sqlx::query("INSERT INTO roles (title) VALUES (?)")
            .bind(title)
            .execute(&self.db)
            .await
            .context("插入角色失败")?;
        Ok(Role {
            id: res.last_insert_rowid(),
            title: title.to_string(),
        })
    }

    /// 为角色授权一个路由；重复授权静默忽略
    pub async fn insert_role_page(&self, role_id: i64, route: &str) -> Result<RolePage> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO role_pages (role_id, route) VALUES (?, ?)
            "#,
        )
        .bind(role_id)
        .bind(route)
        .execute(&self.db)
        .await
        .context("插入角色页面映射失败")?;
        Ok(RolePage {
            role_id,
            route: route.to_string(),
        })
    }

    /// 角色可访问的全部路由
    pub async fn accessible_routes(&self, role_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT route FROM role_pages WHERE role_id = ? ORDER BY route ASC
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.db)
        .await
        .context("查询角色路由失败")?;
        Ok(rows.into_iter().map(|r| r.get("route")).collect())
    }

    /// 权限检查：角色是否可访问某路由
    pub async fn has_access(&self, role_id: i64, route: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM role_pages WHERE role_id = ? AND route = ?
            "#,
        )
        .bind(role_id)
        .bind(route)
        .fetch_one(&self.db)
        .await
        .context("权限检查失败")?;
        let total: i64 = row.get("total");
        Ok(total > 0)
    }
}
