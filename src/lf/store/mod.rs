//! 数据存储层（sqlx / SQLite）
//!
//! 按领域拆分 DAO，把数据访问逻辑与业务逻辑分离。
//! DAO 在写入成功后向实时总线发出对应表的变更事件，
//! 模拟托管后端的表变更流。

pub mod conversation_dao;
pub mod item_dao;
pub mod message_dao;
pub mod notification_dao;
pub mod role_dao;

use crate::lf::bus::LocalBus;
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tracing::info;

pub use conversation_dao::ConversationDao;
pub use item_dao::ItemDao;
pub use message_dao::MessageDao;
pub use notification_dao::NotificationDao;
pub use role_dao::RoleDao;

/// 门户数据存储：连接池 + 各领域 DAO
pub struct PortalStore {
    pub items: ItemDao,
    pub conversations: ConversationDao,
    pub messages: MessageDao,
    pub notifications: NotificationDao,
    pub roles: RoleDao,
}

impl PortalStore {
    /// 连接数据库并初始化表结构
    ///
    /// 例如：`sqlite://portal.db?mode=rwc`
    pub async fn connect(db_url: &str, bus: Arc<LocalBus>) -> Result<Self> {
        // 内存库按连接隔离，多连接会各见各的空库
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .context(format!("连接 SQLite 数据库失败: {}", db_url))?;
        Self::with_pool(pool, bus).await
    }

    /// 内存数据库（测试与演示用）
    ///
    /// 注意：内存库按连接隔离，必须限制为单连接共享
    pub async fn connect_in_memory(bus: Arc<LocalBus>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("创建内存数据库失败")?;
        Self::with_pool(pool, bus).await
    }

    async fn with_pool(pool: Pool<Sqlite>, bus: Arc<LocalBus>) -> Result<Self> {
        init_db(&pool).await?;
        Ok(Self {
            items: ItemDao::new(pool.clone()),
            conversations: ConversationDao::new(pool.clone(), bus.clone()),
            messages: MessageDao::new(pool.clone(), bus.clone()),
            notifications: NotificationDao::new(pool.clone(), bus),
            roles: RoleDao::new(pool),
        })
    }
}

/// 初始化数据库表结构
async fn init_db(pool: &Pool<Sqlite>) -> Result<()> {
    info!("[Store] 初始化门户数据库表结构");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            title       TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status      TEXT NOT NULL DEFAULT 'lost',
            user_id     TEXT NOT NULL,
            claimed_by  TEXT,
            created_at  INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            item_id         INTEGER,
            sender_id       TEXT NOT NULL,
            receiver_id     TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            message_id      TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            content         TEXT NOT NULL,
            user_id         TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            title       TEXT NOT NULL,
            description TEXT,
            created_at  INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_notifications (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         TEXT NOT NULL CHECK (user_id <> ''),
            notification_id INTEGER NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_user_notifications_user
            ON user_notifications(user_id, created_at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS roles (
            id    INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS role_pages (
            role_id INTEGER NOT NULL,
            route   TEXT NOT NULL,
            PRIMARY KEY (role_id, route)
        )
        "#,
    ];

    for sql in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .context("初始化数据库表失败")?;
    }

    info!("[Store] 数据库表初始化完成");
    Ok(())
}
