//! 失物招领门户 CLI（演示版）
//!
//! 非交互式 CLI，用于演示同步核心：发布条目、建会话聊天、
//! 输入状态、广播通知与未读角标

use anyhow::Result;
use clap::Parser;
use lostfound_portal_core::lf::bus::LocalBus;
use lostfound_portal_core::lf::conversation::{ConversationListener, ConversationSyncer};
use lostfound_portal_core::lf::item::ItemService;
use lostfound_portal_core::lf::notification::{NotificationListener, NotificationSyncer};
use lostfound_portal_core::lf::store::PortalStore;
use lostfound_portal_core::lf::types::{ItemStatus, Message, UserNotification, UserRole};
use lostfound_portal_core::lf::typing::{TypingAnnouncer, TypingListener, TypingWatcher};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::info;

/// 失物招领门户 CLI 演示
#[derive(Parser, Debug)]
#[command(name = "lostfound-cli")]
#[command(about = "失物招领门户 CLI - 演示会话/通知同步核心", long_about = None)]
struct Args {
    /// SQLite 数据库 URL（默认内存库）
    #[arg(long, default_value = "sqlite::memory:")]
    db_url: String,

    /// 日志级别（默认: info,lostfound_portal_core=debug）
    #[arg(long, default_value = "info,lostfound_portal_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 管理员侧会话监听器
struct AdminConversationListener;

#[async_trait::async_trait]
impl ConversationListener for AdminConversationListener {
    async fn on_conversation_opened(&self, conversation_id: String) {
        info!("[CLI/会话] 📂 会话已打开: {}", conversation_id);
    }

    async fn on_message_received(&self, message: Message) {
        info!(
            "[CLI/会话] 📨 收到新消息: {} 说「{}」",
            message.user_id, message.content
        );
    }

    async fn on_unread_changed(&self, conversation_id: String, count: i64) {
        info!("[CLI/会话] 📬 未读数变更: {} -> {}", conversation_id, count);
    }
}

/// 学生侧通知监听器
struct StudentNotificationListener;

#[async_trait::async_trait]
impl NotificationListener for StudentNotificationListener {
    async fn on_unread_changed(&self, count: i64) {
        info!("[CLI/通知] 🔔 未读角标: {}", count);
    }

    async fn on_notification_received(&self, row: UserNotification) {
        info!("[CLI/通知] 📣 收到新通知: notification_id={}", row.notification_id);
    }
}

/// 收件箱输入状态监听器
struct InboxTypingListener;

#[async_trait::async_trait]
impl TypingListener for InboxTypingListener {
    async fn on_typing_changed(&self, conversation_id: String, user_name: String, is_typing: bool) {
        if is_typing {
            info!("[CLI/输入] ⌨️ {} 正在输入…（会话 {}）", user_name, conversation_id);
        } else {
            info!("[CLI/输入] ⌨️ {} 停止输入（会话 {}）", user_name, conversation_id);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level);

    info!("[CLI] 🚀 失物招领门户演示");

    let bus = Arc::new(LocalBus::new());
    let store = Arc::new(PortalStore::connect(&args.db_url, bus.clone()).await?);

    // 角色与页面权限
    let admin_role = store.roles.insert_role("管理员").await?;
    store.roles.insert_role_page(admin_role.id, "/admin/items").await?;
    store.roles.insert_role_page(admin_role.id, "/admin/inbox").await?;
    info!(
        "[CLI] 👤 角色解析: id={} -> {}",
        admin_role.id,
        UserRole::resolve(admin_role.id).label()
    );

    // 学生通知同步器：先启动订阅，再看角标实时变化
    let mut student_notifications = NotificationSyncer::with_listener(
        store.clone(),
        bus.clone(),
        "stu_xiaoming".into(),
        Arc::new(StudentNotificationListener),
    );
    student_notifications.start().await?;

    // 管理员发布拾获条目，触发广播通知
    let system_notifier = Arc::new(NotificationSyncer::new(
        store.clone(),
        bus.clone(),
        "system".into(),
    ));
    let items = ItemService::new(store.clone(), system_notifier);
    let item = items
        .post_item(
            "admin_wang",
            "黑色钱包",
            "图书馆三楼自习区拾获",
            ItemStatus::Found,
            &["stu_xiaoming".to_string(), "stu_xiaohong".to_string()],
        )
        .await?;
    sleep(Duration::from_millis(50)).await;
    info!(
        "[CLI] 📋 条目已发布: id={}, 学生未读角标: {}",
        item.id,
        student_notifications.live_unread()
    );

    // 学生就该条目联系管理员：首次联系惰性建会话
    let conversation = store
        .conversations
        .find_or_create(Some(item.id), "stu_xiaoming", "admin_wang")
        .await?;

    // 双方各自打开会话
    let mut student_chat =
        ConversationSyncer::new(store.clone(), bus.clone(), "stu_xiaoming".into());
    student_chat.open(&conversation.conversation_id).await?;

    let mut admin_chat = ConversationSyncer::with_listener(
        store.clone(),
        bus.clone(),
        "admin_wang".into(),
        Arc::new(AdminConversationListener),
    );
    admin_chat.open(&conversation.conversation_id).await?;

    // 管理员收件箱观察输入状态
    let typing_watcher = TypingWatcher::new(
        bus.clone(),
        "admin_wang".into(),
        Arc::new(InboxTypingListener),
    );
    typing_watcher.watch(&conversation.conversation_id);

    let announcer = TypingAnnouncer::new(bus.clone(), "stu_xiaoming".into(), "小明".into());
    announcer.announce(&conversation.conversation_id);
    sleep(Duration::from_millis(50)).await;

    student_chat.send("您好，这个钱包是我的，里面有我的校园卡").await?;
    sleep(Duration::from_millis(50)).await;
    admin_chat.send("好的，请带学生证到失物招领处核对").await?;
    sleep(Duration::from_millis(50)).await;

    info!(
        "[CLI] 💬 管理员视角消息数: {}",
        admin_chat.messages().await.len()
    );

    // 管理员标记认领
    items.mark_claimed(item.id, "stu_xiaoming").await?;
    let claimed = store.items.get_item(item.id).await?.expect("条目应存在");
    info!(
        "[CLI] ✅ 条目已认领: status={}, claimed_by={:?}",
        claimed.status.as_str(),
        claimed.claimed_by
    );

    // 客服收件箱分页
    store
        .conversations
        .find_or_create(None, "stu_xiaohong", "admin_wang")
        .await?;
    let total = store.conversations.count_support_conversations().await?;
    let page1 = store.conversations.support_conversations(1, 10).await?;
    info!(
        "[CLI] 📥 客服收件箱: 共 {} 条, 第 1 页 {} 条",
        total,
        page1.len()
    );

    // 学生打开通知列表并全部置已读
    let list = student_notifications.open_list().await?;
    info!("[CLI] 🔔 学生通知列表: {} 条", list.len());
    student_notifications.mark_all_read().await?;
    info!(
        "[CLI] 🔔 全部置已读后角标: {}",
        student_notifications.live_unread()
    );

    info!("[CLI] 👋 演示结束");
    Ok(())
}
