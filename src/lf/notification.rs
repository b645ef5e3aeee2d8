//! 通知同步服务层
//!
//! 广播通知的扇出与按接收者的已读状态维护，独立于会话同步器。
//! 扇出是尽力而为：部分接收者失败只记录日志，永远不作为
//! 触发它的主操作（如发布条目）的失败向上传播。

use crate::lf::bus::{BusEvent, LocalBus, Subscription, USER_NOTIFICATIONS_CHANGES};
use crate::lf::error::SyncError;
use crate::lf::store::PortalStore;
use crate::lf::types::{Notification, UserNotification};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 通知监听器回调接口
#[async_trait]
pub trait NotificationListener: Send + Sync {
    /// 未读角标数变更
    async fn on_unread_changed(&self, count: i64);

    /// 实时订阅送达一条发给本用户的新通知
    async fn on_notification_received(&self, user_notification: UserNotification);
}

/// 空实现（默认监听器）
pub struct EmptyNotificationListener;

#[async_trait]
impl NotificationListener for EmptyNotificationListener {
    async fn on_unread_changed(&self, _count: i64) {}
    async fn on_notification_received(&self, _user_notification: UserNotification) {}
}

/// 通知同步器（单用户视角）
pub struct NotificationSyncer {
    store: Arc<PortalStore>,
    bus: Arc<LocalBus>,
    user_id: String,
    listener: Arc<dyn NotificationListener>,
    /// 本地增量未读计数：订阅送达 +1，打开列表时重置为查询值
    unread: Arc<AtomicI64>,
    subscription: Option<Subscription>,
}

impl NotificationSyncer {
    pub fn new(store: Arc<PortalStore>, bus: Arc<LocalBus>, user_id: String) -> Self {
        Self::with_listener(store, bus, user_id, Arc::new(EmptyNotificationListener))
    }

    pub fn with_listener(
        store: Arc<PortalStore>,
        bus: Arc<LocalBus>,
        user_id: String,
        listener: Arc<dyn NotificationListener>,
    ) -> Self {
        Self {
            store,
            bus,
            user_id,
            listener,
            unread: Arc::new(AtomicI64::new(0)),
            subscription: None,
        }
    }

    /// 建立实时订阅并初始化未读计数
    pub async fn start(&mut self) -> Result<(), SyncError> {
        self.stop();
        let initial = self
            .store
            .notifications
            .unread_count(&self.user_id)
            .await
            .map_err(SyncError::LoadFailed)?;
        self.unread.store(initial, Ordering::SeqCst);

        let rx = self.bus.subscribe(USER_NOTIFICATIONS_CHANGES);
        let task = self.spawn_ingest(rx);
        self.subscription = Some(Subscription::new(vec![task]));
        info!(
            "[Notify] 通知同步器启动: user={}, 初始未读 {}",
            self.user_id, initial
        );
        Ok(())
    }

    /// 释放订阅；可重复调用
    pub fn stop(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    fn spawn_ingest(&self, mut rx: broadcast::Receiver<BusEvent>) -> tokio::task::JoinHandle<()> {
        let listener = self.listener.clone();
        let unread = self.unread.clone();
        let self_user_id = self.user_id.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[Notify] 订阅滞后，丢弃 {} 条事件", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.event != "insert" {
                    continue;
                }
                let row: UserNotification = match serde_json::from_value(event.payload) {
                    Ok(row) => row,
                    Err(e) => {
                        warn!("[Notify] 通知载荷解析失败: {:?}", e);
                        continue;
                    }
                };
                // 只处理发给本用户的关联行
                if row.user_id != self_user_id {
                    continue;
                }
                let count = unread.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("[Notify] 实时送达新通知: user={}, 未读 {}", self_user_id, count);
                listener.on_unread_changed(count).await;
                listener.on_notification_received(row).await;
            }
        })
    }

    /// 广播一条通知：先建通知本体，再逐个接收者扇出关联行
    ///
    /// 接收者列表可以为空；单个接收者失败只记日志并继续，
    /// 扇出的任何失败都不影响通知本体已创建的事实
    pub async fn broadcast(
        &self,
        title: &str,
        description: Option<&str>,
        recipient_ids: &[String],
    ) -> Result<Notification> {
        let notification = self
            .store
            .notifications
            .insert_notification(title, description)
            .await?;

        let mut delivered = 0usize;
        let mut failed = 0usize;
        for recipient in recipient_ids {
            match self
                .store
                .notifications
                .insert_user_notification(recipient, notification.id)
                .await
            {
                Ok(_) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        "[Notify] 接收者扇出失败: user={}, notification={}, err={:?}",
                        recipient, notification.id, e
                    );
                }
            }
        }
        if failed > 0 {
            // 部分失败只记录，不向上传播
            warn!(
                "[Notify] {}",
                SyncError::BroadcastPartialFailure { delivered, failed }
            );
        } else {
            info!(
                "[Notify] 广播通知完成: id={}, 送达 {} 个接收者",
                notification.id, delivered
            );
        }
        Ok(notification)
    }

    /// 打开通知列表：降序返回并把本地计数重置为最新查询值
    pub async fn open_list(&self) -> Result<Vec<UserNotification>, SyncError> {
        let list = self
            .store
            .notifications
            .list_for_user(&self.user_id)
            .await
            .map_err(SyncError::LoadFailed)?;
        let fresh = self
            .store
            .notifications
            .unread_count(&self.user_id)
            .await
            .map_err(SyncError::LoadFailed)?;
        self.unread.store(fresh, Ordering::SeqCst);
        self.listener.on_unread_changed(fresh).await;
        Ok(list)
    }

    /// 单条置已读；已读时为空操作
    pub async fn mark_read(&self, user_notification_id: i64) -> Result<u64, SyncError> {
        let updated = self
            .store
            .notifications
            .mark_read(user_notification_id)
            .await
            .map_err(SyncError::ReadMarkFailed)?;
        if updated > 0 {
            let count = (self.unread.fetch_sub(1, Ordering::SeqCst) - 1).max(0);
            self.listener.on_unread_changed(count).await;
        }
        Ok(updated)
    }

    /// 全部置已读；幂等
    pub async fn mark_all_read(&self) -> Result<u64, SyncError> {
        let updated = self
            .store
            .notifications
            .mark_all_read(&self.user_id)
            .await
            .map_err(SyncError::ReadMarkFailed)?;
        self.unread.store(0, Ordering::SeqCst);
        self.listener.on_unread_changed(0).await;
        Ok(updated)
    }

    /// 按需查询的未读数
    pub async fn unread_count(&self) -> Result<i64, SyncError> {
        self.store
            .notifications
            .unread_count(&self.user_id)
            .await
            .map_err(SyncError::LoadFailed)
    }

    /// 本地增量维护的未读数（角标直接读这里，不查库）
    pub fn live_unread(&self) -> i64 {
        self.unread.load(Ordering::SeqCst)
    }
}

impl Drop for NotificationSyncer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn setup() -> (Arc<PortalStore>, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(PortalStore::connect_in_memory(bus.clone()).await.unwrap());
        (store, bus)
    }

    async fn settle() {
        sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_fanout_partial_failure_keeps_notification_and_good_rows() {
        let (store, bus) = setup().await;
        let syncer = NotificationSyncer::new(store.clone(), bus, "admin_a".into());

        // 第二个接收者违反 user_id 非空约束，插入必然失败
        let recipients = vec!["stu_a".to_string(), "".to_string()];
        let notification = syncer
            .broadcast("新拾获: 校园卡", Some("食堂一楼"), &recipients)
            .await
            .expect("扇出部分失败不影响广播结果");

        // 通知本体与 A 的关联行都在
        let list = store.notifications.list_for_user("stu_a").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].notification_id, notification.id);
    }

    #[tokio::test]
    async fn test_empty_recipient_list_still_creates_notification() {
        let (store, bus) = setup().await;
        let syncer = NotificationSyncer::new(store.clone(), bus, "admin_a".into());
        let notification = syncer.broadcast("停电公告", None, &[]).await.unwrap();
        assert!(notification.id > 0);
    }

    #[tokio::test]
    async fn test_live_counter_increments_and_resets_on_open() {
        let (store, bus) = setup().await;
        let mut syncer = NotificationSyncer::new(store.clone(), bus.clone(), "stu_u".into());
        syncer.start().await.unwrap();
        assert_eq!(syncer.live_unread(), 0);

        let admin = NotificationSyncer::new(store.clone(), bus, "admin_a".into());
        admin
            .broadcast("公告一", None, &["stu_u".to_string(), "stu_v".to_string()])
            .await
            .unwrap();
        settle().await;
        // 只统计发给自己的那一行
        assert_eq!(syncer.live_unread(), 1);

        admin.broadcast("公告二", None, &["stu_u".to_string()]).await.unwrap();
        settle().await;
        assert_eq!(syncer.live_unread(), 2);

        // 打开列表后重置为最新查询值
        let list = syncer.open_list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(syncer.live_unread(), 2);

        syncer.mark_all_read().await.unwrap();
        assert_eq!(syncer.live_unread(), 0);
        assert_eq!(syncer.unread_count().await.unwrap(), 0);
        // 幂等
        assert_eq!(syncer.mark_all_read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_single_decrements() {
        let (store, bus) = setup().await;
        let mut syncer = NotificationSyncer::new(store.clone(), bus.clone(), "stu_u".into());
        syncer.start().await.unwrap();

        let admin = NotificationSyncer::new(store.clone(), bus, "admin_a".into());
        admin.broadcast("公告", None, &["stu_u".to_string()]).await.unwrap();
        settle().await;

        let list = syncer.open_list().await.unwrap();
        assert_eq!(syncer.mark_read(list[0].id).await.unwrap(), 1);
        assert_eq!(syncer.live_unread(), 0);
        // 重复置已读更新 0 行，计数不变
        assert_eq!(syncer.mark_read(list[0].id).await.unwrap(), 0);
        assert_eq!(syncer.live_unread(), 0);
    }
}
