//! 条目生命周期服务层
//!
//! 发布、认领、取消认领、删除。发布成功后向接收者广播"新条目"通知，
//! 通知只是副作用：任何广播失败都被吞掉并记日志，发布本身照常成功。

use crate::lf::notification::NotificationSyncer;
use crate::lf::store::PortalStore;
use crate::lf::types::{Item, ItemStatus};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// 条目服务
pub struct ItemService {
    store: Arc<PortalStore>,
    notifier: Arc<NotificationSyncer>,
}

impl ItemService {
    pub fn new(store: Arc<PortalStore>, notifier: Arc<NotificationSyncer>) -> Self {
        Self { store, notifier }
    }

    /// 发布条目，并尽力广播"新条目"通知给接收者列表
    ///
    /// 通知失败绝不传播为发布失败
    pub async fn post_item(
        &self,
        user_id: &str,
        title: &str,
        description: &str,
        status: ItemStatus,
        recipient_ids: &[String],
    ) -> Result<Item> {
        let item = self
            .store
            .items
            .insert_item(title, description, status, user_id)
            .await?;
        info!("[Item] 发布条目: id={}, title={}", item.id, title);

        let prefix = match status {
            ItemStatus::Found => "新拾获",
            _ => "新寻物",
        };
        let notify_title = format!("{}: {}", prefix, title);
        if let Err(e) = self
            .notifier
            .broadcast(&notify_title, Some(description), recipient_ids)
            .await
        {
            // 通知是副作用，失败只记日志
            warn!("[Item] 发布后广播通知失败（已忽略）: {:?}", e);
        }
        Ok(item)
    }

    /// 管理员标记条目已认领
    pub async fn mark_claimed(&self, item_id: i64, claimed_by: &str) -> Result<()> {
        let updated = self.store.items.mark_claimed(item_id, claimed_by).await?;
        if updated == 0 {
            return Err(anyhow!("条目不存在: id={}", item_id));
        }
        Ok(())
    }

    /// 管理员取消认领，状态回退为 lost
    pub async fn mark_unclaimed(&self, item_id: i64) -> Result<()> {
        let updated = self.store.items.mark_unclaimed(item_id).await?;
        if updated == 0 {
            return Err(anyhow!("条目不存在: id={}", item_id));
        }
        Ok(())
    }

    /// 管理员删除条目
    pub async fn delete_item(&self, item_id: i64) -> Result<()> {
        let updated = self.store.items.delete_item(item_id).await?;
        if updated == 0 {
            return Err(anyhow!("条目不存在: id={}", item_id));
        }
        info!("[Item] 删除条目: id={}", item_id);
        Ok(())
    }
}
