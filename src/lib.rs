pub mod lf;

// 重新导出常用类型和函数，方便外部使用
pub use lf::{
    bus::{BusEvent, LocalBus, Subscription},
    conversation::{ConversationListener, ConversationSyncer},
    error::SyncError,
    item::ItemService,
    notification::NotificationSyncer,
    store::PortalStore,
    types::{Conversation, Item, ItemStatus, Message, Notification, UserNotification, UserRole},
    typing::{TypingAnnouncer, TypingWatcher},
};
