pub mod bus;
pub mod conversation;
pub mod error;
pub mod item;
pub mod notification;
pub mod store;
pub mod types;
pub mod typing;

// 重新导出会话同步相关类型和函数
pub use conversation::{ConversationListener, ConversationSyncer};
pub use error::SyncError;
pub use store::PortalStore;
