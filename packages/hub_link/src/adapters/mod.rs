//! Feature adapters on top of [`ConnectionManager`](crate::ConnectionManager).
//!
//! Each adapter owns the subscriptions it makes and releases them on drop.

pub mod chat;
pub mod notifications;

pub use chat::{ChatChannel, ChatMessage, SenderRole};
pub use notifications::{LogToast, Notification, NotificationFeed, Toast, ToastSink};
