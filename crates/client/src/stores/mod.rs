//! Stores for client state shared across consumers.

pub mod notifications;

pub use notifications::{
    change_notification, NotificationBuffer, NotificationSink, NOTIFICATION_CAPACITY,
};
