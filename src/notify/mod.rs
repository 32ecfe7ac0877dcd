// src/notify/mod.rs

//! Completion notifications.
//!
//! Executions publish a typed [`Notification`] when they finish or fail to
//! start; listener tasks deliver them to the manager as events. Transport is
//! Redis pub/sub on `{redis_prefix}.notifications`, or an in-process channel.

pub mod channel;
pub mod listener;
pub mod message;

pub use channel::{NotificationPublisher, RedisPublisher, RetryPolicy};
pub use listener::{RedisSource, spawn_listener};
pub use message::{LaunchFailureKind, Notification};
