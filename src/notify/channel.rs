// src/notify/channel.rs

//! Publishing side of the notification channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crate::errors::{FlowError, Result};
use crate::notify::message::Notification;

/// Exponential backoff for transient channel failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per publish before giving up on the channel.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Where executions send their completion notifications.
#[derive(Clone)]
pub enum NotificationPublisher {
    /// Straight into the manager's in-process listener.
    InProcess(mpsc::Sender<Notification>),
    /// Redis `PUBLISH`, falling back to the in-process channel when Redis
    /// stays unavailable, so completions are never dropped.
    Redis(RedisPublisher),
}

impl fmt::Debug for NotificationPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationPublisher::InProcess(_) => f.write_str("NotificationPublisher::InProcess"),
            NotificationPublisher::Redis(r) => f
                .debug_struct("NotificationPublisher::Redis")
                .field("channel", &r.channel)
                .finish_non_exhaustive(),
        }
    }
}

impl NotificationPublisher {
    pub async fn publish(&self, notification: Notification) -> Result<()> {
        match self {
            NotificationPublisher::InProcess(tx) => {
                tx.send(notification).await?;
                Ok(())
            }
            NotificationPublisher::Redis(redis) => redis.publish(notification).await,
        }
    }
}

#[derive(Clone)]
pub struct RedisPublisher {
    client: redis::Client,
    channel: String,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    fallback: mpsc::Sender<Notification>,
    retry: RetryPolicy,
}

impl RedisPublisher {
    pub fn new(
        client: redis::Client,
        channel: String,
        fallback: mpsc::Sender<Notification>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            channel,
            conn: Arc::new(Mutex::new(None)),
            fallback,
            retry,
        }
    }

    async fn publish(&self, notification: Notification) -> Result<()> {
        let payload = notification.to_payload()?;

        for attempt in 1..=self.retry.attempts {
            let delay = self.retry.delay(attempt);
            match publish_outcome(self.try_publish(&payload).await) {
                Ok(receivers) => {
                    debug!(
                        data_id = notification.data_id(),
                        receivers,
                        channel = %self.channel,
                        "published notification"
                    );
                    return Ok(());
                }
                Err(PublishFailure::NoSubscribers) => {
                    warn!(
                        data_id = notification.data_id(),
                        attempt,
                        channel = %self.channel,
                        ?delay,
                        "no subscriber received the notification; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(PublishFailure::Redis(e)) => {
                    warn!(
                        data_id = notification.data_id(),
                        attempt,
                        error = %e,
                        ?delay,
                        "publishing notification failed; retrying"
                    );
                    // Drop the cached connection so the next attempt reconnects.
                    *self.conn.lock().await = None;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        error!(
            data_id = notification.data_id(),
            channel = %self.channel,
            "notification not delivered over redis; delivering in-process"
        );
        self.fallback
            .send(notification)
            .await
            .map_err(|e| FlowError::ChannelError(e.to_string()))
    }

    async fn try_publish(&self, payload: &str) -> redis::RedisResult<i64> {
        let mut conn = {
            let mut guard = self.conn.lock().await;
            match guard.as_ref() {
                Some(conn) => conn.clone(),
                None => {
                    let conn = self.client.get_multiplexed_async_connection().await?;
                    *guard = Some(conn.clone());
                    conn
                }
            }
        };
        conn.publish(&self.channel, payload).await
    }
}

/// Why a single `PUBLISH` did not deliver.
#[derive(Debug)]
enum PublishFailure {
    /// Redis accepted the message but nobody was subscribed, so it is gone.
    NoSubscribers,
    Redis(redis::RedisError),
}

/// A publish only counts once at least one subscriber received it.
fn publish_outcome(result: redis::RedisResult<i64>) -> std::result::Result<i64, PublishFailure> {
    match result {
        Ok(receivers) if receivers > 0 => Ok(receivers),
        Ok(_) => Err(PublishFailure::NoSubscribers),
        Err(e) => Err(PublishFailure::Redis(e)),
    }
}
