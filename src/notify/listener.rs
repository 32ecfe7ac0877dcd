// src/notify/listener.rs

//! Receiving side of the notification channel.
//!
//! Listener tasks turn incoming [`Notification`]s into
//! `ManagerEvent::Notified` and report channel availability with
//! `ManagerEvent::ChannelStatus`, so the manager can halt dispatch while
//! Redis is unreachable.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ManagerEvent;
use crate::notify::channel::RetryPolicy;
use crate::notify::message::Notification;

/// Redis subscription parameters.
#[derive(Debug, Clone)]
pub struct RedisSource {
    pub client: redis::Client,
    pub channel: String,
    pub retry: RetryPolicy,
}

/// Spawn the listener tasks.
///
/// The in-process receiver is always drained (it also carries Redis
/// fallback deliveries); the Redis subscriber runs only when configured.
pub fn spawn_listener(
    local_rx: mpsc::Receiver<Notification>,
    redis: Option<RedisSource>,
    manager_tx: mpsc::Sender<ManagerEvent>,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![tokio::spawn(forward_local(local_rx, manager_tx.clone()))];
    if let Some(source) = redis {
        handles.push(tokio::spawn(subscribe_loop(source, manager_tx)));
    }
    handles
}

async fn forward_local(mut rx: mpsc::Receiver<Notification>, tx: mpsc::Sender<ManagerEvent>) {
    while let Some(notification) = rx.recv().await {
        debug!(data_id = notification.data_id(), "in-process notification received");
        if tx.send(ManagerEvent::Notified(notification)).await.is_err() {
            break;
        }
    }
    debug!("in-process notification listener finished");
}

async fn subscribe_loop(source: RedisSource, tx: mpsc::Sender<ManagerEvent>) {
    let mut failures: u32 = 0;

    loop {
        match subscribe_and_forward(&source, &tx, &mut failures).await {
            Ok(()) => {
                debug!("manager event channel closed; redis listener stopping");
                return;
            }
            Err(e) => {
                failures += 1;
                if failures == 1
                    && tx
                        .send(ManagerEvent::ChannelStatus { available: false })
                        .await
                        .is_err()
                {
                    return;
                }
                let delay = source.retry.delay(failures);
                warn!(
                    channel = %source.channel,
                    error = %e,
                    failures,
                    ?delay,
                    "notification subscription failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Subscribe and forward until the stream ends (error) or the manager goes
/// away (`Ok`).
async fn subscribe_and_forward(
    source: &RedisSource,
    tx: &mpsc::Sender<ManagerEvent>,
    failures: &mut u32,
) -> anyhow::Result<()> {
    let mut pubsub = source.client.get_async_pubsub().await?;
    pubsub.subscribe(&source.channel).await?;

    info!(channel = %source.channel, "subscribed to notification channel");
    *failures = 0;
    if tx.send(ManagerEvent::ChannelStatus { available: true }).await.is_err() {
        return Ok(());
    }

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unreadable notification payload; skipping");
                continue;
            }
        };
        let notification = match Notification::from_payload(&payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, payload = %payload, "malformed notification; skipping");
                continue;
            }
        };
        if tx.send(ManagerEvent::Notified(notification)).await.is_err() {
            return Ok(());
        }
    }

    anyhow::bail!("notification stream ended")
}
