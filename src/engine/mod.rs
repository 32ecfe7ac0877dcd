// src/engine/mod.rs

//! Scheduler and manager.
//!
//! The pure core state machine lives in [`core`]: it owns every data object,
//! the dispatch queue and the concurrency limits, and turns
//! [`ManagerEvent`]s into [`CoreCommand`]s. The async shell that reads events
//! from a channel and talks to the executor is [`runtime`].

use tokio::sync::oneshot;

use crate::data::{DataId, DataObject, DataRequest};
use crate::errors::Result;
use crate::notify::Notification;

pub mod core;
pub mod event_handlers;
pub mod limits;
pub mod queue;
pub mod runtime;

pub use core::{CancelOutcome, CoreManager, LaunchFailureOutcome};
pub use event_handlers::{CoreCommand, CoreStep};
pub use limits::ConcurrencyLimits;
pub use queue::DispatchQueue;
pub use runtime::Runtime;

/// Options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Exit once submissions are closed and nothing is left to run (used
    /// for `--once` and batch runs).
    pub exit_when_idle: bool,
    /// Whether the notification channel is usable at startup. With Redis this
    /// starts `false` until the listener has subscribed.
    pub channel_available: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            exit_when_idle: false,
            channel_available: true,
        }
    }
}

/// Events flowing into the manager from the access layer, the notification
/// listener, retry timers and signal handlers.
#[derive(Debug)]
pub enum ManagerEvent {
    /// Create a data object and enqueue it.
    Submit {
        request: DataRequest,
        owner: Option<String>,
        reply: Option<oneshot::Sender<Result<DataId>>>,
    },
    /// Re-try enqueueing an object still in `Created`.
    Enqueue {
        id: DataId,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// A completion notification arrived.
    Notified(Notification),
    /// Backoff for a failed launch elapsed.
    RetryLaunch { id: DataId },
    Cancel {
        id: DataId,
        reply: Option<oneshot::Sender<Result<CancelOutcome>>>,
    },
    Query {
        id: DataId,
        reply: oneshot::Sender<Option<DataObject>>,
    },
    List {
        reply: oneshot::Sender<Vec<DataObject>>,
    },
    /// The notification channel went down or came back.
    ChannelStatus { available: bool },
    /// No more submissions will arrive.
    CloseSubmissions,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}
