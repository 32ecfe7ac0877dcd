// src/access.rs

//! Permissioned access to the manager.
//!
//! Callers never touch the manager state directly: [`ManagerHandle`] sends
//! `ManagerEvent`s and awaits the replies, and filters what it returns
//! through a [`PermissionPolicy`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::data::{DataId, DataObject, DataRequest};
use crate::engine::{CancelOutcome, ManagerEvent};
use crate::errors::{FlowError, Result};
use crate::types::PermissionMode;

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    User(String),
    /// Bypasses every permission check.
    Superuser,
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Principal::User(name.into())
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Principal::User(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => f.write_str("anonymous"),
            Principal::User(name) => f.write_str(name),
            Principal::Superuser => f.write_str("superuser"),
        }
    }
}

pub trait PermissionPolicy: Send + Sync + fmt::Debug {
    fn can_create(&self, who: &Principal, process: &str) -> bool;

    fn can_view(&self, who: &Principal, object: &DataObject) -> bool;

    fn can_cancel(&self, who: &Principal, object: &DataObject) -> bool {
        self.can_view(who, object)
    }
}

/// Authenticated users create; owners see and cancel their own objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerPolicy;

impl PermissionPolicy for OwnerPolicy {
    fn can_create(&self, who: &Principal, _process: &str) -> bool {
        !matches!(who, Principal::Anonymous)
    }

    fn can_view(&self, who: &Principal, object: &DataObject) -> bool {
        match who {
            Principal::Superuser => true,
            Principal::User(name) => object.owner.as_deref() == Some(name.as_str()),
            Principal::Anonymous => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl PermissionPolicy for AllowAllPolicy {
    fn can_create(&self, _who: &Principal, _process: &str) -> bool {
        true
    }

    fn can_view(&self, _who: &Principal, _object: &DataObject) -> bool {
        true
    }
}

pub fn policy_for(mode: PermissionMode) -> Arc<dyn PermissionPolicy> {
    match mode {
        PermissionMode::Owner => Arc::new(OwnerPolicy),
        PermissionMode::AllowAll => Arc::new(AllowAllPolicy),
    }
}

/// Cloneable client for a running manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerEvent>,
    policy: Arc<dyn PermissionPolicy>,
}

impl ManagerHandle {
    pub fn new(tx: mpsc::Sender<ManagerEvent>, policy: Arc<dyn PermissionPolicy>) -> Self {
        Self { tx, policy }
    }

    /// Create a data object owned by `who` and enqueue it.
    pub async fn create(&self, who: &Principal, request: DataRequest) -> Result<DataId> {
        if !self.policy.can_create(who, &request.process) {
            return Err(FlowError::PermissionDenied(format!(
                "{who} may not run process '{}'",
                request.process
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerEvent::Submit {
                request,
                owner: who.name().map(str::to_string),
                reply: Some(reply),
            })
            .await?;
        recv(rx).await?
    }

    /// Current state of a data object.
    ///
    /// Objects `who` may not view are reported as unknown, so their
    /// existence is not revealed.
    pub async fn status(&self, who: &Principal, id: DataId) -> Result<DataObject> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ManagerEvent::Query { id, reply }).await?;
        match recv(rx).await? {
            Some(object) if self.policy.can_view(who, &object) => Ok(object),
            _ => Err(FlowError::UnknownData(id)),
        }
    }

    pub async fn cancel(&self, who: &Principal, id: DataId) -> Result<CancelOutcome> {
        let object = self.status(who, id).await?;
        if !self.policy.can_cancel(who, &object) {
            return Err(FlowError::PermissionDenied(format!(
                "{who} may not cancel data object {id}"
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerEvent::Cancel {
                id,
                reply: Some(reply),
            })
            .await?;
        recv(rx).await?
    }

    /// Every data object `who` may view, in id order.
    pub async fn list(&self, who: &Principal) -> Result<Vec<DataObject>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ManagerEvent::List { reply }).await?;
        let mut objects = recv(rx).await?;
        objects.retain(|o| self.policy.can_view(who, o));
        Ok(objects)
    }

    /// Tell the manager no more submissions will arrive.
    pub async fn close_submissions(&self) -> Result<()> {
        self.tx.send(ManagerEvent::CloseSubmissions).await?;
        Ok(())
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await
        .map_err(|_| FlowError::ChannelError("manager stopped before replying".to_string()))
}
