//! Transaction state and operation results.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backup::BackupId;
use crate::pool::PooledSession;

/// Lifecycle of a staged configuration change.
///
/// Only staged-commit platforms have one; direct-apply platforms apply
/// changes as they are entered and never create a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    NotStarted,
    Staged,
    Committed,
    /// Terminal marker after a rollback. Behaves like `NotStarted`.
    RolledBack,
    ConfirmPending,
}

impl TransactionState {
    /// Whether the transaction holds the device session.
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Staged | TransactionState::ConfirmPending)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::NotStarted => "not_started",
            TransactionState::Staged => "staged",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::ConfirmPending => "confirm_pending",
        })
    }
}

/// A staged change and the session it is staged on.
pub(crate) struct Transaction {
    pub owner: String,
    pub state: TransactionState,
    /// Held while the transaction is open.
    pub session: Option<PooledSession>,
    pub confirm_deadline: Option<Instant>,
    pub confirm_deadline_utc: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn open(owner: &str, session: PooledSession) -> Self {
        Self {
            owner: owner.to_string(),
            state: TransactionState::Staged,
            session: Some(session),
            confirm_deadline: None,
            confirm_deadline_utc: None,
        }
    }

    pub fn is_confirm_due(&self, now: Instant) -> bool {
        self.state == TransactionState::ConfirmPending
            && self.confirm_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Drop the session reference and land in `state`.
    pub fn close(&mut self, state: TransactionState) -> Option<PooledSession> {
        self.state = state;
        self.confirm_deadline = None;
        self.confirm_deadline_utc = None;
        self.session.take()
    }
}

/// Per-device engine bookkeeping.
#[derive(Default)]
pub(crate) struct DeviceEntry {
    pub transaction: Option<Transaction>,
    /// Most recent backup taken through the engine.
    pub last_backup: Option<BackupId>,
    /// Checkpoints taken before changes, oldest first.
    pub checkpoints: Vec<String>,
    /// Woken when the entry is unlocked with no open transaction.
    pub released: Arc<Notify>,
}

impl DeviceEntry {
    pub fn state(&self) -> TransactionState {
        self.transaction
            .as_ref()
            .map(|t| t.state)
            .unwrap_or_default()
    }

    pub fn owner(&self) -> Option<&str> {
        self.transaction.as_ref().map(|t| t.owner.as_str())
    }

    /// Open transaction owned by someone other than `caller`.
    pub fn foreign_owner(&self, caller: &str) -> Option<String> {
        self.transaction
            .as_ref()
            .filter(|t| t.state.is_open() && t.owner != caller)
            .map(|t| t.owner.clone())
    }

    /// Take the open transaction's session out for the duration of an
    /// operation.
    pub fn take_held(&mut self) -> Option<PooledSession> {
        self.transaction
            .as_mut()
            .filter(|t| t.state.is_open())
            .and_then(|t| t.session.take())
    }

    /// Whether an open transaction lost its session.
    pub fn is_broken(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|t| t.state.is_open() && t.session.as_ref().is_none_or(|s| !s.is_healthy()))
    }
}

/// Outcome of a configuration change.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeResult {
    pub device_id: String,
    /// Transaction state afterwards (staged platforms only).
    pub state: Option<TransactionState>,
    /// Checkpoint taken before the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// What a rollback or restore went back to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<String>,
    /// When an unconfirmed commit reverts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_deadline: Option<DateTime<Utc>>,
    /// Device output of the final step.
    pub output: String,
}

impl ChangeResult {
    pub(crate) fn new(device_id: &str, state: Option<TransactionState>) -> Self {
        Self {
            device_id: device_id.to_string(),
            state,
            checkpoint: None,
            restored_from: None,
            confirm_deadline: None,
            output: String::new(),
        }
    }

    pub(crate) fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub(crate) fn restored_from(mut self, source: impl Into<String>) -> Self {
        self.restored_from = Some(source.into());
        self
    }
}

/// Outcome of a candidate validation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub device_id: String,
    pub valid: bool,
    pub output: String,
}
