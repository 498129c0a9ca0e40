//! Configuration transaction engine.
//!
//! One engine serves every platform. Platforms with a staged candidate get a
//! state machine per device:
//!
//! ```text
//! NotStarted --stage--> Staged
//! Staged     --commit--> Committed | ConfirmPending (confirmed commit)
//! Staged     --discard--> NotStarted
//! Committed  --rollback--> RolledBack
//! ConfirmPending --confirm--> Committed
//! ConfirmPending --window expires--> RolledBack
//! ```
//!
//! An open transaction (`Staged`, `ConfirmPending`) keeps its session, and
//! with it the device lease, until it ends. Direct-apply platforms never
//! open one: changes are applied and the session is returned right away.
//!
//! Confirm windows are plain deadlines. They are checked at the start of
//! every operation on the device and by [`TransactionEngine::sweep_expired`],
//! which [`TransactionEngine::spawn_confirm_sweeper`] runs periodically.

mod state;

pub use state::{ChangeResult, CheckResult, TransactionState};

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::state::{DeviceEntry, Transaction};
use crate::backup::{BackupId, BackupStore, ConfigSnapshot};
use crate::device::Device;
use crate::error::{CommandError, ConfigError, Error, PoolError, Result};
use crate::executor::{StepOutput, run_plan};
use crate::platform::{ConfigFormat, ConfigQuery, Plan, RollbackTarget, VendorHandler};
use crate::pool::{PooledSession, Session, SessionPool};
use crate::settings::{ConflictPolicy, EngineConfig};

/// A locked device entry.
///
/// Unlocking an entry with no open transaction wakes the callers queued
/// behind one.
struct EntryGuard(OwnedMutexGuard<DeviceEntry>);

impl Deref for EntryGuard {
    type Target = DeviceEntry;

    fn deref(&self) -> &DeviceEntry {
        &self.0
    }
}

impl DerefMut for EntryGuard {
    fn deref_mut(&mut self) -> &mut DeviceEntry {
        &mut self.0
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if !self.0.state().is_open() {
            self.0.released.notify_waiters();
        }
    }
}

/// Session of a read, and where it goes back to.
enum Lease {
    /// Taken out of the open transaction.
    Held(PooledSession),
    /// Acquired for this operation, released at its end.
    Fresh(PooledSession),
}

impl Lease {
    fn session(&mut self) -> &mut PooledSession {
        match self {
            Lease::Held(session) | Lease::Fresh(session) => session,
        }
    }
}

/// Get/set/commit/rollback/confirm/backup/restore across platforms.
pub struct TransactionEngine {
    pool: Arc<SessionPool>,
    backups: Arc<dyn BackupStore>,
    config: EngineConfig,
    entries: Mutex<HashMap<String, Arc<AsyncMutex<DeviceEntry>>>>,
    checkpoint_seq: AtomicU64,
}

impl TransactionEngine {
    pub fn new(pool: Arc<SessionPool>, backups: Arc<dyn BackupStore>, config: EngineConfig) -> Self {
        Self {
            pool,
            backups,
            config,
            entries: Mutex::new(HashMap::new()),
            checkpoint_seq: AtomicU64::new(1),
        }
    }

    pub fn backups(&self) -> &Arc<dyn BackupStore> {
        &self.backups
    }

    fn entry(&self, device_id: &str) -> Arc<AsyncMutex<DeviceEntry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(device_id.to_string()).or_default())
    }

    fn handler(&self, device: &Device) -> Result<Arc<dyn VendorHandler>> {
        self.pool.handlers().resolve(device.device_type)
    }

    /// Current transaction state of a device.
    pub async fn state(&self, device_id: &str) -> TransactionState {
        self.entry(device_id).lock().await.state()
    }

    /// Owner of the device's transaction, if any.
    pub async fn owner(&self, device_id: &str) -> Option<String> {
        self.entry(device_id).lock().await.owner().map(str::to_string)
    }

    /// Lock the device entry.
    ///
    /// An overdue confirm window is rolled back and a transaction that lost
    /// its session is abandoned first. When `caller` meets an open
    /// transaction owned by someone else, the conflict policy decides:
    /// `Reject` fails, `Wait` unlocks and waits for the transaction to end,
    /// up to the pool's acquire timeout.
    ///
    /// Sessions are only ever acquired with the entry locked, never the
    /// other way round.
    async fn lock(&self, device: &Device, caller: Option<&str>) -> Result<EntryGuard> {
        let entry = self.entry(&device.id);
        let waited = self.pool.acquire_timeout();
        let deadline = Instant::now() + waited;

        loop {
            let mut guard = EntryGuard(Arc::clone(&entry).lock_owned().await);
            self.expire_if_due(&device.id, &mut guard).await;
            self.abandon_if_broken(&device.id, &mut guard).await;

            let Some(owner) = caller.and_then(|c| guard.foreign_owner(c)) else {
                return Ok(guard);
            };
            if let ConflictPolicy::Reject = self.config.conflict_policy {
                return Err(ConfigError::TransactionConflict {
                    device: device.id.clone(),
                    owner,
                }
                .into());
            }
            if Instant::now() >= deadline {
                return Err(PoolError::Exhausted {
                    device: device.id.clone(),
                    waited,
                }
                .into());
            }

            // Wake up for an overdue confirm window too; nobody else may
            // lock the entry to expire it.
            let wake = guard
                .transaction
                .as_ref()
                .and_then(|tx| tx.confirm_deadline)
                .map_or(deadline, |due| due.min(deadline));
            let released = Arc::clone(&guard.released);
            let ended = released.notified();
            drop(guard);

            debug!("{}: waiting for the transaction of {} to end", device.id, owner);
            let _ = tokio::time::timeout_at(wake, ended).await;
        }
    }

    /// The open transaction's session when there is one, else a new acquire.
    async fn lease(&self, device: &Device, entry: &mut DeviceEntry) -> Result<Lease> {
        match entry.take_held() {
            Some(session) => Ok(Lease::Held(session)),
            None => Ok(Lease::Fresh(self.pool.acquire(device, None).await?)),
        }
    }

    async fn finish(&self, device_id: &str, entry: &mut DeviceEntry, lease: Lease) {
        match lease {
            Lease::Held(session) => self.put_back(device_id, entry, session).await,
            Lease::Fresh(session) => {
                let healthy = session.is_healthy();
                self.pool.release(session, healthy).await;
            }
        }
    }

    /// Hand a session taken with [`DeviceEntry::take_held`] back to its
    /// transaction, or to the pool when the transaction ended meanwhile.
    async fn put_back(&self, device_id: &str, entry: &mut DeviceEntry, session: PooledSession) {
        match entry.transaction.as_mut().filter(|tx| tx.state.is_open()) {
            Some(tx) => tx.session = Some(session),
            None => {
                let healthy = session.is_healthy();
                self.pool.release(session, healthy).await;
            }
        }
        self.abandon_if_broken(device_id, entry).await;
    }

    /// Run `plan` on the open transaction's session.
    ///
    /// The session is out of the entry while the plan runs. An operation
    /// cancelled halfway drops it, and the next lock abandons the
    /// transaction instead of reading what the device printed meanwhile.
    async fn run_held(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
        plan: &Plan,
    ) -> Result<Vec<StepOutput>> {
        let Some(mut session) = entry.take_held() else {
            return Err(self.aborted(device));
        };
        let outcome = run_plan(&mut session, handler.as_ref(), plan, None).await;
        settle(&mut session, &outcome);
        self.put_back(&device.id, entry, session).await;
        outcome
    }

    /// A transaction whose session died cannot continue. The device drops
    /// an uncommitted candidate with the session and reverts an unconfirmed
    /// commit on its own.
    async fn abandon_if_broken(&self, device_id: &str, entry: &mut DeviceEntry) {
        if !entry.is_broken() {
            return;
        }
        let Some(tx) = entry.transaction.as_mut() else {
            return;
        };
        let next = match tx.state {
            TransactionState::ConfirmPending => TransactionState::RolledBack,
            _ => TransactionState::NotStarted,
        };
        warn!("{}: transaction session lost, {} -> {}", device_id, tx.state, next);
        if let Some(session) = tx.close(next) {
            self.pool.release(session, false).await;
        }
    }

    /// Roll back an unconfirmed commit whose window has passed.
    async fn expire_if_due(&self, device_id: &str, entry: &mut DeviceEntry) -> bool {
        let Some(tx) = entry.transaction.as_mut() else {
            return false;
        };
        if !tx.is_confirm_due(Instant::now()) {
            return false;
        }

        warn!("{}: confirm window expired, rolling back", device_id);
        let session = tx.close(TransactionState::RolledBack);
        if let Some(mut session) = session {
            let handler = Arc::clone(session.handler());
            let outcome = match handler.rollback(&RollbackTarget::PreviousCommit) {
                Ok(plan) => run_plan(&mut session, handler.as_ref(), &plan, None).await.map(|_| ()),
                Err(e) => Err(e),
            };
            settle(&mut session, &outcome);
            if let Err(e) = &outcome {
                error!("{}: automatic rollback failed, device reverts on its own: {}", device_id, e);
            }
            let healthy = outcome.is_ok() && session.is_healthy();
            self.pool.release(session, healthy).await;
        }
        true
    }

    /// Roll back every overdue confirmed commit. Returns how many were due.
    pub async fn sweep_expired(&self) -> usize {
        let entries: Vec<(String, Arc<AsyncMutex<DeviceEntry>>)> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut expired = 0;
        for (device_id, entry) in entries {
            let mut guard = EntryGuard(entry.lock_owned().await);
            if self.expire_if_due(&device_id, &mut guard).await {
                expired += 1;
            }
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every
    /// `confirm_sweep_interval` until `token` is cancelled.
    pub fn spawn_confirm_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = self.config.confirm_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let expired = engine.sweep_expired().await;
                        if expired > 0 {
                            info!("confirm sweep rolled back {} commit(s)", expired);
                        }
                    }
                }
            }
            debug!("confirm sweeper stopped");
        })
    }

    fn log_outcome<T>(&self, operation: &str, device_id: &str, start: Instant, result: &Result<T>) {
        match result {
            Ok(_) => info!("{}: {} done in {:?}", device_id, operation, start.elapsed()),
            Err(e) => warn!(
                "{}: {} failed after {:?} [{}]: {}",
                device_id,
                operation,
                start.elapsed(),
                e.kind(),
                e
            ),
        }
    }

    // ---- reads ------------------------------------------------------------

    /// Snapshot of the configuration selected by `query`.
    ///
    /// Read-only; runs on an open transaction's session when there is one.
    pub async fn get_config(&self, device: &Device, query: &ConfigQuery) -> Result<ConfigSnapshot> {
        let start = Instant::now();
        let result: Result<_> = async {
            let mut entry = self.lock(device, None).await?;
            self.snapshot(device, &mut entry, query).await
        }
        .await;
        self.log_outcome("get_config", &device.id, start, &result);
        result
    }

    async fn snapshot(
        &self,
        device: &Device,
        entry: &mut DeviceEntry,
        query: &ConfigQuery,
    ) -> Result<ConfigSnapshot> {
        let handler = self.handler(device)?;
        let command = handler.format_command(&handler.show_config(query)?, None);

        let mut lease = self.lease(device, entry).await?;
        let outcome: Result<_> = async {
            let session = lease.session();
            let wire = if session.in_config_mode() {
                handler.exec_from_config(&command)
            } else {
                command.clone()
            };
            let reply = session.send_command(&wire, None).await?;
            let output = handler.normalize_output(&reply.raw, &wire);
            if let Some(message) = handler.detect_failure(&output) {
                return Err(CommandError::Rejected {
                    command: wire,
                    message,
                    output,
                }
                .into());
            }
            Ok(handler.clean_config(&output))
        }
        .await;
        settle(lease.session(), &outcome);
        self.finish(&device.id, entry, lease).await;

        Ok(ConfigSnapshot {
            device_id: device.id.clone(),
            device_type: device.device_type,
            content: outcome?,
            format: query.format,
            section: query.section.clone(),
            captured_at: Utc::now(),
            description: None,
            backup_id: None,
        })
    }

    // ---- changes ----------------------------------------------------------

    /// Load `payload` onto the device.
    ///
    /// Staged platforms stage it in the candidate, committing right away
    /// when `commit_immediately` is set. Direct-apply platforms require
    /// `commit_immediately`; NX-OS takes a checkpoint first.
    pub async fn apply_config(
        &self,
        caller: &str,
        device: &Device,
        payload: &str,
        format: ConfigFormat,
        replace: bool,
        commit_immediately: bool,
    ) -> Result<ChangeResult> {
        let start = Instant::now();
        let result = self
            .apply(caller, device, payload, format, replace, commit_immediately)
            .await;
        self.log_outcome("apply_config", &device.id, start, &result);
        result
    }

    async fn apply(
        &self,
        caller: &str,
        device: &Device,
        payload: &str,
        format: ConfigFormat,
        replace: bool,
        commit_immediately: bool,
    ) -> Result<ChangeResult> {
        let handler = self.handler(device)?;
        handler.validate_payload(payload, format)?;
        let plan = handler.load_config(payload, format, replace)?;

        if !handler.supports_staged_commit() && !commit_immediately {
            return Err(handler.unsupported("staging without commit"));
        }

        let mut entry = self.lock(device, Some(caller)).await?;
        if handler.supports_staged_commit() {
            self.apply_staged(caller, device, &handler, &mut entry, &plan, commit_immediately)
                .await
        } else {
            self.apply_direct(device, &handler, &mut entry, &plan).await
        }
    }

    async fn apply_staged(
        &self,
        caller: &str,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
        plan: &Plan,
        commit_immediately: bool,
    ) -> Result<ChangeResult> {
        match entry.state() {
            TransactionState::Staged => {}
            TransactionState::ConfirmPending => {
                return Err(self.invalid(device, "apply configuration", entry.state()));
            }
            _ => {
                let mut session = self.pool.acquire(device, None).await?;
                let opened = run_plan(&mut session, handler.as_ref(), &handler.enter_config_mode(), None).await;
                settle(&mut session, &opened);
                if let Err(e) = opened {
                    let healthy = session.is_healthy();
                    self.pool.release(session, healthy).await;
                    return Err(rejected(&device.id, e));
                }
                debug!("{}: transaction opened by {}", device.id, caller);
                entry.transaction = Some(Transaction::open(caller, session));
            }
        }

        let outputs = match self.run_held(device, handler, entry, plan).await {
            Ok(outputs) => outputs,
            Err(e) => {
                self.discard_held(device, handler, entry).await;
                return Err(rejected(&device.id, e));
            }
        };

        if commit_immediately {
            return self.commit_held(device, handler, entry, None).await;
        }

        let output = outputs.last().map(|o| o.output.clone()).unwrap_or_default();
        Ok(ChangeResult::new(&device.id, Some(TransactionState::Staged)).with_output(output))
    }

    async fn apply_direct(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
        plan: &Plan,
    ) -> Result<ChangeResult> {
        let exit = handler.commit(None)?;
        let mut session = self.pool.acquire(device, None).await?;

        let checkpoint = if handler.supports_checkpoint() {
            let name = format!(
                "{}-{}-{}",
                self.config.checkpoint_prefix,
                Utc::now().format("%Y%m%d%H%M%S"),
                self.checkpoint_seq.fetch_add(1, Ordering::SeqCst)
            );
            let taken = run_plan(&mut session, handler.as_ref(), &handler.checkpoint(&name), None).await;
            settle(&mut session, &taken);
            if let Err(e) = taken {
                let healthy = session.is_healthy();
                self.pool.release(session, healthy).await;
                return Err(rejected(&device.id, e));
            }
            debug!("{}: checkpoint {}", device.id, name);
            entry.checkpoints.push(name.clone());
            Some(name)
        } else {
            None
        };

        let mut steps = handler.enter_config_mode();
        steps.extend(plan.iter().cloned());
        let outcome = run_plan(&mut session, handler.as_ref(), &steps, None).await;
        settle(&mut session, &outcome);

        // Leave configuration mode whatever happened; lines already entered
        // stay applied.
        let outcome = match outcome {
            Ok(_) => run_plan(&mut session, handler.as_ref(), &exit, None).await,
            Err(e) => {
                if session.is_healthy() && session.in_config_mode() {
                    if let Err(exit_err) = run_plan(&mut session, handler.as_ref(), &exit, None).await {
                        debug!("{}: leaving configuration mode: {}", device.id, exit_err);
                    }
                }
                Err(e)
            }
        };
        settle(&mut session, &outcome);

        let healthy = session.is_healthy();
        self.pool.release(session, healthy).await;

        let outputs = outcome.map_err(|e| rejected(&device.id, e))?;
        let mut result = ChangeResult::new(&device.id, None)
            .with_output(outputs.last().map(|o| o.output.clone()).unwrap_or_default());
        result.checkpoint = checkpoint;
        Ok(result)
    }

    /// Commit the staged candidate. A `confirm_within` window makes the
    /// commit revert unless confirmed in time; platforms without confirmed
    /// commits commit unconditionally.
    pub async fn commit(&self, caller: &str, device: &Device, confirm_within: Option<Duration>) -> Result<ChangeResult> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            let mut entry = self.lock(device, Some(caller)).await?;

            if !handler.supports_staged_commit() {
                return self.commit_direct(device, &handler, &mut entry).await;
            }
            if entry.state() != TransactionState::Staged {
                return Err(self.invalid(device, "commit", entry.state()));
            }
            self.commit_held(device, &handler, &mut entry, confirm_within).await
        }
        .await;
        self.log_outcome("commit", &device.id, start, &result);
        result
    }

    /// Commit on a direct-apply platform: nothing is pending, so this only
    /// makes sure the session is out of configuration mode.
    async fn commit_direct(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
    ) -> Result<ChangeResult> {
        let mut lease = self.lease(device, entry).await?;
        let outcome: Result<_> = async {
            let session = lease.session();
            if session.in_config_mode() {
                run_plan(session, handler.as_ref(), &handler.commit(None)?, None).await?;
            }
            Ok(())
        }
        .await;
        settle(lease.session(), &outcome);
        self.finish(&device.id, entry, lease).await;
        outcome.map(|()| ChangeResult::new(&device.id, None))
    }

    async fn commit_held(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
        confirm_within: Option<Duration>,
    ) -> Result<ChangeResult> {
        let window = confirm_within.filter(|_| handler.supports_confirmed_commit());
        if confirm_within.is_some() && window.is_none() {
            debug!("{}: no confirmed commit on {}, committing", device.id, device.device_type);
        }
        let plan = handler.commit(window)?;

        let output = match self.run_held(device, handler, entry, &plan).await {
            Ok(outputs) => {
                let output = outputs.last().map(|o| o.output.clone()).unwrap_or_default();
                if !handler.commit_succeeded(&output) {
                    self.discard_held(device, handler, entry).await;
                    return Err(ConfigError::CommitFailed {
                        device: device.id.clone(),
                        message: output,
                    }
                    .into());
                }
                output
            }
            Err(e) => {
                let message = e.device_output().map(str::to_string).unwrap_or_else(|| e.to_string());
                self.discard_held(device, handler, entry).await;
                return Err(ConfigError::CommitFailed {
                    device: device.id.clone(),
                    message,
                }
                .into());
            }
        };

        let Some(tx) = entry
            .transaction
            .as_mut()
            .filter(|tx| tx.state == TransactionState::Staged)
        else {
            return Err(self.aborted(device));
        };
        match window {
            Some(window) => {
                tx.state = TransactionState::ConfirmPending;
                tx.confirm_deadline = Some(Instant::now() + window);
                let deadline = Utc::now() + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
                tx.confirm_deadline_utc = Some(deadline);
                info!("{}: commit pending confirmation within {:?}", device.id, window);

                let mut result = ChangeResult::new(&device.id, Some(TransactionState::ConfirmPending)).with_output(output);
                result.confirm_deadline = Some(deadline);
                Ok(result)
            }
            None => {
                if let Some(session) = tx.close(TransactionState::Committed) {
                    let healthy = session.is_healthy();
                    self.pool.release(session, healthy).await;
                }
                Ok(ChangeResult::new(&device.id, Some(TransactionState::Committed)).with_output(output))
            }
        }
    }

    /// Confirm a pending confirmed commit.
    pub async fn confirm_commit(&self, caller: &str, device: &Device) -> Result<ChangeResult> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            let mut entry = self.lock(device, Some(caller)).await?;
            if entry.state() != TransactionState::ConfirmPending {
                return Err(ConfigError::NoPendingConfirmation {
                    device: device.id.clone(),
                }
                .into());
            }

            let plan = handler.confirm_commit()?;
            let outputs = self
                .run_held(device, &handler, &mut entry, &plan)
                .await
                .map_err(|e| rejected(&device.id, e))?;

            let output = outputs.last().map(|o| o.output.clone()).unwrap_or_default();
            if let Some(session) = entry
                .transaction
                .as_mut()
                .and_then(|tx| tx.close(TransactionState::Committed))
            {
                let healthy = session.is_healthy();
                self.pool.release(session, healthy).await;
            }
            Ok(ChangeResult::new(&device.id, Some(TransactionState::Committed)).with_output(output))
        }
        .await;
        self.log_outcome("confirm_commit", &device.id, start, &result);
        result
    }

    /// Drop the staged candidate.
    pub async fn discard(&self, caller: &str, device: &Device) -> Result<ChangeResult> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            if !handler.supports_staged_commit() {
                return Err(handler.unsupported("discard"));
            }
            let mut entry = self.lock(device, Some(caller)).await?;
            if entry.state() != TransactionState::Staged {
                return Err(self.invalid(device, "discard", entry.state()));
            }
            let output = self.discard_held(device, &handler, &mut entry).await;
            Ok(ChangeResult::new(&device.id, Some(TransactionState::NotStarted)).with_output(output))
        }
        .await;
        self.log_outcome("discard", &device.id, start, &result);
        result
    }

    /// Discard the candidate on the held session and end the transaction.
    ///
    /// Never fails: a candidate that cannot be discarded goes away with the
    /// session, which is closed instead of returned to the pool.
    async fn discard_held(&self, device: &Device, handler: &Arc<dyn VendorHandler>, entry: &mut DeviceEntry) -> String {
        let Some(mut session) = entry
            .transaction
            .as_mut()
            .and_then(|tx| tx.close(TransactionState::NotStarted))
        else {
            return String::new();
        };

        let outcome = match handler.discard() {
            Ok(plan) if session.is_healthy() => run_plan(&mut session, handler.as_ref(), &plan, None).await,
            Ok(_) => Err(self.aborted(device)),
            Err(e) => Err(e),
        };
        settle(&mut session, &outcome);
        let healthy = outcome.is_ok() && session.is_healthy();
        self.pool.release(session, healthy).await;

        match outcome {
            Ok(outputs) => outputs.last().map(|o| o.output.clone()).unwrap_or_default(),
            Err(e) => {
                debug!("{}: discard finished by closing the session: {}", device.id, e);
                String::new()
            }
        }
    }

    /// Undo the last change.
    ///
    /// Staged platforms drop a staged candidate or revert the last commit.
    /// Checkpoint platforms restore the latest checkpoint the engine took.
    /// Anything else re-applies the latest backup, which restores changed
    /// lines but leaves added ones in place.
    pub async fn rollback(&self, caller: &str, device: &Device) -> Result<ChangeResult> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            let mut entry = self.lock(device, Some(caller)).await?;
            if handler.supports_staged_commit() {
                self.rollback_staged(caller, device, &handler, &mut entry).await
            } else if handler.supports_checkpoint() {
                self.rollback_checkpoint(device, &handler, &mut entry).await
            } else {
                self.rollback_backup(device, &handler, &mut entry).await
            }
        }
        .await;
        self.log_outcome("rollback", &device.id, start, &result);
        result
    }

    async fn rollback_staged(
        &self,
        caller: &str,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
    ) -> Result<ChangeResult> {
        let state = entry.state();
        let (mut session, plan, source) = match state {
            TransactionState::Staged => {
                let mut plan = handler.rollback(&RollbackTarget::Candidate)?;
                plan.extend(handler.exit_config_mode());
                (entry.take_held(), plan, "candidate")
            }
            TransactionState::ConfirmPending => {
                let plan = handler.rollback(&RollbackTarget::PreviousCommit)?;
                (entry.take_held(), plan, "previous_commit")
            }
            TransactionState::Committed => {
                let mut plan = handler.enter_config_mode();
                plan.extend(handler.rollback(&RollbackTarget::PreviousCommit)?);
                let session = self.pool.acquire(device, None).await?;
                (Some(session), plan, "previous_commit")
            }
            TransactionState::NotStarted | TransactionState::RolledBack => {
                return Err(ConfigError::NoRestorePoint {
                    device: device.id.clone(),
                }
                .into());
            }
        };

        let Some(session_ref) = session.as_mut() else {
            if let Some(tx) = entry.transaction.as_mut() {
                tx.close(TransactionState::NotStarted);
            }
            return Err(self.aborted(device));
        };
        let outcome = run_plan(session_ref, handler.as_ref(), &plan, None).await;
        settle(session_ref, &outcome);
        if outcome.is_err() && session_ref.is_healthy() && session_ref.in_config_mode() {
            if let Ok(discard) = handler.discard() {
                if let Err(e) = run_plan(session_ref, handler.as_ref(), &discard, None).await {
                    debug!("{}: cleanup after failed rollback: {}", device.id, e);
                }
            }
        }

        let tx = entry.transaction.get_or_insert_with(|| Transaction {
            owner: caller.to_string(),
            state,
            session: None,
            confirm_deadline: None,
            confirm_deadline_utc: None,
        });
        tx.owner = caller.to_string();
        let next = match (&outcome, state) {
            (Ok(_), _) => TransactionState::RolledBack,
            // The device reverts an unconfirmed commit by itself.
            (Err(_), TransactionState::ConfirmPending) => TransactionState::RolledBack,
            (Err(_), TransactionState::Staged) => TransactionState::NotStarted,
            (Err(_), other) => other,
        };
        tx.close(next);

        if let Some(session) = session {
            let healthy = outcome.is_ok() && session.is_healthy();
            self.pool.release(session, healthy).await;
        }

        let outputs = outcome.map_err(|e| rejected(&device.id, e))?;
        Ok(ChangeResult::new(&device.id, Some(TransactionState::RolledBack))
            .with_output(outputs.last().map(|o| o.output.clone()).unwrap_or_default())
            .restored_from(source))
    }

    async fn rollback_checkpoint(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
    ) -> Result<ChangeResult> {
        let Some(name) = entry.checkpoints.last().cloned() else {
            return Err(ConfigError::NoRestorePoint {
                device: device.id.clone(),
            }
            .into());
        };
        let plan = handler.rollback(&RollbackTarget::Checkpoint(name.clone()))?;

        let mut session = self.pool.acquire(device, None).await?;
        let outcome = run_plan(&mut session, handler.as_ref(), &plan, None).await;
        settle(&mut session, &outcome);
        let healthy = session.is_healthy();
        self.pool.release(session, healthy).await;

        let outputs = outcome.map_err(|e| rejected(&device.id, e))?;
        entry.checkpoints.pop();
        Ok(ChangeResult::new(&device.id, None)
            .with_output(outputs.last().map(|o| o.output.clone()).unwrap_or_default())
            .restored_from(format!("checkpoint:{name}")))
    }

    async fn rollback_backup(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
    ) -> Result<ChangeResult> {
        let Some(id) = entry.last_backup else {
            return Err(ConfigError::NoRestorePoint {
                device: device.id.clone(),
            }
            .into());
        };
        let snapshot = self.backups.get(&id).await?;
        let plan = handler.load_config(&snapshot.content, snapshot.format, true)?;
        let result = self.apply_direct(device, handler, entry, &plan).await?;
        Ok(result.restored_from(format!("backup:{id}")))
    }

    // ---- staged candidate inspection --------------------------------------

    /// Uncommitted changes of the caller's staged candidate.
    pub async fn diff(&self, caller: &str, device: &Device) -> Result<String> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            let command = handler.diff()?;
            let mut entry = self.lock(device, Some(caller)).await?;
            if entry.state() != TransactionState::Staged {
                return Err(self.invalid(device, "diff", entry.state()));
            }
            self.run_on_held(device, &handler, &mut entry, &command).await
        }
        .await;
        self.log_outcome("diff", &device.id, start, &result);
        result
    }

    /// Validate the caller's staged candidate without committing it.
    pub async fn check(&self, caller: &str, device: &Device) -> Result<CheckResult> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            let command = handler.check()?;
            let mut entry = self.lock(device, Some(caller)).await?;
            if entry.state() != TransactionState::Staged {
                return Err(self.invalid(device, "check", entry.state()));
            }
            let output = self.run_on_held(device, &handler, &mut entry, &command).await?;
            Ok(CheckResult {
                device_id: device.id.clone(),
                valid: handler.check_succeeded(&output),
                output,
            })
        }
        .await;
        self.log_outcome("check", &device.id, start, &result);
        result
    }

    /// Send one command on the held session; device errors are returned as
    /// output, not as failures. Taken out like [`run_held`](Self::run_held).
    async fn run_on_held(
        &self,
        device: &Device,
        handler: &Arc<dyn VendorHandler>,
        entry: &mut DeviceEntry,
        command: &str,
    ) -> Result<String> {
        let Some(mut session) = entry.take_held() else {
            return Err(self.aborted(device));
        };
        let outcome = session.send_command(command, None).await;
        settle(&mut session, &outcome);
        self.put_back(&device.id, entry, session).await;
        outcome.map(|reply| handler.normalize_output(&reply.raw, command))
    }

    // ---- backups ----------------------------------------------------------

    /// Capture the running configuration and store it.
    pub async fn backup(&self, device: &Device, description: Option<&str>) -> Result<ConfigSnapshot> {
        let start = Instant::now();
        let result: Result<_> = async {
            let handler = self.handler(device)?;
            let format = handler
                .config_formats()
                .first()
                .copied()
                .unwrap_or(ConfigFormat::Text);

            let mut entry = self.lock(device, None).await?;
            let mut snapshot = self
                .snapshot(device, &mut entry, &ConfigQuery::running().format(format))
                .await?;
            snapshot.description = description.map(str::to_string);

            let id = self.backups.put(snapshot.clone()).await?;
            snapshot.backup_id = Some(id);
            entry.last_backup = Some(id);
            info!("{}: backup {} stored", device.id, id);
            Ok(snapshot)
        }
        .await;
        self.log_outcome("backup", &device.id, start, &result);
        result
    }

    /// Re-apply a stored backup as a replace.
    pub async fn restore(
        &self,
        caller: &str,
        device: &Device,
        backup_id: &BackupId,
        commit_immediately: bool,
    ) -> Result<ChangeResult> {
        let start = Instant::now();
        let result: Result<_> = async {
            let snapshot = self.backups.get(backup_id).await?;
            if snapshot.device_type != device.device_type {
                return Err(ConfigError::BackupMismatch {
                    id: backup_id.to_string(),
                    found: snapshot.device_type.to_string(),
                    expected: device.device_type.to_string(),
                }
                .into());
            }
            let result = self
                .apply(caller, device, &snapshot.content, snapshot.format, true, commit_immediately)
                .await?;
            Ok(result.restored_from(format!("backup:{backup_id}")))
        }
        .await;
        self.log_outcome("restore", &device.id, start, &result);
        result
    }

    // ---- lifecycle --------------------------------------------------------

    /// Forget a device, ending any open transaction by closing its session.
    pub async fn forget(&self, device_id: &str) {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
        if let Some(entry) = entry {
            let mut guard = EntryGuard(entry.lock_owned().await);
            self.end_open(device_id, &mut guard).await;
        }
    }

    /// End every open transaction. Used on shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, Arc<AsyncMutex<DeviceEntry>>)> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (device_id, entry) in entries {
            let mut guard = EntryGuard(entry.lock_owned().await);
            self.end_open(&device_id, &mut guard).await;
        }
    }

    async fn end_open(&self, device_id: &str, entry: &mut DeviceEntry) {
        if let Some(tx) = entry.transaction.as_mut() {
            if tx.state.is_open() {
                warn!("{}: closing open {} transaction of {}", device_id, tx.state, tx.owner);
                if let Some(session) = tx.close(TransactionState::NotStarted) {
                    self.pool.release(session, false).await;
                }
            }
        }
    }

    fn invalid(&self, device: &Device, operation: &str, state: TransactionState) -> Error {
        ConfigError::InvalidTransition {
            device: device.id.clone(),
            operation: operation.to_string(),
            state: state.to_string(),
        }
        .into()
    }

    fn aborted(&self, device: &Device) -> Error {
        ConfigError::Aborted {
            device: device.id.clone(),
            reason: "transaction session is gone".to_string(),
        }
        .into()
    }
}

/// Mark the session unusable when `outcome` says it can no longer be trusted.
fn settle<T>(session: &mut Session, outcome: &Result<T>) {
    if outcome.as_ref().is_err_and(Error::poisons_session) {
        session.mark_unhealthy();
    }
}

/// A device-rejected step becomes a configuration error naming the line.
fn rejected(device_id: &str, e: Error) -> Error {
    match e {
        Error::Command(CommandError::Rejected {
            command,
            message,
            output,
        }) => ConfigError::Rejected {
            device: device_id.to_string(),
            line: command,
            message,
            output,
        }
        .into(),
        other => other,
    }
}
