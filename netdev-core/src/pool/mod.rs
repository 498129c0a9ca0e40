//! Session pool.
//!
//! The pool owns every live session. Each device gets a slot holding a lease
//! (a semaphore with one permit) and its idle sessions. Holding the lease is
//! what makes a session `InUse`, so a device is never driven by two callers
//! at once, while different devices proceed independently: the slot table
//! is only locked to look a slot up.
//!
//! Sessions leave the pool wrapped in a [`PooledSession`] and come back
//! through [`SessionPool::release`]. A `PooledSession` dropped without
//! release (a cancelled task) is discarded as unhealthy.

mod backoff;
mod session;

pub use backoff::delay as backoff_delay;
pub use session::{Reply, Session, SessionState};

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::credentials::{CredentialStore, Credentials};
use crate::device::Device;
use crate::error::{Error, PoolError, Result, TransportError};
use crate::platform::{HandlerRegistry, VendorHandler};
use crate::settings::PoolConfig;
use crate::transport::Connector;

/// Per-device bookkeeping.
struct Slot {
    lease: Arc<Semaphore>,
    idle: Mutex<Vec<Session>>,
    live: AtomicUsize,
    generation: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            lease: Arc::new(Semaphore::new(1)),
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn take_idle(&self) -> Option<Session> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }
}

/// A session on loan from the pool.
///
/// Holds the device lease until it is released or dropped.
pub struct PooledSession {
    session: Option<Session>,
    slot: Arc<Slot>,
    max_sessions: usize,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    fn new(session: Session, slot: Arc<Slot>, max_sessions: usize, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session: Some(session),
            slot,
            max_sessions,
            _permit: permit,
        }
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
            .as_ref()
            .expect("pooled session is present until release")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
            .as_mut()
            .expect("pooled session is present until release")
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session {
            Some(session) => fmt::Debug::fmt(session, f),
            None => f.write_str("PooledSession(released)"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            warn!(
                "session {} to {} dropped without release, discarding",
                session.id(),
                session.device_id()
            );
            session.mark_unhealthy();
            self.slot.live.fetch_sub(1, Ordering::SeqCst);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { session.close().await });
            }
        }
    }
}

/// Owns and recycles device sessions.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    handlers: Arc<HandlerRegistry>,
    config: PoolConfig,
    search_depth: usize,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SessionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        handlers: Arc<HandlerRegistry>,
        config: PoolConfig,
        search_depth: usize,
    ) -> Self {
        Self {
            connector,
            credentials,
            handlers,
            config,
            search_depth,
            slots: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Default bound on waiting for a device.
    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }

    fn slot(&self, device_id: &str) -> Arc<Slot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    fn existing_slot(&self, device_id: &str) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PoolError::Closed.into())
        } else {
            Ok(())
        }
    }

    /// Take the device lease and hand out a ready session.
    ///
    /// Waits at most `timeout` (default: the pool's `acquire_timeout`) for
    /// the lease, then reuses a healthy idle session or opens a new one.
    pub async fn acquire(&self, device: &Device, timeout: Option<Duration>) -> Result<PooledSession> {
        self.ensure_open()?;
        let wait = timeout.unwrap_or(self.config.acquire_timeout);
        let deadline = Instant::now() + wait;

        let (slot, permit) = loop {
            let slot = self.slot(&device.id);
            match tokio::time::timeout_at(deadline, Arc::clone(&slot.lease).acquire_owned()).await {
                Ok(Ok(permit)) => break (slot, permit),
                // Slot retired by evict or close_all
                Ok(Err(_)) => {
                    self.ensure_open()?;
                    continue;
                }
                Err(_) => {
                    warn!("{}: no session available within {:?}", device.id, wait);
                    return Err(PoolError::Exhausted {
                        device: device.id.clone(),
                        waited: wait,
                    }
                    .into());
                }
            }
        };
        self.ensure_open()?;

        let generation = slot.generation.load(Ordering::SeqCst);
        while let Some(mut session) = slot.take_idle() {
            if session.generation() != generation {
                debug!("{}: dropping stale session {}", device.id, session.id());
                self.discard(&slot, session).await;
                continue;
            }
            if session.idle_for() > device.options.idle_ttl {
                debug!("{}: session {} idle past ttl", device.id, session.id());
                self.discard(&slot, session).await;
                continue;
            }
            if !session.is_healthy() {
                self.discard(&slot, session).await;
                continue;
            }
            if self.config.probe_on_acquire && !self.probe(&mut session).await {
                self.discard(&slot, session).await;
                continue;
            }

            session.set_state(SessionState::InUse);
            debug!("{}: reusing session {}", device.id, session.id());
            return Ok(PooledSession::new(session, slot, device.options.max_sessions, permit));
        }

        let session = self.open_session(device, &slot, generation).await?;
        Ok(PooledSession::new(session, slot, device.options.max_sessions, permit))
    }

    /// Liveness probe; one retry after a timeout.
    async fn probe(&self, session: &mut Session) -> bool {
        for attempt in 1..=2 {
            match session.probe(self.config.probe_timeout).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!("{}: probe {}/2 failed: {}", session.device_id(), attempt, e);
                    if !session.is_healthy() {
                        return false;
                    }
                }
            }
        }
        false
    }

    async fn open_session(&self, device: &Device, slot: &Slot, generation: u64) -> Result<Session> {
        let handler = self.handlers.resolve(device.device_type)?;
        let credentials = self.credentials.resolve(&device.credential).await?;

        let attempts = self.config.reconnect.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff::delay(attempt - 1, &self.config.reconnect);
                debug!("{}: reconnecting in {:?}", device.id, delay);
                tokio::time::sleep(delay).await;
            }

            match self.connect_once(device, Arc::clone(&handler), &credentials, generation).await {
                Ok(session) => {
                    slot.live.fetch_add(1, Ordering::SeqCst);
                    info!("{}: opened session {} ({})", device.id, session.id(), device.address());
                    return Ok(session);
                }
                Err(e) if retryable_connect_error(&e) => {
                    warn!(
                        "{}: connect attempt {}/{} failed: {}",
                        device.id,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("{}: connect failed: {}", device.id, e);
                    return Err(e);
                }
            }
        }

        let source = last_error.unwrap_or(Error::Pool(PoolError::Closed));
        Err(PoolError::ConnectFailed {
            device: device.id.clone(),
            attempts,
            source: Box::new(source),
        }
        .into())
    }

    async fn connect_once(
        &self,
        device: &Device,
        handler: Arc<dyn VendorHandler>,
        credentials: &Credentials,
        generation: u64,
    ) -> Result<Session> {
        let connect_timeout = device.options.connect_timeout;
        let channel = tokio::time::timeout(connect_timeout, self.connector.connect(device, credentials))
            .await
            .map_err(|_| TransportError::ConnectTimeout(connect_timeout))??;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Session::open(id, device, handler, channel, credentials, generation, self.search_depth).await
    }

    /// Return a session. Healthy sessions go back to idle; anything else is
    /// closed. The device lease is released afterwards.
    pub async fn release(&self, mut pooled: PooledSession, healthy: bool) {
        let Some(mut session) = pooled.session.take() else {
            return;
        };
        let slot = Arc::clone(&pooled.slot);

        if !healthy {
            session.mark_unhealthy();
        }

        let reusable = session.is_healthy()
            && session.generation() == slot.generation.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst);

        let rejected = if reusable {
            session.set_state(SessionState::Idle);
            let mut idle = slot.idle.lock().unwrap_or_else(|e| e.into_inner());
            if idle.len() < pooled.max_sessions {
                debug!("{}: session {} back to idle", session.device_id(), session.id());
                idle.push(session);
                None
            } else {
                Some(session)
            }
        } else {
            Some(session)
        };

        if let Some(session) = rejected {
            self.discard(&slot, session).await;
        }
        drop(pooled);
    }

    async fn discard(&self, slot: &Slot, mut session: Session) {
        debug!(
            "{}: closing session {} ({:?})",
            session.device_id(),
            session.id(),
            session.state()
        );
        session.close().await;
        slot.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close idle sessions of a device and mark in-flight ones stale. The
    /// slot itself is forgotten once nobody holds its lease.
    pub async fn evict(&self, device_id: &str) {
        let Some(slot) = self.existing_slot(device_id) else {
            return;
        };
        slot.generation.fetch_add(1, Ordering::SeqCst);

        let drained = std::mem::take(&mut *slot.idle.lock().unwrap_or_else(|e| e.into_inner()));
        for session in drained {
            self.discard(&slot, session).await;
        }

        if let Ok(permit) = Arc::clone(&slot.lease).try_acquire_owned() {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            if slots.get(device_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                slots.remove(device_id);
                slot.lease.close();
            }
            drop(permit);
        }
        info!("{}: evicted", device_id);
    }

    /// Shut the pool down: refuse new acquires, wake waiters with
    /// [`PoolError::Closed`] and close every idle session. Sessions still on
    /// loan are closed when they come back.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<(String, Arc<Slot>)> = self
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        for (device_id, slot) in slots {
            slot.generation.fetch_add(1, Ordering::SeqCst);
            slot.lease.close();
            let drained = std::mem::take(&mut *slot.idle.lock().unwrap_or_else(|e| e.into_inner()));
            for session in drained {
                self.discard(&slot, session).await;
            }
            debug!("{}: drained", device_id);
        }
        info!("session pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions currently open for a device, idle or on loan.
    pub fn live_sessions(&self, device_id: &str) -> usize {
        self.existing_slot(device_id)
            .map(|s| s.live.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Sessions waiting in the idle list of a device.
    pub fn idle_sessions(&self, device_id: &str) -> usize {
        self.existing_slot(device_id)
            .map(|s| s.idle.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }
}

/// Failures worth another connect attempt. Rejected credentials and host
/// keys fail the same way every time.
fn retryable_connect_error(e: &Error) -> bool {
    match e {
        Error::Transport(
            TransportError::AuthenticationFailed { .. }
            | TransportError::HostKeyChanged { .. }
            | TransportError::HostKeyUnknown { .. }
            | TransportError::CredentialUnavailable { .. },
        ) => false,
        Error::Transport(_) | Error::Channel(_) => true,
        _ => false,
    }
}
