//! Device registry and operation dispatch.
//!
//! [`NetworkCore`] wires the pool, executor and transaction engine together,
//! keeps the set of known devices and turns every [`Operation`] into an
//! [`Envelope`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupId, BackupStore};
use crate::credentials::CredentialStore;
use crate::device::Device;
use crate::envelope::{Envelope, Metadata};
use crate::error::{PlatformError, Result};
use crate::executor::{BatchMode, CommandExecutor, CommandRequest};
use crate::parse::ParserRegistry;
use crate::platform::{ConfigFormat, ConfigQuery, HandlerRegistry};
use crate::pool::SessionPool;
use crate::settings::{CoreConfig, duration_opt};
use crate::transaction::TransactionEngine;
use crate::transport::{Connector, SshConnector};

fn default_caller() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

/// Every call the core accepts, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Execute(CommandRequest),
    ExecuteBatch {
        commands: Vec<CommandRequest>,
        #[serde(default)]
        mode: BatchMode,
        #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
        timeout: Option<Duration>,
    },
    GetConfig(ConfigQuery),
    ApplyConfig {
        #[serde(default = "default_caller")]
        caller: String,
        payload: String,
        #[serde(default)]
        format: ConfigFormat,
        #[serde(default)]
        replace: bool,
        #[serde(default)]
        commit_immediately: bool,
    },
    Commit {
        #[serde(default = "default_caller")]
        caller: String,
        #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
        confirm_within: Option<Duration>,
    },
    ConfirmCommit {
        #[serde(default = "default_caller")]
        caller: String,
    },
    Discard {
        #[serde(default = "default_caller")]
        caller: String,
    },
    Rollback {
        #[serde(default = "default_caller")]
        caller: String,
    },
    Diff {
        #[serde(default = "default_caller")]
        caller: String,
    },
    Check {
        #[serde(default = "default_caller")]
        caller: String,
    },
    Backup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Restore {
        #[serde(default = "default_caller")]
        caller: String,
        backup_id: BackupId,
        #[serde(default = "default_true")]
        commit_immediately: bool,
    },
    TransactionState,
}

impl Operation {
    /// Name used in logs and envelope metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Execute(_) => "execute",
            Operation::ExecuteBatch { .. } => "execute_batch",
            Operation::GetConfig(_) => "get_config",
            Operation::ApplyConfig { .. } => "apply_config",
            Operation::Commit { .. } => "commit",
            Operation::ConfirmCommit { .. } => "confirm_commit",
            Operation::Discard { .. } => "discard",
            Operation::Rollback { .. } => "rollback",
            Operation::Diff { .. } => "diff",
            Operation::Check { .. } => "check",
            Operation::Backup { .. } => "backup",
            Operation::Restore { .. } => "restore",
            Operation::TransactionState => "transaction_state",
        }
    }
}

/// The network-device interaction core.
pub struct NetworkCore {
    devices: RwLock<HashMap<String, Device>>,
    pool: Arc<SessionPool>,
    executor: CommandExecutor,
    engine: Arc<TransactionEngine>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NetworkCore {
    /// Core talking SSH to real devices.
    pub fn new(
        config: CoreConfig,
        credentials: Arc<dyn CredentialStore>,
        backups: Arc<dyn BackupStore>,
    ) -> Self {
        let connector = Arc::new(SshConnector::new(config.ssh.clone()));
        Self::with_connector(config, connector, credentials, backups)
    }

    /// Core over any [`Connector`].
    pub fn with_connector(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        backups: Arc<dyn BackupStore>,
    ) -> Self {
        let pool = Arc::new(SessionPool::new(
            connector,
            credentials,
            Arc::new(HandlerRegistry::with_builtin()),
            config.pool,
            config.executor.search_depth,
        ));
        let executor = CommandExecutor::new(Arc::clone(&pool), Arc::new(ParserRegistry::new()));
        let engine = Arc::new(TransactionEngine::new(Arc::clone(&pool), backups, config.engine));
        Self {
            devices: RwLock::new(HashMap::new()),
            pool,
            executor,
            engine,
            sweeper: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Custom output parsers, consulted before the handlers' built-ins.
    pub fn parsers(&self) -> &Arc<ParserRegistry> {
        self.executor.parsers()
    }

    /// Start the background task that rolls back overdue confirmed commits.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_none() {
            let token = CancellationToken::new();
            let handle = self.engine.spawn_confirm_sweeper(token.clone());
            *sweeper = Some((token, handle));
        }
    }

    // ---- registry ---------------------------------------------------------

    /// Add a device. Its type must have a registered handler.
    pub fn register_device(&self, device: Device) -> Result<()> {
        device.validate()?;
        self.pool.handlers().resolve(device.device_type)?;

        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        if devices.contains_key(&device.id) {
            return Err(PlatformError::DuplicateDevice { id: device.id }.into());
        }
        info!("{}: registered ({} at {})", device.id, device.device_type, device.address());
        devices.insert(device.id.clone(), device);
        Ok(())
    }

    /// Replace a device definition. The id cannot change. Pooled sessions
    /// are dropped so the next operation connects with the new settings.
    pub async fn update_device(&self, id: &str, device: Device) -> Result<()> {
        if device.id != id {
            return Err(PlatformError::InvalidConfig {
                message: format!("device id is immutable ('{}' -> '{}')", id, device.id),
            }
            .into());
        }
        device.validate()?;
        self.pool.handlers().resolve(device.device_type)?;

        let previous = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            let Some(slot) = devices.get_mut(id) else {
                return Err(PlatformError::UnknownDevice { id: id.to_string() }.into());
            };
            std::mem::replace(slot, device.clone())
        };

        if previous.device_type != device.device_type {
            self.engine.forget(id).await;
        }
        self.pool.evict(id).await;
        info!("{}: updated", id);
        Ok(())
    }

    /// Remove a device, closing its sessions and ending any open transaction.
    pub async fn deregister_device(&self, id: &str) -> Result<Device> {
        let removed = self
            .devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| PlatformError::UnknownDevice { id: id.to_string() })?;

        self.engine.forget(id).await;
        self.pool.evict(id).await;
        info!("{}: deregistered", id);
        Ok(removed)
    }

    pub fn device(&self, id: &str) -> Result<Device> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownDevice { id: id.to_string() }.into())
    }

    /// Registered devices, sorted by id.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    // ---- dispatch ---------------------------------------------------------

    /// Run `operation` against a registered device and wrap the outcome.
    pub async fn dispatch(&self, device_id: &str, operation: Operation) -> Envelope {
        let name = operation.name();
        let start = Instant::now();
        debug!("{}: dispatch {}", device_id, name);

        match self.run(device_id, operation).await {
            Ok(data) => Envelope::success(
                data,
                Metadata {
                    device_id: device_id.to_string(),
                    operation: name.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                },
            ),
            Err(e) => {
                warn!(
                    "{}: {} failed after {:?} [{} / {}]: {}",
                    device_id,
                    name,
                    start.elapsed(),
                    e.code(),
                    e.kind(),
                    e
                );
                Envelope::error(&e, device_id, name)
            }
        }
    }

    /// Run `operation` and return its result as JSON.
    pub async fn run(&self, device_id: &str, operation: Operation) -> Result<Value> {
        let device = self.device(device_id)?;
        let engine = &self.engine;

        let data = match operation {
            Operation::Execute(request) => to_value(self.executor.execute(&device, &request).await?),
            Operation::ExecuteBatch {
                commands,
                mode,
                timeout,
            } => to_value(
                self.executor
                    .execute_batch(&device, &commands, mode, timeout)
                    .await?,
            ),
            Operation::GetConfig(query) => to_value(engine.get_config(&device, &query).await?),
            Operation::ApplyConfig {
                caller,
                payload,
                format,
                replace,
                commit_immediately,
            } => to_value(
                engine
                    .apply_config(&caller, &device, &payload, format, replace, commit_immediately)
                    .await?,
            ),
            Operation::Commit {
                caller,
                confirm_within,
            } => to_value(engine.commit(&caller, &device, confirm_within).await?),
            Operation::ConfirmCommit { caller } => to_value(engine.confirm_commit(&caller, &device).await?),
            Operation::Discard { caller } => to_value(engine.discard(&caller, &device).await?),
            Operation::Rollback { caller } => to_value(engine.rollback(&caller, &device).await?),
            Operation::Diff { caller } => json!({ "diff": engine.diff(&caller, &device).await? }),
            Operation::Check { caller } => to_value(engine.check(&caller, &device).await?),
            Operation::Backup { description } => {
                to_value(engine.backup(&device, description.as_deref()).await?)
            }
            Operation::Restore {
                caller,
                backup_id,
                commit_immediately,
            } => to_value(
                engine
                    .restore(&caller, &device, &backup_id, commit_immediately)
                    .await?,
            ),
            Operation::TransactionState => json!({
                "state": engine.state(&device.id).await,
                "owner": engine.owner(&device.id).await,
            }),
        };
        Ok(data)
    }

    /// Stop the sweeper, end open transactions and drain the pool.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((token, handle)) = sweeper {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("confirm sweeper ended abnormally: {}", e);
            }
        }
        self.engine.shutdown().await;
        self.pool.close_all().await;
        info!("network core shut down");
    }
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
