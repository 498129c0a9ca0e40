//! # netdev-core
//!
//! Network-device interaction core: pooled SSH sessions to CLI devices, a
//! vendor abstraction over divergent CLI semantics, command execution with
//! parsing, and a configuration transaction engine.
//!
//! ## Features
//!
//! - Async SSH sessions via russh, pooled per device with one session in use at a time
//! - Cisco IOS, IOS-XE, NX-OS and Juniper Junos handlers
//! - Efficient pattern buffer matching (tail search) with paging answered automatically
//! - Staged commits, confirmed commits with automatic rollback, NX-OS checkpoints
//! - Backup and byte-identical restore through a pluggable backup store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netdev_core::{
//!     CoreConfig, CredentialRef, Credentials, Device, DeviceType, MemoryBackupStore,
//!     NetworkCore, Operation, StaticCredentialStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), netdev_core::Error> {
//!     let credentials = StaticCredentialStore::new()
//!         .with("lab", Credentials::password("admin", "secret"));
//!     let core = NetworkCore::new(
//!         CoreConfig::default(),
//!         Arc::new(credentials),
//!         Arc::new(MemoryBackupStore::new()),
//!     );
//!     core.start();
//!
//!     core.register_device(Device::new(
//!         "edge-1",
//!         "192.168.1.1",
//!         DeviceType::JuniperJunos,
//!         CredentialRef::new("lab"),
//!     ))?;
//!
//!     let operation: Operation = serde_json::from_str(r#"{"op": "execute", "command": "show version"}"#)
//!         .expect("valid operation");
//!     let envelope = core.dispatch("edge-1", operation).await;
//!     println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod channel;
pub mod credentials;
pub mod device;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod network;
pub mod parse;
pub mod platform;
pub mod pool;
pub mod settings;
pub mod transaction;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backup::{BackupId, BackupStore, ConfigSnapshot, MemoryBackupStore};
pub use credentials::{CredentialStore, Credentials, StaticCredentialStore};
pub use device::{ConnectionOptions, CredentialRef, Device, DeviceType};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use executor::{BatchMode, CommandExecutor, CommandRequest, CommandResult};
pub use network::{NetworkCore, Operation};
pub use platform::{ConfigFormat, ConfigQuery, HandlerRegistry, VendorHandler};
pub use pool::SessionPool;
pub use settings::CoreConfig;
pub use transaction::{ChangeResult, TransactionEngine, TransactionState};
pub use transport::{AuthMethod, SshConfig};
