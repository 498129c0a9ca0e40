//! Transport layer.
//!
//! A [`Connector`] performs the handshake and authentication for a device and
//! yields a [`DeviceChannel`]: an interactive, line-oriented byte stream. The
//! SSH implementation wraps russh; anything else that can carry a CLI (a
//! console server, a simulator) plugs in through the same two traits.

pub mod config;
mod ssh;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use ssh::{SshChannel, SshConnector, SshTransport};

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::device::Device;
use crate::error::Result;

/// An authenticated interactive channel to one device.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Write raw bytes to the device.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the next chunk of output. `Ok(None)` means the peer closed.
    async fn read(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close the channel and its connection.
    async fn close(&mut self) -> Result<()>;

    /// Whether the underlying connection is still up.
    fn is_alive(&self) -> bool;
}

/// Opens authenticated channels.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        device: &Device,
        credentials: &Credentials,
    ) -> Result<Box<dyn DeviceChannel>>;
}
