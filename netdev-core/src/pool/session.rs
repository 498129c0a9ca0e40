//! A live CLI session bound to one device.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use regex::bytes::Regex;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use crate::channel::CliChannel;
use crate::channel::patterns::combine_patterns;
use crate::credentials::{Credentials, Secret};
use crate::device::Device;
use crate::error::{ChannelError, CommandError, Error, Result};
use crate::platform::VendorHandler;
use crate::transport::DeviceChannel;

/// Ctrl-D, ends `load ... terminal` input.
const END_OF_INPUT: &[u8] = &[0x04];

/// Lifecycle of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    InUse,
    Unhealthy,
    Closed,
}

/// Output of one exchange, up to and including the prompt.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Everything read, prompt included.
    pub raw: String,
    /// Last line of the output when it matched a prompt.
    pub prompt: String,
    pub elapsed: Duration,
}

/// A channel plus the CLI state the pool tracks for it.
///
/// Sessions are created and owned by the [`SessionPool`](super::SessionPool);
/// callers only see them through a [`PooledSession`](super::PooledSession).
pub struct Session {
    id: u64,
    device_id: String,
    generation: u64,
    state: SessionState,
    channel: CliChannel,
    handler: Arc<dyn VendorHandler>,
    level: Option<String>,
    elevation_secret: Option<SecretString>,
    command_timeout: Duration,
    consecutive_timeouts: u32,
    created_at: Instant,
    last_used: Instant,
}

impl Session {
    /// Bring a freshly connected channel to a usable state: wait for the
    /// first prompt, elevate to the dialect's default level and run the
    /// on-open commands. The channel is closed if any step fails.
    pub(crate) async fn open(
        id: u64,
        device: &Device,
        handler: Arc<dyn VendorHandler>,
        channel: Box<dyn DeviceChannel>,
        credentials: &Credentials,
        generation: u64,
        search_depth: usize,
    ) -> Result<Self> {
        let elevation_secret = credentials.enable_secret.clone().or_else(|| match &credentials.secret {
            Secret::Password(p) | Secret::Token(p) => Some(p.clone()),
            Secret::PrivateKey { .. } => None,
        });

        let now = Instant::now();
        let mut session = Self {
            id,
            device_id: device.id.clone(),
            generation,
            state: SessionState::InUse,
            channel: CliChannel::new(channel, search_depth),
            handler,
            level: None,
            elevation_secret,
            command_timeout: device.options.command_timeout,
            consecutive_timeouts: 0,
            created_at: now,
            last_used: now,
        };

        match session.initialize().await {
            Ok(()) => {
                debug!(
                    "session {} to {} ready at level {:?}",
                    id, session.device_id, session.level
                );
                Ok(session)
            }
            Err(e) => {
                warn!("session setup for {} failed: {}", session.device_id, e);
                session.close().await;
                Err(e)
            }
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let dialect = handler.dialect();

        let data = self
            .channel
            .read_until(dialect.prompt_pattern(), dialect.paging_pattern.as_ref(), self.command_timeout)
            .await?;
        let prompt = last_line(&String::from_utf8_lossy(&data));
        self.update_level(&prompt);

        if !dialect.default_privilege.is_empty() {
            self.acquire_privilege(&dialect.default_privilege).await?;
        }

        for command in &dialect.on_open_commands {
            let reply = self.send_command(command, None).await?;
            if let Some(message) = dialect.detect_failure(&reply.raw) {
                debug!("on-open command {:?} reported {:?}", command, message);
            }
        }

        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handler(&self) -> &Arc<dyn VendorHandler> {
        &self.handler
    }

    /// Privilege level of the last seen prompt.
    pub fn current_level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    /// Whether the last prompt was the configuration level.
    pub fn in_config_mode(&self) -> bool {
        self.level.as_deref() == Some(self.handler.dialect().config_privilege.as_str())
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if state == SessionState::Idle {
            self.last_used = Instant::now();
        }
        self.state = state;
    }

    /// Usable for another request.
    pub fn is_healthy(&self) -> bool {
        matches!(self.state, SessionState::Idle | SessionState::InUse) && self.channel.is_alive()
    }

    /// Mark the session as not reusable.
    pub fn mark_unhealthy(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Unhealthy;
        }
    }

    /// Send `command` and wait for any prompt of the dialect.
    ///
    /// A timeout marks the session unhealthy: the device may still be
    /// producing output for the abandoned command.
    pub async fn send_command(&mut self, command: &str, timeout: Option<Duration>) -> Result<Reply> {
        let handler = Arc::clone(&self.handler);
        let dialect = handler.dialect();
        let timeout = timeout.unwrap_or(self.command_timeout);
        let start = Instant::now();

        self.channel.send_line(command).await.inspect_err(|_| self.mark_unhealthy())?;
        let data = self
            .read(dialect.prompt_pattern(), dialect.paging_pattern.as_ref(), command, timeout)
            .await?;

        let raw = String::from_utf8_lossy(&data).into_owned();
        let prompt = last_line(&raw);
        self.update_level(&prompt);

        Ok(Reply {
            raw,
            prompt,
            elapsed: start.elapsed(),
        })
    }

    /// Send `command` and wait for `pattern` instead of a prompt.
    pub async fn send_expect(&mut self, command: &str, pattern: &str, timeout: Option<Duration>) -> Result<Reply> {
        let pattern = Regex::new(pattern).map_err(ChannelError::from)?;
        let timeout = timeout.unwrap_or(self.command_timeout);
        let start = Instant::now();

        self.channel.send_line(command).await.inspect_err(|_| self.mark_unhealthy())?;
        let data = self.read(&pattern, None, command, timeout).await?;

        Ok(Reply {
            raw: String::from_utf8_lossy(&data).into_owned(),
            prompt: String::new(),
            elapsed: start.elapsed(),
        })
    }

    /// Send a line without waiting for anything.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.channel.send_line(line).await.inspect_err(|_| self.mark_unhealthy())
    }

    /// Send Ctrl-D and wait for the prompt.
    pub async fn end_input(&mut self, timeout: Option<Duration>) -> Result<Reply> {
        let handler = Arc::clone(&self.handler);
        let dialect = handler.dialect();
        let timeout = timeout.unwrap_or(self.command_timeout);
        let start = Instant::now();

        self.channel.write_raw(END_OF_INPUT).await.inspect_err(|_| self.mark_unhealthy())?;
        let data = self
            .read(dialect.prompt_pattern(), dialect.paging_pattern.as_ref(), "^D", timeout)
            .await?;

        let raw = String::from_utf8_lossy(&data).into_owned();
        let prompt = last_line(&raw);
        self.update_level(&prompt);

        Ok(Reply {
            raw,
            prompt,
            elapsed: start.elapsed(),
        })
    }

    async fn read(&mut self, pattern: &Regex, paging: Option<&Regex>, command: &str, timeout: Duration) -> Result<Vec<u8>> {
        match self.channel.read_until(pattern, paging, timeout).await {
            Ok(data) => {
                self.consecutive_timeouts = 0;
                Ok(data)
            }
            Err(Error::Channel(ChannelError::PatternTimeout(_))) => {
                self.consecutive_timeouts += 1;
                self.mark_unhealthy();
                let partial_output = String::from_utf8_lossy(&self.channel.take_pending()).into_owned();
                warn!("{}: {:?} timed out after {:?}", self.device_id, command, timeout);
                Err(CommandError::Timeout {
                    command: command.to_string(),
                    timeout,
                    partial_output,
                }
                .into())
            }
            Err(e) => {
                self.mark_unhealthy();
                Err(e)
            }
        }
    }

    /// Liveness check: an empty line must bring back a prompt.
    ///
    /// Unlike a command timeout, a single probe timeout does not condemn the
    /// session; the pool gives up after two in a row.
    pub(crate) async fn probe(&mut self, timeout: Duration) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let dialect = handler.dialect();

        self.channel.send_line("").await?;
        match self.channel.read_until(dialect.prompt_pattern(), None, timeout).await {
            Ok(data) => {
                self.consecutive_timeouts = 0;
                let prompt = last_line(&String::from_utf8_lossy(&data));
                self.update_level(&prompt);
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::Channel(ChannelError::PatternTimeout(_))) {
                    self.consecutive_timeouts += 1;
                    if self.consecutive_timeouts >= 2 {
                        self.mark_unhealthy();
                    }
                } else {
                    self.mark_unhealthy();
                }
                Err(e)
            }
        }
    }

    /// Move to privilege level `target`, answering password prompts with
    /// the enable secret (or the login password).
    pub async fn acquire_privilege(&mut self, target: &str) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let dialect = handler.dialect();

        let current = match &self.level {
            Some(level) => level.clone(),
            None => {
                return Err(CommandError::UnknownPrivilege {
                    prompt: String::new(),
                }
                .into());
            }
        };
        if current == target {
            return Ok(());
        }

        for hop in dialect.path(&current, target)? {
            debug!("{}: {} -> {} via {:?}", self.device_id, current, hop.to, hop.command);

            match &hop.auth_prompt {
                Some(auth) => {
                    let either = combine_patterns([auth.as_str(), dialect.prompt_pattern().as_str()])
                        .map_err(ChannelError::from)?;
                    self.channel.send_line(&hop.command).await?;
                    let data = self.read(&either, None, &hop.command, self.command_timeout).await?;
                    if auth.is_match(&data) && !dialect.prompt_pattern().is_match(&data) {
                        let secret = self.elevation_secret.clone().ok_or_else(|| {
                            CommandError::PrivilegeAcquisitionFailed {
                                target: hop.to.clone(),
                            }
                        })?;
                        trace!("{}: answering password prompt", self.device_id);
                        let mut line = secret.expose_secret().as_bytes().to_vec();
                        line.push(b'\n');
                        self.channel.write_raw(&line).await?;
                        let data = self
                            .read(dialect.prompt_pattern(), None, &hop.command, self.command_timeout)
                            .await?;
                        self.update_level(&last_line(&String::from_utf8_lossy(&data)));
                    } else {
                        self.update_level(&last_line(&String::from_utf8_lossy(&data)));
                    }
                }
                None => {
                    self.send_command(&hop.command, None).await?;
                }
            }

            if self.level.as_deref() != Some(hop.to.as_str()) {
                return Err(CommandError::PrivilegeAcquisitionFailed { target: hop.to }.into());
            }
        }

        Ok(())
    }

    fn update_level(&mut self, prompt: &str) {
        if let Some(level) = self.handler.dialect().determine_level(prompt) {
            if self.level.as_deref() != Some(level.name.as_str()) {
                trace!("{}: now at {}", self.device_id, level.name);
                self.level = Some(level.name.clone());
            }
        }
    }

    /// Close the channel. Errors are logged, not returned: the session is
    /// gone either way.
    pub(crate) async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Err(e) = self.channel.close().await {
            debug!("closing session {} to {}: {}", self.id, self.device_id, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("state", &self.state)
            .field("level", &self.level)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Last non-empty line, trailing whitespace removed.
fn last_line(output: &str) -> String {
    output
        .lines()
        .map(|l| l.trim_end_matches(['\r', ' ']))
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}
