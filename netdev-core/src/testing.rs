//! In-memory device simulator and fixtures for unit tests.
//!
//! [`SimDevice`] models enough of the IOS, NX-OS and Junos CLIs to drive the
//! pool, executor and transaction engine end to end: prompts and echo,
//! privilege elevation, configuration mode, the Junos candidate with
//! (confirmed) commits and rollbacks, NX-OS checkpoints, paging, commands
//! that never return, and failing or slow connects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::credentials::{Credentials, StaticCredentialStore};
use crate::device::{ConnectionOptions, CredentialRef, Device, DeviceType};
use crate::error::{Result, TransportError};
use crate::platform::HandlerRegistry;
use crate::pool::SessionPool;
use crate::settings::{BackoffConfig, PoolConfig};
use crate::transport::{Connector, DeviceChannel};

pub(crate) const ENABLE_SECRET: &str = "enable-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Ios,
    Nxos,
    Junos,
}

/// A top-level Cisco statement and its indented children.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    header: String,
    children: Vec<String>,
}

struct DeviceState {
    flavor: Flavor,
    hostname: String,
    start_in_exec: bool,
    running: Vec<Block>,
    checkpoints: HashMap<String, Vec<Block>>,
    committed: Vec<String>,
    history: Vec<Vec<String>>,
    confirm_deadline: Option<Instant>,
    exclusive_owner: Option<u64>,
    hang_on: Vec<String>,
    fail_connects: u32,
    connect_delay: Option<Duration>,
    link_epoch: u64,
    live: usize,
    max_live: usize,
    total: usize,
    received: Vec<String>,
}

/// Simulated device shared by every channel connected to it.
#[derive(Clone)]
pub(crate) struct SimDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimDevice {
    fn new(flavor: Flavor, hostname: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                flavor,
                hostname: hostname.to_string(),
                start_in_exec: false,
                running: Vec::new(),
                checkpoints: HashMap::new(),
                committed: Vec::new(),
                history: Vec::new(),
                confirm_deadline: None,
                exclusive_owner: None,
                hang_on: Vec::new(),
                fail_connects: 0,
                connect_delay: None,
                link_epoch: 0,
                live: 0,
                max_live: 0,
                total: 0,
                received: Vec::new(),
            })),
        }
    }

    pub(crate) fn ios(hostname: &str) -> Self {
        Self::new(Flavor::Ios, hostname).with_running(&format!(
            "hostname {hostname}\ninterface GigabitEthernet0/1\n description uplink\n ip address 10.0.0.1 255.255.255.0\nntp server 10.0.0.100"
        ))
    }

    pub(crate) fn nxos(hostname: &str) -> Self {
        Self::new(Flavor::Nxos, hostname).with_running(&format!(
            "hostname {hostname}\nvlan 10\n name users\ninterface Ethernet1/1\n description server-1"
        ))
    }

    pub(crate) fn junos(hostname: &str) -> Self {
        let sim = Self::new(Flavor::Junos, hostname);
        sim.lock().committed = vec![
            format!("set system host-name {hostname}"),
            "set system services ssh".to_string(),
            "set system root-authentication encrypted-password \"$6$abc\"".to_string(),
            "set interfaces ge-0/0/0 description uplink".to_string(),
        ];
        sim
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the Cisco running configuration.
    pub(crate) fn with_running(self, text: &str) -> Self {
        self.lock().running = parse_blocks(text);
        self
    }

    /// New logins land in user exec and need `enable`.
    pub(crate) fn start_in_exec(self) -> Self {
        self.lock().start_in_exec = true;
        self
    }

    /// Commands starting with `prefix` never return a prompt.
    pub(crate) fn hang_on(self, prefix: &str) -> Self {
        self.lock().hang_on.push(prefix.to_string());
        self
    }

    /// The next `n` connects are refused.
    pub(crate) fn fail_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// Every connect takes `delay`.
    pub(crate) fn connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    /// Cut every open connection.
    pub(crate) fn drop_links(&self) {
        self.lock().link_epoch += 1;
    }

    pub(crate) fn running_config(&self) -> String {
        render_blocks(&self.lock().running)
    }

    pub(crate) fn committed(&self) -> Vec<String> {
        self.lock().committed.clone()
    }

    pub(crate) fn checkpoint_names(&self) -> Vec<String> {
        self.lock().checkpoints.keys().cloned().collect()
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.lock().live
    }

    pub(crate) fn max_live_connections(&self) -> usize {
        self.lock().max_live
    }

    pub(crate) fn total_connections(&self) -> usize {
        self.lock().total
    }

    /// Every line the device received, in order.
    pub(crate) fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    pub(crate) fn received_count(&self, line: &str) -> usize {
        self.lock().received.iter().filter(|l| *l == line).count()
    }
}

/// Connector handing out channels to simulated devices by device id.
#[derive(Default)]
pub(crate) struct SimConnector {
    devices: Mutex<HashMap<String, SimDevice>>,
    next_channel: AtomicU64,
}

impl SimConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, device_id: &str, sim: SimDevice) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), sim);
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, device: &Device, credentials: &Credentials) -> Result<Box<dyn DeviceChannel>> {
        let sim = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device.id)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed {
                host: device.host.clone(),
                port: device.port,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"),
            })?;

        let delay = sim.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = sim.lock();
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(TransportError::ConnectionFailed {
                    host: device.host.clone(),
                    port: device.port,
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                }
                .into());
            }
            state.live += 1;
            state.total += 1;
            state.max_live = state.max_live.max(state.live);
        }

        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimChannel::open(id, sim, &credentials.username)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Exec,
    Privileged,
    Config(Option<String>),
}

#[derive(Debug, Clone, Copy)]
enum LoadKind {
    MergeText,
    OverrideText,
    MergeJson,
    OverrideJson,
}

struct SimChannel {
    id: u64,
    sim: SimDevice,
    username: String,
    epoch: u64,
    mode: Mode,
    out: Vec<u8>,
    inbuf: Vec<u8>,
    closed: bool,
    hung: bool,
    awaiting_password: bool,
    awaiting_delete: bool,
    pager: Option<String>,
    sub_header: Option<String>,
    banner: Option<Block>,
    candidate: Vec<String>,
    loading: Option<(LoadKind, Vec<String>)>,
}

impl SimChannel {
    fn open(id: u64, sim: SimDevice, username: &str) -> Self {
        let (flavor, start_in_exec, epoch) = {
            let state = sim.lock();
            (state.flavor, state.start_in_exec, state.link_epoch)
        };
        let mode = if flavor == Flavor::Junos || start_in_exec {
            Mode::Exec
        } else {
            Mode::Privileged
        };
        let mut channel = Self {
            id,
            sim,
            username: username.to_string(),
            epoch,
            mode,
            out: Vec::new(),
            inbuf: Vec::new(),
            closed: false,
            hung: false,
            awaiting_password: false,
            awaiting_delete: false,
            pager: None,
            sub_header: None,
            banner: None,
            candidate: Vec::new(),
            loading: None,
        };
        let banner = match flavor {
            Flavor::Junos => "--- JUNOS 21.4R3-S1.6 Kernel 64-bit\n",
            _ => "\r\nUser Access Verification\r\n\r\n",
        };
        channel.emit(banner);
        channel.prompt();
        channel
    }

    fn flavor(&self) -> Flavor {
        self.sim.lock().flavor
    }

    fn link_up(&self) -> bool {
        !self.closed && self.sim.lock().link_epoch == self.epoch
    }

    fn emit(&mut self, text: &str) {
        self.out.extend_from_slice(text.as_bytes());
    }

    fn prompt(&mut self) {
        let (flavor, hostname) = {
            let state = self.sim.lock();
            (state.flavor, state.hostname.clone())
        };
        let prompt = match (flavor, &self.mode) {
            (Flavor::Junos, Mode::Config(_)) => format!("\n[edit]\n{}@{}# ", self.username, hostname),
            (Flavor::Junos, _) => format!("\n{}@{}> ", self.username, hostname),
            (_, Mode::Exec) => format!("{hostname}>"),
            (_, Mode::Privileged) => format!("{hostname}#"),
            (_, Mode::Config(None)) => format!("{hostname}(config)#"),
            (_, Mode::Config(Some(sub))) => format!("{hostname}(config-{sub})#"),
        };
        self.emit(&prompt);
    }

    fn reply(&mut self, body: &str) {
        if !body.is_empty() {
            self.emit(body);
            if !body.ends_with('\n') {
                self.emit("\n");
            }
        }
        self.prompt();
    }

    fn handle_line(&mut self, line: String) {
        let line = line.trim_end_matches('\r').to_string();

        if self.awaiting_password {
            self.awaiting_password = false;
            self.sim.lock().received.push("<secret>".to_string());
            if line == ENABLE_SECRET {
                self.mode = Mode::Privileged;
                self.emit("\n");
                self.prompt();
            } else {
                self.emit("\n% Access denied\n\n");
                self.prompt();
            }
            return;
        }

        self.sim.lock().received.push(line.clone());
        self.emit(&format!("{line}\n"));

        if let Some((_, lines)) = &mut self.loading {
            lines.push(line);
            return;
        }

        let hang = self.sim.lock().hang_on.iter().any(|p| line.starts_with(p.as_str()));
        if hang {
            self.hung = true;
            return;
        }

        match self.flavor() {
            Flavor::Junos => self.junos_line(&line),
            _ => self.cisco_line(&line),
        }
    }

    // ---- Cisco -------------------------------------------------------

    fn cisco_line(&mut self, line: &str) {
        let trimmed = line.trim();
        let flavor = self.flavor();
        let command = trimmed.strip_prefix("do ").unwrap_or(trimmed);

        if matches!(self.mode, Mode::Config(_)) && !trimmed.starts_with("do ") {
            return self.cisco_config_line(line);
        }

        match command {
            "" => self.prompt(),
            "enable" => {
                if self.mode == Mode::Exec {
                    self.awaiting_password = true;
                    self.emit("Password: ");
                } else {
                    self.prompt();
                }
            }
            "disable" => {
                self.mode = Mode::Exec;
                self.prompt();
            }
            c if c.starts_with("terminal ") => self.prompt(),
            "configure terminal" if self.mode == Mode::Privileged => {
                self.mode = Mode::Config(None);
                self.reply("Enter configuration commands, one per line.  End with CNTL/Z.");
            }
            c if c.starts_with("show running-config") => {
                let body = self.show_running(c);
                self.reply(&body);
            }
            "show version" => {
                let hostname = self.sim.lock().hostname.clone();
                let body = match flavor {
                    Flavor::Nxos => format!(
                        "Cisco Nexus Operating System (NX-OS) Software\nSoftware\n  NXOS: version 9.3(8)\nHardware\n  cisco Nexus9000 C9300v Chassis\n  Device name: {hostname}\nKernel uptime is 2 day(s), 3 hour(s)"
                    ),
                    _ => format!(
                        "Cisco IOS Software, C2900 Software (C2900-UNIVERSALK9-M), Version 15.2(4)M7, RELEASE SOFTWARE (fc2)\n{hostname} uptime is 3 weeks, 2 days, 4 hours\nSystem image file is \"flash:c2900-universalk9-mz.SPA.152-4.M7.bin\""
                    ),
                };
                self.reply(&body);
            }
            "show version | json" if flavor == Flavor::Nxos => {
                let hostname = self.sim.lock().hostname.clone();
                self.reply(&format!("{{\"host_name\": \"{hostname}\", \"nxos_ver_str\": \"9.3(8)\"}}"));
            }
            "show logging" => {
                let lines: Vec<String> = (1..=30).map(|i| format!("log line {i}")).collect();
                self.emit(&lines[..20].join("\n"));
                self.emit("\n --More-- ");
                self.pager = Some(lines[20..].join("\n"));
            }
            c if c.starts_with("checkpoint ") && flavor == Flavor::Nxos => {
                let name = c["checkpoint ".len()..].trim().to_string();
                let mut state = self.sim.lock();
                let snapshot = state.running.clone();
                state.checkpoints.insert(name, snapshot);
                drop(state);
                self.reply("Done");
            }
            c if c.starts_with("rollback running-config checkpoint ") && flavor == Flavor::Nxos => {
                let name = c["rollback running-config checkpoint ".len()..].trim().to_string();
                let mut state = self.sim.lock();
                let snapshot = state.checkpoints.get(&name).cloned();
                match snapshot {
                    Some(snapshot) => {
                        state.running = snapshot;
                        sync_hostname(&mut state);
                        drop(state);
                        self.reply("Note: Applying config parallelly may fail Rollback verification\nCollecting Running-Config\nRollback completed successfully.");
                    }
                    None => {
                        drop(state);
                        self.reply(&format!("ERROR: Checkpoint {name} does not exist"));
                    }
                }
            }
            c if c.starts_with("show ") => self.reply(""),
            _ => {
                let marker = match flavor {
                    Flavor::Nxos => "% Invalid command at '^' marker.",
                    _ => "% Invalid input detected at '^' marker.",
                };
                self.reply(&format!("        ^\n{marker}"));
            }
        }
    }

    fn show_running(&self, command: &str) -> String {
        let state = self.sim.lock();
        let blocks: Vec<Block> = match command.split_once("| section ") {
            Some((_, section)) => state
                .running
                .iter()
                .filter(|b| b.header.contains(section.trim()))
                .cloned()
                .collect(),
            None => state.running.clone(),
        };
        let body = render_blocks(&blocks);
        match state.flavor {
            Flavor::Nxos => format!(
                "\n!Command: show running-config\n!Running configuration last done at: Mon Jan  1 10:00:00 2024\n!Time: Mon Jan  1 10:05:00 2024\n\n{body}\n"
            ),
            _ => format!(
                "Building configuration...\n\nCurrent configuration : {} bytes\n!\n{body}\n!\nend\n",
                body.len()
            ),
        }
    }

    fn cisco_config_line(&mut self, line: &str) {
        let trimmed = line.trim();
        let indented = line.starts_with(' ');

        if let Some(mut banner) = self.banner.take() {
            banner.children.push(line.trim_end().to_string());
            if line.contains(BANNER_DELIMITER) {
                set_banner(&mut self.sim.lock().running, banner);
                return self.prompt();
            }
            self.banner = Some(banner);
            return;
        }
        if opens_banner(trimmed) {
            self.banner = Some(Block {
                header: trimmed.to_string(),
                children: Vec::new(),
            });
            return self.emit("Enter TEXT message.  End with the character '^'.\n");
        }

        if trimmed.is_empty() {
            return self.prompt();
        }
        if trimmed == "end" {
            self.mode = Mode::Privileged;
            return self.prompt();
        }
        if trimmed == "exit" {
            self.mode = match self.mode {
                Mode::Config(Some(_)) => Mode::Config(None),
                _ => Mode::Privileged,
            };
            return self.prompt();
        }
        if trimmed.split_whitespace().any(|w| w == "bogus") {
            let marker = match self.flavor() {
                Flavor::Nxos => "% Invalid command at '^' marker.",
                _ => "% Invalid input detected at '^' marker.",
            };
            return self.reply(&format!("        ^\n{marker}"));
        }

        let mut state = self.sim.lock();
        let current_sub = match (&self.mode, &self.sub_header) {
            (Mode::Config(Some(_)), Some(header)) => state.running.iter().position(|b| &b.header == header),
            _ => None,
        };

        if indented {
            if let Some(idx) = current_sub {
                apply_child(&mut state.running[idx].children, trimmed);
            }
            drop(state);
            return self.prompt();
        }

        let sub = ["interface ", "router ", "line ", "vlan "]
            .iter()
            .find(|p| trimmed.starts_with(**p))
            .map(|p| match p.trim() {
                "interface" => "if",
                "router" => "router",
                "line" => "line",
                _ => "vlan",
            });

        match sub {
            Some(sub) => {
                if !state.running.iter().any(|b| b.header == trimmed) {
                    state.running.push(Block {
                        header: trimmed.to_string(),
                        children: Vec::new(),
                    });
                }
                drop(state);
                self.sub_header = Some(trimmed.to_string());
                self.mode = Mode::Config(Some(sub.to_string()));
            }
            None => {
                apply_top(&mut state.running, trimmed);
                sync_hostname(&mut state);
                drop(state);
                self.sub_header = None;
                self.mode = Mode::Config(None);
            }
        }
        self.prompt();
    }

    // ---- Junos -------------------------------------------------------

    fn expire_confirm(&self) {
        let mut state = self.sim.lock();
        if state.confirm_deadline.is_some_and(|d| Instant::now() >= d) {
            state.confirm_deadline = None;
            if let Some(previous) = state.history.last().cloned() {
                state.committed = previous;
            }
        }
    }

    fn junos_line(&mut self, line: &str) {
        self.expire_confirm();
        let trimmed = line.trim();

        if self.awaiting_delete {
            self.awaiting_delete = false;
            if trimmed == "yes" {
                self.candidate.clear();
            }
            return self.prompt();
        }

        let command = trimmed.strip_prefix("run ").unwrap_or(trimmed);
        let in_config = matches!(self.mode, Mode::Config(_));

        if in_config && !trimmed.starts_with("run ") {
            return self.junos_config_line(trimmed);
        }

        match command {
            "" => self.prompt(),
            c if c.starts_with("set cli ") => self.reply("Screen settings updated"),
            "configure exclusive" | "configure" => {
                let mut state = self.sim.lock();
                if state.exclusive_owner.is_some_and(|owner| owner != self.id) {
                    drop(state);
                    return self.reply("error: configuration database locked by:\n  admin terminal p1 (pid 4242) on since 2024-01-01 10:00:00 UTC\n      exclusive [edit]");
                }
                state.exclusive_owner = Some(self.id);
                self.candidate = state.committed.clone();
                drop(state);
                self.mode = Mode::Config(None);
                self.reply("warning: uncommitted changes will be discarded on exit\nEntering configuration mode");
            }
            c if c.starts_with("show configuration") => {
                let committed = self.sim.lock().committed.clone();
                let body = show_junos(&committed, c);
                self.reply(&body);
            }
            c if c.starts_with("show version") => {
                let hostname = self.sim.lock().hostname.clone();
                self.reply(&format!("Hostname: {hostname}\nModel: vmx\nJunos: 21.4R3-S1.6"));
            }
            c if c.starts_with("show ") => self.reply(""),
            _ => self.reply("                ^\nunknown command."),
        }
    }

    fn junos_config_line(&mut self, trimmed: &str) {
        match trimmed {
            "" => self.prompt(),
            "delete" => {
                self.awaiting_delete = true;
                self.emit("Delete everything under this level? [yes,no] (no) ");
            }
            "load merge terminal" | "load override terminal" | "load merge json terminal" | "load override json terminal" => {
                let kind = match trimmed {
                    "load merge terminal" => LoadKind::MergeText,
                    "load override terminal" => LoadKind::OverrideText,
                    "load merge json terminal" => LoadKind::MergeJson,
                    _ => LoadKind::OverrideJson,
                };
                self.loading = Some((kind, Vec::new()));
                self.emit("[Type ^D at a new line to end input]\n");
            }
            "show | compare" => {
                let committed = self.sim.lock().committed.clone();
                let mut body = String::new();
                for s in committed.iter().filter(|s| !self.candidate.contains(s)) {
                    body.push_str(&format!("- {s}\n"));
                }
                for s in self.candidate.iter().filter(|s| !committed.contains(s)) {
                    body.push_str(&format!("+ {s}\n"));
                }
                self.reply(&body);
            }
            "commit check" => {
                if self.candidate.iter().any(|s| s.contains("fail-commit")) {
                    self.reply("error: configuration check-out failed");
                } else {
                    self.reply("configuration check succeeds");
                }
            }
            "commit" | "commit and-quit" => {
                if self.candidate.iter().any(|s| s.contains("fail-commit")) {
                    return self.reply("error: configuration check-out failed\nerror: commit failed: (statements constraint check failed)");
                }
                let mut state = self.sim.lock();
                let previous = std::mem::replace(&mut state.committed, self.candidate.clone());
                state.history.push(previous);
                state.confirm_deadline = None;
                sync_junos_hostname(&mut state);
                if trimmed == "commit and-quit" {
                    state.exclusive_owner = None;
                    drop(state);
                    self.mode = Mode::Exec;
                    self.reply("commit complete\nExiting configuration mode");
                } else {
                    drop(state);
                    self.reply("commit complete");
                }
            }
            c if c.starts_with("commit confirmed") => {
                let minutes: u64 = c["commit confirmed".len()..].trim().parse().unwrap_or(10);
                let mut state = self.sim.lock();
                let previous = std::mem::replace(&mut state.committed, self.candidate.clone());
                state.history.push(previous);
                state.confirm_deadline = Some(Instant::now() + Duration::from_secs(minutes * 60));
                drop(state);
                self.reply(&format!(
                    "commit confirmed will be automatically rolled back in {minutes} minutes unless confirmed\ncommit complete"
                ));
            }
            "rollback 0" => {
                self.candidate = self.sim.lock().committed.clone();
                self.reply("load complete");
            }
            "rollback 1" => {
                let previous = self.sim.lock().history.last().cloned();
                match previous {
                    Some(previous) => {
                        self.candidate = previous;
                        self.reply("load complete");
                    }
                    None => self.reply("error: rollback 1 does not exist"),
                }
            }
            "exit configuration-mode" | "exit" | "quit" => {
                let mut state = self.sim.lock();
                if state.exclusive_owner == Some(self.id) {
                    state.exclusive_owner = None;
                }
                drop(state);
                self.candidate.clear();
                self.mode = Mode::Exec;
                self.reply("Exiting configuration mode");
            }
            c if c.starts_with("set ") => {
                if c.split_whitespace().any(|w| w == "bogus") {
                    return self.reply("                    ^\nsyntax error.");
                }
                apply_set(&mut self.candidate, c);
                self.prompt();
            }
            c if c.starts_with("delete ") => {
                let path: Vec<&str> = c.split_whitespace().skip(1).collect();
                self.candidate.retain(|s| {
                    let tokens: Vec<&str> = s.split_whitespace().skip(1).collect();
                    !tokens.starts_with(&path)
                });
                self.prompt();
            }
            _ => self.reply("                ^\nsyntax error."),
        }
    }

    fn end_of_input(&mut self) {
        let Some((kind, lines)) = self.loading.take() else {
            return self.prompt();
        };
        let parsed = match kind {
            LoadKind::MergeText | LoadKind::OverrideText => parse_junos_text(&lines),
            LoadKind::MergeJson | LoadKind::OverrideJson => parse_junos_json(&lines.join("\n")),
        };
        match parsed {
            Ok(statements) => {
                if matches!(kind, LoadKind::OverrideText | LoadKind::OverrideJson) {
                    self.candidate = statements;
                } else {
                    for s in statements {
                        apply_set(&mut self.candidate, &s);
                    }
                }
                self.reply("load complete");
            }
            Err(line) => {
                self.reply(&format!("terminal:{line}: error: syntax error\nload complete (1 errors)"));
            }
        }
    }
}

#[async_trait]
impl DeviceChannel for SimChannel {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.link_up() {
            return Err(TransportError::Disconnected.into());
        }
        if self.hung {
            return Ok(());
        }
        if data == b" " {
            if let Some(rest) = self.pager.take() {
                self.emit(&rest);
                self.emit("\n");
                self.prompt();
            }
            return Ok(());
        }
        if data == [0x04] {
            self.end_of_input();
            return Ok(());
        }

        self.inbuf.extend_from_slice(data);
        while let Some(pos) = self.inbuf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.handle_line(line);
            if self.hung {
                self.inbuf.clear();
                break;
            }
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.link_up() {
            return Ok(None);
        }
        if !self.out.is_empty() {
            return Ok(Some(std::mem::take(&mut self.out)));
        }
        // Nothing more will ever arrive for this request.
        Ok(std::future::pending().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.link_up()
    }
}

impl SimChannel {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.sim.lock();
        state.live = state.live.saturating_sub(1);
        if state.exclusive_owner == Some(self.id) {
            state.exclusive_owner = None;
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.release();
    }
}

// ---- Cisco configuration model ------------------------------------------

const BANNER_DELIMITER: &str = "^C";

fn opens_banner(line: &str) -> bool {
    line.starts_with("banner ") && line.matches(BANNER_DELIMITER).count() == 1
}

/// Replace the banner of the same kind in place, or add it.
fn set_banner(blocks: &mut Vec<Block>, banner: Block) {
    let kind: String = banner.header.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    match blocks.iter().position(|b| b.header.starts_with(&format!("{kind} "))) {
        Some(idx) => blocks[idx] = banner,
        None => blocks.push(banner),
    }
}

fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut banner: Option<Block> = None;
    for line in text.lines() {
        if let Some(block) = banner.as_mut() {
            block.children.push(line.trim_end().to_string());
            if line.contains(BANNER_DELIMITER) {
                blocks.extend(banner.take());
            }
            continue;
        }
        let trimmed = line.trim();
        if opens_banner(trimmed) {
            banner = Some(Block {
                header: trimmed.to_string(),
                children: Vec::new(),
            });
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('!') {
            continue;
        }
        if line.starts_with(' ') {
            if let Some(last) = blocks.last_mut() {
                last.children.push(trimmed.to_string());
            }
        } else {
            blocks.push(Block {
                header: trimmed.to_string(),
                children: Vec::new(),
            });
        }
    }
    blocks
}

fn render_blocks(blocks: &[Block]) -> String {
    let mut lines = Vec::new();
    for block in blocks {
        lines.push(block.header.clone());
        if block.header.starts_with("banner ") {
            lines.extend(block.children.iter().cloned());
            continue;
        }
        for child in &block.children {
            lines.push(format!(" {child}"));
        }
        if !block.children.is_empty() {
            lines.push("!".to_string());
        }
    }
    lines.join("\n")
}

fn child_key(statement: &str) -> String {
    let words: Vec<&str> = statement.split_whitespace().collect();
    match words.first() {
        Some(&("ip" | "ipv6" | "switchport")) => words.iter().take(2).copied().collect::<Vec<_>>().join(" "),
        Some(first) => first.to_string(),
        None => String::new(),
    }
}

fn apply_child(children: &mut Vec<String>, statement: &str) {
    if let Some(rest) = statement.strip_prefix("no ") {
        children.retain(|c| !c.starts_with(rest));
        return;
    }
    let key = child_key(statement);
    match children.iter().position(|c| child_key(c) == key) {
        Some(idx) => children[idx] = statement.to_string(),
        None => children.push(statement.to_string()),
    }
}

fn apply_top(blocks: &mut Vec<Block>, statement: &str) {
    if let Some(rest) = statement.strip_prefix("no ") {
        blocks.retain(|b| !b.header.starts_with(rest));
        return;
    }
    if statement.starts_with("hostname ") {
        if let Some(block) = blocks.iter_mut().find(|b| b.header.starts_with("hostname ")) {
            block.header = statement.to_string();
            return;
        }
    }
    if !blocks.iter().any(|b| b.header == statement) {
        blocks.push(Block {
            header: statement.to_string(),
            children: Vec::new(),
        });
    }
}

fn sync_hostname(state: &mut DeviceState) {
    if let Some(name) = state
        .running
        .iter()
        .find_map(|b| b.header.strip_prefix("hostname "))
    {
        state.hostname = name.trim().to_string();
    }
}

// ---- Junos configuration model ------------------------------------------

fn sync_junos_hostname(state: &mut DeviceState) {
    if let Some(name) = state
        .committed
        .iter()
        .find_map(|s| s.strip_prefix("set system host-name "))
    {
        state.hostname = name.trim().to_string();
    }
}

/// `set` with the value replaced when the same path is set again.
fn apply_set(candidate: &mut Vec<String>, statement: &str) {
    let tokens: Vec<&str> = statement.split_whitespace().collect();
    let key = &tokens[..tokens.len().saturating_sub(1)];
    match candidate.iter().position(|s| {
        let other: Vec<&str> = s.split_whitespace().collect();
        &other[..other.len().saturating_sub(1)] == key
    }) {
        Some(idx) => candidate[idx] = statement.to_string(),
        None => candidate.push(statement.to_string()),
    }
}

#[derive(Default)]
struct Tree {
    leaves: Vec<String>,
    children: Vec<(String, Tree)>,
}

impl Tree {
    fn build(statements: &[String]) -> Self {
        let mut root = Tree::default();
        for s in statements {
            let tokens: Vec<&str> = s.split_whitespace().skip(1).collect();
            let split = tokens.len().saturating_sub(2);
            let mut node = &mut root;
            for name in &tokens[..split] {
                let idx = match node.children.iter().position(|(n, _)| n == name) {
                    Some(idx) => idx,
                    None => {
                        node.children.push((name.to_string(), Tree::default()));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[idx].1;
            }
            node.leaves.push(tokens[split..].join(" "));
        }
        root
    }

    fn render(&self, depth: usize, out: &mut Vec<String>) {
        let pad = "    ".repeat(depth);
        for leaf in &self.leaves {
            if leaf.starts_with("encrypted-password") {
                out.push(format!("{pad}{leaf}; ## SECRET-DATA"));
            } else {
                out.push(format!("{pad}{leaf};"));
            }
        }
        for (name, child) in &self.children {
            out.push(format!("{pad}{name} {{"));
            child.render(depth + 1, out);
            out.push(format!("{pad}}}"));
        }
    }

    fn to_json(&self) -> Value {
        let mut object = Map::new();
        for leaf in &self.leaves {
            let (key, value) = leaf.split_once(' ').unwrap_or((leaf.as_str(), ""));
            object.insert(key.to_string(), Value::String(value.to_string()));
        }
        for (name, child) in &self.children {
            object.insert(name.clone(), child.to_json());
        }
        Value::Object(object)
    }
}

fn show_junos(committed: &[String], command: &str) -> String {
    let section: Vec<&str> = command
        .trim_start_matches("show configuration")
        .split('|')
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .collect();
    let selected: Vec<String> = committed
        .iter()
        .filter(|s| s.split_whitespace().skip(1).collect::<Vec<_>>().starts_with(&section))
        .cloned()
        .collect();

    let tree = Tree::build(&selected);
    if command.contains("display set") {
        selected.join("\n")
    } else if command.contains("display json") {
        let mut root = Map::new();
        root.insert("configuration".to_string(), tree.to_json());
        serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_default()
    } else {
        let mut out = vec!["## Last commit: 2024-01-01 10:00:00 UTC by admin".to_string()];
        tree.render(0, &mut out);
        out.join("\n")
    }
}

/// Curly-brace text back to `set` statements; `Err(line number)` on bad syntax.
fn parse_junos_text(lines: &[String]) -> std::result::Result<Vec<String>, usize> {
    let mut path: Vec<String> = Vec::new();
    let mut statements = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.split('#').next().unwrap_or_default().trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.split_whitespace().any(|w| w.trim_end_matches(';') == "bogus") {
            return Err(idx + 1);
        }
        if let Some(name) = trimmed.strip_suffix(" {") {
            path.push(name.to_string());
        } else if trimmed == "}" {
            path.pop().ok_or(idx + 1)?;
        } else if let Some(leaf) = trimmed.strip_suffix(';') {
            let mut tokens = path.clone();
            tokens.push(leaf.to_string());
            statements.push(format!("set {}", tokens.join(" ")));
        } else {
            return Err(idx + 1);
        }
    }
    Ok(statements)
}

fn parse_junos_json(text: &str) -> std::result::Result<Vec<String>, usize> {
    fn walk(value: &Value, path: &mut Vec<String>, out: &mut Vec<String>) {
        if let Value::Object(object) = value {
            for (key, child) in object {
                match child {
                    Value::String(v) => {
                        let mut tokens = path.clone();
                        tokens.push(key.clone());
                        if !v.is_empty() {
                            tokens.push(v.clone());
                        }
                        out.push(format!("set {}", tokens.join(" ")));
                    }
                    other => {
                        path.push(key.clone());
                        walk(other, path, out);
                        path.pop();
                    }
                }
            }
        }
    }

    let value: Value = serde_json::from_str(text).map_err(|e| e.line())?;
    let root = value.get("configuration").unwrap_or(&value);
    let mut out = Vec::new();
    walk(root, &mut Vec::new(), &mut out);
    Ok(out)
}

// ---- Fixtures -------------------------------------------------------------

pub(crate) fn device(id: &str, device_type: DeviceType) -> Device {
    Device::new(id, format!("{id}.lab.example"), device_type, CredentialRef::new("lab")).with_options(
        ConnectionOptions {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            ..ConnectionOptions::default()
        },
    )
}

pub(crate) fn credential_store() -> Arc<StaticCredentialStore> {
    Arc::new(
        StaticCredentialStore::new().with(
            "lab",
            Credentials::password("admin", "admin-password").with_enable_secret(ENABLE_SECRET),
        ),
    )
}

pub(crate) fn pool_config() -> PoolConfig {
    PoolConfig {
        acquire_timeout: Duration::from_secs(5),
        reconnect: BackoffConfig {
            base: Duration::from_millis(100),
            jitter: 0.0,
            ..BackoffConfig::default()
        },
        ..PoolConfig::default()
    }
}

/// A pool wired to simulated devices.
pub(crate) fn sim_pool(config: PoolConfig) -> (Arc<SimConnector>, Arc<SessionPool>) {
    let connector = Arc::new(SimConnector::new());
    let pool = Arc::new(SessionPool::new(
        connector.clone(),
        credential_store(),
        Arc::new(HandlerRegistry::with_builtin()),
        config,
        1000,
    ));
    (connector, pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_junos_text_round_trip() {
        let statements = vec![
            "set system host-name r1".to_string(),
            "set interfaces ge-0/0/0 description uplink".to_string(),
            "set system services ssh".to_string(),
            "set system root-authentication encrypted-password \"$6$abc\"".to_string(),
        ];
        let mut out = Vec::new();
        Tree::build(&statements).render(0, &mut out);
        let parsed = parse_junos_text(&out).unwrap();

        let mut again = Vec::new();
        Tree::build(&parsed).render(0, &mut again);
        assert_eq!(out, again);
    }

    #[test]
    fn test_cisco_blocks() {
        let blocks = parse_blocks("hostname a\n!\ninterface Gi0/1\n description x\n");
        assert_eq!(render_blocks(&blocks), "hostname a\ninterface Gi0/1\n description x\n!");

        let text = "hostname a\nbanner motd ^C\n  Authorized access only\n^C\nntp server 10.0.0.1";
        assert_eq!(render_blocks(&parse_blocks(text)), text);
    }
}
