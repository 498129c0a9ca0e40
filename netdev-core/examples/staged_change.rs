//! Staged configuration change example
//!
//! Registers one device, takes a backup, stages a change, shows the diff and
//! commits it with a confirm window. Every step prints the JSON envelope the
//! core returns.
//!
//! # Prerequisites
//!
//! - Juniper device running JUNOS (staged commits), or a Cisco device for the
//!   direct-apply path
//! - Valid credentials with configuration permissions
//!
//! # Usage
//!
//! ```bash
//! cargo run --example staged_change -- --host 192.168.1.1 --user admin --password secret \
//!     --change "set system ntp server 10.0.0.1"
//! ```
//!
//! Pass `--config core.toml` to load pool / engine settings from TOML.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use netdev_core::{
    CoreConfig, CredentialRef, Credentials, Device, DeviceType, Envelope, MemoryBackupStore,
    NetworkCore, Operation, StaticCredentialStore,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("=== netdev-core Staged Change Example ===\n");

    let config = match &args.config {
        Some(path) => CoreConfig::from_file(path)?,
        None => CoreConfig::default(),
    };

    let credentials = match (&args.password, &args.key) {
        (Some(password), _) => Credentials::password(&args.user, password),
        (None, Some(key)) => Credentials::private_key(&args.user, key),
        (None, None) => {
            eprintln!("Error: Must provide either --password or --key");
            std::process::exit(1);
        }
    };

    let core = NetworkCore::new(
        config,
        Arc::new(StaticCredentialStore::new().with("cli", credentials)),
        Arc::new(MemoryBackupStore::new()),
    );
    core.start();

    let device_type: DeviceType = serde_json::from_value(json!(args.device_type))?;
    core.register_device(
        Device::new("target", &args.host, device_type, CredentialRef::new("cli")).with_port(args.port),
    )?;

    let staged = device_type == DeviceType::JuniperJunos;
    let steps: Vec<(&str, serde_json::Value)> = vec![
        ("Device version", json!({"op": "execute", "command": "show version"})),
        ("Backup", json!({"op": "backup", "description": "before example change"})),
        (
            "Apply",
            json!({
                "op": "apply_config",
                "caller": "example",
                "payload": args.change,
                "format": if staged { "set" } else { "text" },
                "commit_immediately": !staged,
            }),
        ),
    ];

    for (title, operation) in steps {
        run_step(&core, title, operation).await?;
    }

    if staged {
        run_step(&core, "Diff", json!({"op": "diff", "caller": "example"})).await?;
        run_step(
            &core,
            "Commit (confirm within 5m)",
            json!({"op": "commit", "caller": "example", "confirm_within": "5m"}),
        )
        .await?;
        run_step(&core, "Confirm", json!({"op": "confirm_commit", "caller": "example"})).await?;
    }

    core.shutdown().await;
    println!("Done.");
    Ok(())
}

async fn run_step(
    core: &NetworkCore,
    title: &str,
    operation: serde_json::Value,
) -> Result<Envelope, Box<dyn std::error::Error>> {
    println!("--- {} ---", title);
    let operation: Operation = serde_json::from_value(operation)?;
    let envelope = core.dispatch("target", operation).await;
    println!("{}\n", serde_json::to_string_pretty(&envelope)?);
    Ok(envelope)
}

struct Args {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key: Option<PathBuf>,
    device_type: String,
    change: String,
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut parsed = Args {
            host: "localhost".to_string(),
            port: 22,
            user: env::var("USER").unwrap_or_else(|_| "admin".to_string()),
            password: None,
            key: None,
            device_type: "juniper_junos".to_string(),
            change: "set system ntp server 10.0.0.1".to_string(),
            config: None,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match (args[i].as_str(), value) {
                ("--host" | "-h", Some(v)) => parsed.host = v,
                ("--port" | "-p", Some(v)) => parsed.port = v.parse().unwrap_or(22),
                ("--user" | "-u", Some(v)) => parsed.user = v,
                ("--password" | "-P", Some(v)) => parsed.password = Some(v),
                ("--key" | "-k", Some(v)) => parsed.key = Some(PathBuf::from(v)),
                ("--type" | "-t", Some(v)) => parsed.device_type = v,
                ("--change" | "-c", Some(v)) => parsed.change = v,
                ("--config", Some(v)) => parsed.config = Some(PathBuf::from(v)),
                (other, _) => {
                    eprintln!("Unknown or incomplete argument: {}", other);
                    std::process::exit(1);
                }
            }
            i += 2;
        }
        parsed
    }
}
