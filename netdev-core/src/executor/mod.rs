//! Command execution over pooled sessions.
//!
//! The executor is the only place that turns handler output into wire
//! traffic: single commands and batches for callers, and [`run_plan`] for the
//! transaction engine.

mod response;

pub use response::{BatchMode, CommandRequest, CommandResult, StepOutput};

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::device::Device;
use crate::error::{CommandError, Result};
use crate::parse::ParserRegistry;
use crate::platform::{Step, VendorHandler};
use crate::pool::{Session, SessionPool};

/// Runs commands through a vendor handler on a pooled session.
pub struct CommandExecutor {
    pool: Arc<SessionPool>,
    parsers: Arc<ParserRegistry>,
}

impl CommandExecutor {
    pub fn new(pool: Arc<SessionPool>, parsers: Arc<ParserRegistry>) -> Self {
        Self { pool, parsers }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn parsers(&self) -> &Arc<ParserRegistry> {
        &self.parsers
    }

    /// Run one command. The session goes back to the pool on every path.
    pub async fn execute(&self, device: &Device, request: &CommandRequest) -> Result<CommandResult> {
        let start = Instant::now();
        let mut session = self.pool.acquire(device, None).await?;
        let outcome = self.execute_on(&mut session, request).await;
        let healthy = session.is_healthy();
        self.pool.release(session, healthy).await;

        if let Err(e) = &outcome {
            warn!(
                "{}: execute {:?} failed after {:?}: {}",
                device.id,
                request.command,
                start.elapsed(),
                e
            );
        }
        outcome
    }

    /// Run `commands` in order on one session.
    ///
    /// `timeout` applies to commands without their own. Transport failures
    /// and timeouts end the batch with an error in both modes.
    pub async fn execute_batch(
        &self,
        device: &Device,
        commands: &[CommandRequest],
        mode: BatchMode,
        timeout: Option<Duration>,
    ) -> Result<Vec<CommandResult>> {
        let mut session = self.pool.acquire(device, None).await?;
        let mut results = Vec::with_capacity(commands.len());
        let mut outcome = Ok(());

        for request in commands {
            let request = match (request.timeout, timeout) {
                (None, Some(t)) => request.clone().with_timeout(t),
                _ => request.clone(),
            };
            match self.execute_on(&mut session, &request).await {
                Ok(result) => {
                    let failed = !result.success;
                    results.push(result);
                    if failed && mode == BatchMode::FailFast {
                        debug!("{}: batch stopped at {:?}", device.id, request.command);
                        break;
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let healthy = session.is_healthy();
        self.pool.release(session, healthy).await;
        outcome.map(|()| results)
    }

    /// Run one command on a session the caller already holds.
    ///
    /// From configuration mode the command is wrapped so it runs as an
    /// operational command (`do`, `run`) without leaving the mode.
    pub async fn execute_on(&self, session: &mut Session, request: &CommandRequest) -> Result<CommandResult> {
        let handler = Arc::clone(session.handler());
        let mut wire = handler.format_command(&request.command, request.parser.as_deref());
        if session.in_config_mode() {
            wire = handler.exec_from_config(&wire);
        }

        let reply = session.send_command(&wire, request.timeout).await?;
        let output = handler.normalize_output(&reply.raw, &wire);
        let failure_message = handler.detect_failure(&output);

        let structured = match (&request.parser, &failure_message) {
            (Some(key), None) => self.parse(handler.as_ref(), key, &output),
            _ => None,
        };

        debug!(
            "{}: {:?} completed in {:?}",
            session.device_id(),
            wire,
            reply.elapsed
        );
        if let Some(message) = &failure_message {
            debug!("{}: device reported {:?}", session.device_id(), message);
        }

        Ok(CommandResult {
            command: request.command.clone(),
            output,
            raw: reply.raw,
            prompt: reply.prompt,
            structured,
            success: failure_message.is_none(),
            failure_message,
            elapsed: reply.elapsed,
        })
    }

    /// Registered parsers win over the handler's built-ins.
    fn parse(&self, handler: &dyn VendorHandler, key: &str, output: &str) -> Option<serde_json::Value> {
        match self.parsers.get(key) {
            Some(parser) => parser.parse(output),
            None => handler.parse_output(key, output),
        }
    }
}

/// Run a handler plan step by step.
///
/// Steps that wait for a prompt are checked against the handler's failure
/// patterns; the first failing step ends the plan with
/// [`CommandError::Rejected`].
pub async fn run_plan(
    session: &mut Session,
    handler: &dyn VendorHandler,
    plan: &[Step],
    timeout: Option<Duration>,
) -> Result<Vec<StepOutput>> {
    let mut outputs = Vec::with_capacity(plan.len());
    for step in plan {
        outputs.push(run_step(session, handler, step, timeout).await?);
    }
    Ok(outputs)
}

async fn run_step(
    session: &mut Session,
    handler: &dyn VendorHandler,
    step: &Step,
    timeout: Option<Duration>,
) -> Result<StepOutput> {
    let reply = match step {
        Step::Command(command) => session.send_command(command, timeout).await?,
        Step::Expect { command, pattern } => session.send_expect(command, pattern, timeout).await?,
        Step::Write(line) => {
            session.write_line(line).await?;
            return Ok(StepOutput {
                sent: line.clone(),
                output: String::new(),
                raw: String::new(),
            });
        }
        Step::EndOfInput => session.end_input(timeout).await?,
    };

    let sent = step.text().to_string();
    let output = handler.normalize_output(&reply.raw, &sent);
    if let Some(message) = handler.detect_failure(&output) {
        warn!("{}: {:?} rejected: {}", session.device_id(), sent, message);
        return Err(CommandError::Rejected {
            command: sent,
            message,
            output,
        }
        .into());
    }

    Ok(StepOutput {
        sent,
        output,
        raw: reply.raw,
    })
}

#[cfg(test)]
mod tests;
