// ABOUTME: issues list, insert, remove and reload operations against the firewall host.
// ABOUTME: every mutation is preceded by a timestamped backup and followed by a filter reload.

use chrono::Local;
use fwintent_common::store::backup_name;
use fwintent_common::{FirewallRule, InsertOutcome, RuleKey};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channel::{RemoteChannel, RemoteOutput};
use crate::reconcile::RuleBackend;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("remote command failed: {0}")]
    CommandFailed(String),
    #[error("rule change applied but filter reload failed, reload manually: {0}")]
    AppliedButNotReloaded(String),
    #[error("remote output of {bytes} bytes exceeds the {limit} byte limit")]
    OutputTooLarge { bytes: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ListRules,
    InsertRule(FirewallRule),
    RemoveRule(RuleKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Rules(Vec<FirewallRule>),
    Inserted(InsertOutcome),
    Removed(usize),
}

#[derive(Debug, Deserialize)]
struct InsertReply {
    inserted: bool,
}

#[derive(Debug, Deserialize)]
struct RemoveReply {
    removed: usize,
}

pub struct RemoteExecutor<C> {
    channel: C,
    store_helper: String,
    reload_command: String,
}

impl<C: RemoteChannel + Sync> RemoteExecutor<C> {
    pub fn new(channel: C, store_helper: impl Into<String>, reload_command: impl Into<String>) -> Self {
        Self {
            channel,
            store_helper: store_helper.into(),
            reload_command: reload_command.into(),
        }
    }

    pub async fn execute(&self, operation: &Operation) -> Result<OperationOutput, ExecutionError> {
        match operation {
            Operation::ListRules => {
                let out = self.run_checked(&format!("{} list", self.store_helper)).await?;
                let rules = serde_json::from_str(out.stdout.trim())
                    .map_err(|err| ExecutionError::CommandFailed(format!("unreadable rule list: {err}")))?;
                Ok(OperationOutput::Rules(rules))
            }
            Operation::InsertRule(rule) => {
                self.backup().await?;
                let rule_json = serde_json::to_string(rule)
                    .map_err(|err| ExecutionError::CommandFailed(format!("encode rule: {err}")))?;
                let line = format!("{} insert --rule {}", self.store_helper, quote(&rule_json));
                let reply: InsertReply = parse_reply(&self.run_checked(&line).await?)?;
                if !reply.inserted {
                    info!(key = %rule.key(), "store rejected duplicate rule");
                    return Ok(OperationOutput::Inserted(InsertOutcome::Duplicate));
                }
                self.reload_after_write().await?;
                Ok(OperationOutput::Inserted(InsertOutcome::Inserted))
            }
            Operation::RemoveRule(key) => {
                self.backup().await?;
                let line = format!(
                    "{} remove --action {} --ip {} --port {}",
                    self.store_helper,
                    key.action,
                    quote(&key.source_address),
                    quote(&key.destination_port)
                );
                let reply: RemoveReply = parse_reply(&self.run_checked(&line).await?)?;
                if reply.removed > 0 {
                    self.reload_after_write().await?;
                }
                Ok(OperationOutput::Removed(reply.removed))
            }
        }
    }

    async fn backup(&self) -> Result<(), ExecutionError> {
        let name = backup_name(Local::now());
        let line = format!("{} backup --name {}", self.store_helper, quote(&name));
        self.run_checked(&line).await?;
        debug!(backup = %name, "rule store backed up");
        Ok(())
    }

    async fn reload_after_write(&self) -> Result<(), ExecutionError> {
        match self.run_checked(&self.reload_command).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(error = %err, "filter reload failed after write");
                Err(ExecutionError::AppliedButNotReloaded(err.to_string()))
            }
        }
    }

    async fn run_checked(&self, line: &str) -> Result<RemoteOutput, ExecutionError> {
        debug!(command = %line, "running remote command");
        let out = self.channel.run(line).await?;
        if !out.success() {
            return Err(ExecutionError::CommandFailed(out.failure_message()));
        }
        Ok(out)
    }
}

impl<C: RemoteChannel + Sync> RuleBackend for RemoteExecutor<C> {
    async fn list_rules(&self) -> Result<Vec<FirewallRule>, ExecutionError> {
        match self.execute(&Operation::ListRules).await? {
            OperationOutput::Rules(rules) => Ok(rules),
            other => Err(unexpected(other)),
        }
    }

    async fn insert_rule(&self, rule: &FirewallRule) -> Result<InsertOutcome, ExecutionError> {
        match self.execute(&Operation::InsertRule(rule.clone())).await? {
            OperationOutput::Inserted(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_rule(&self, key: &RuleKey) -> Result<usize, ExecutionError> {
        match self.execute(&Operation::RemoveRule(key.clone())).await? {
            OperationOutput::Removed(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(output: OperationOutput) -> ExecutionError {
    ExecutionError::CommandFailed(format!("unexpected operation output: {output:?}"))
}

fn parse_reply<T: serde::de::DeserializeOwned>(out: &RemoteOutput) -> Result<T, ExecutionError> {
    serde_json::from_str(out.stdout.trim())
        .map_err(|err| ExecutionError::CommandFailed(format!("unreadable helper reply {:?}: {err}", out.stdout.trim())))
}

/// Single-quotes `value` for a posix shell.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
