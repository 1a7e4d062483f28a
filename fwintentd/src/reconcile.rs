// ABOUTME: decides which rule mutations a validated command needs against a fresh rule snapshot.
// ABOUTME: keeps inserts idempotent and expands bulk removal into ordered single-rule removals.

use std::future::Future;

use fwintent_common::{
    Command, CommandAction, FailedRemoval, FirewallRule, InsertOutcome, Port, RemovedRule, RuleAction,
    RuleKey,
};
use tracing::{info, warn};

use crate::executor::ExecutionError;

/// The rule store as seen from the daemon: a fresh snapshot plus single-rule mutations.
pub trait RuleBackend {
    fn list_rules(&self) -> impl Future<Output = Result<Vec<FirewallRule>, ExecutionError>> + Send;

    fn insert_rule(&self, rule: &FirewallRule) -> impl Future<Output = Result<InsertOutcome, ExecutionError>> + Send;

    /// Removes every rule matching `key`; zero is a successful no-op.
    fn remove_rule(&self, key: &RuleKey) -> impl Future<Output = Result<usize, ExecutionError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("command requires an ip address")]
    MissingAddress,
    #[error("{0} requires a specific port")]
    PortRequired(CommandAction),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Listed(Vec<FirewallRule>),
    Inserted(RuleKey),
    AlreadyExists(RuleKey),
    Removed { key: RuleKey, count: usize },
    NothingToRemove(RuleKey),
    BulkRemoved(BulkRemoval),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkRemoval {
    pub deleted: Vec<RemovedRule>,
    pub failed: Vec<FailedRemoval>,
}

pub async fn reconcile<B: RuleBackend + Sync>(
    command: &Command,
    backend: &B,
) -> Result<ReconcileOutcome, ReconcileError> {
    match command.action {
        CommandAction::List => {
            let rules = backend.list_rules().await?;
            let rules = match command.ip {
                Some(ip) => {
                    let ip = ip.to_string();
                    rules.into_iter().filter(|r| r.source_address == ip).collect()
                }
                None => rules,
            };
            Ok(ReconcileOutcome::Listed(rules))
        }
        CommandAction::Block | CommandAction::Allow => {
            let ip = command.ip.ok_or(ReconcileError::MissingAddress)?;
            let port = match command.port {
                Port::Number(n) => n,
                Port::All => return Err(ReconcileError::PortRequired(command.action)),
            };
            let action = match command.action {
                CommandAction::Block => RuleAction::Block,
                _ => RuleAction::Pass,
            };
            let key = RuleKey::new(action, ip, port);

            let snapshot = backend.list_rules().await?;
            if snapshot.iter().any(|r| key.matches(r)) {
                info!(%key, "rule already present");
                return Ok(ReconcileOutcome::AlreadyExists(key));
            }

            match backend.insert_rule(&FirewallRule::from_key(&key)).await? {
                InsertOutcome::Inserted => {
                    info!(%key, "rule inserted");
                    Ok(ReconcileOutcome::Inserted(key))
                }
                InsertOutcome::Duplicate => Ok(ReconcileOutcome::AlreadyExists(key)),
            }
        }
        CommandAction::Remove | CommandAction::Unblock => {
            let ip = command.ip.ok_or(ReconcileError::MissingAddress)?;
            match command.port {
                Port::Number(port) => {
                    let key = RuleKey::new(RuleAction::Block, ip, port);
                    let count = backend.remove_rule(&key).await?;
                    if count == 0 {
                        info!(%key, "no matching block rule");
                        return Ok(ReconcileOutcome::NothingToRemove(key));
                    }
                    info!(%key, count, "block rule removed");
                    Ok(ReconcileOutcome::Removed { key, count })
                }
                Port::All => {
                    let ip = ip.to_string();
                    let snapshot = backend.list_rules().await?;
                    let targets = bulk_targets(&snapshot, &ip);
                    Ok(ReconcileOutcome::BulkRemoved(remove_each(backend, targets).await))
                }
            }
        }
    }
}

/// Block rules for `ip` in snapshot order, one key per distinct rule identity.
fn bulk_targets(snapshot: &[FirewallRule], ip: &str) -> Vec<RuleKey> {
    let mut keys: Vec<RuleKey> = Vec::new();
    for rule in snapshot {
        if rule.action != RuleAction::Block || rule.source_address != ip {
            continue;
        }
        let key = rule.key();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

async fn remove_each<B: RuleBackend + Sync>(backend: &B, targets: Vec<RuleKey>) -> BulkRemoval {
    let mut result = BulkRemoval::default();
    for key in targets {
        match backend.remove_rule(&key).await {
            Ok(removed) => result.deleted.push(RemovedRule {
                ip: key.source_address,
                port: key.destination_port,
                removed,
            }),
            Err(err) => {
                warn!(%key, error = %err, "bulk removal step failed");
                result.failed.push(FailedRemoval {
                    ip: key.source_address,
                    port: key.destination_port,
                    error: err.to_string(),
                });
            }
        }
    }
    result
}
