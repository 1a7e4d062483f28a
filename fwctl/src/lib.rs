// ABOUTME: provides fwctl helpers for checking model responses and driving the rule store file.
// ABOUTME: the store subcommands are what fwintentd invokes on the firewall host.

use anyhow::Context;
use clap::Subcommand;
use fwintent_common::{
    extract, Command, FileRuleStore, FirewallRule, InsertOutcome, Request, RuleAction, RuleKey, RulesRequest,
    VoiceRequest,
};

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct VerdictError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct ExtractVerdict {
    pub ok: bool,
    pub command: Option<Command>,
    pub error: Option<VerdictError>,
}

pub fn extract_verdict(input: &str) -> ExtractVerdict {
    match extract(input) {
        Ok(command) => ExtractVerdict {
            ok: true,
            command: Some(command),
            error: None,
        },
        Err(err) => ExtractVerdict {
            ok: false,
            command: None,
            error: Some(VerdictError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        },
    }
}

pub fn voice_request(request_id: &str, text: &str) -> anyhow::Result<String> {
    if request_id.trim().is_empty() {
        return Err(anyhow::anyhow!("request_id must be non-empty"));
    }
    if text.trim().is_empty() {
        return Err(anyhow::anyhow!("text must be non-empty"));
    }
    let request = Request::Voice(VoiceRequest {
        request_id: request_id.to_string(),
        text: text.to_string(),
    });
    Ok(serde_json::to_string(&request)?)
}

pub fn rules_request(request_id: &str) -> anyhow::Result<String> {
    if request_id.trim().is_empty() {
        return Err(anyhow::anyhow!("request_id must be non-empty"));
    }
    let request = Request::Rules(RulesRequest {
        request_id: request_id.to_string(),
    });
    Ok(serde_json::to_string(&request)?)
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// Print every rule as a json array.
    List,
    /// Insert a rule given as json; prints {"inserted":bool}.
    Insert {
        #[arg(long)]
        rule: String,
    },
    /// Remove every rule with the given identity key; prints {"removed":n}.
    Remove {
        #[arg(long)]
        action: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        port: String,
    },
    /// Copy the store file aside before a change.
    Backup {
        #[arg(long)]
        name: Option<String>,
    },
}

pub fn run_store(store: &FileRuleStore, command: &StoreCommand) -> anyhow::Result<String> {
    let reply = match command {
        StoreCommand::List => serde_json::to_value(store.load()?.rules())?,
        StoreCommand::Insert { rule } => {
            let rule: FirewallRule = serde_json::from_str(rule).context("parse --rule json")?;
            let inserted = store.insert(rule)? == InsertOutcome::Inserted;
            serde_json::json!({ "inserted": inserted })
        }
        StoreCommand::Remove { action, ip, port } => {
            let key = RuleKey {
                action: parse_rule_action(action)?,
                source_address: ip.clone(),
                destination_port: port.clone(),
            };
            serde_json::json!({ "removed": store.remove(&key)? })
        }
        StoreCommand::Backup { name } => {
            let path = store.backup(name.as_deref())?;
            serde_json::json!({ "backup": path.display().to_string() })
        }
    };
    Ok(serde_json::to_string(&reply)?)
}

fn parse_rule_action(value: &str) -> anyhow::Result<RuleAction> {
    match value.trim().to_ascii_lowercase().as_str() {
        "block" => Ok(RuleAction::Block),
        "pass" | "allow" => Ok(RuleAction::Pass),
        other => Err(anyhow::anyhow!("unknown rule action {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_reports_command_for_fenced_response() {
        let v = extract_verdict("```json\n{\"action\":\"block\",\"ip\":\"10.0.0.5\",\"port\":\"22\"}\n```");
        assert!(v.ok);
        assert_eq!(v.command.unwrap().ip.unwrap().to_string(), "10.0.0.5");
    }

    #[test]
    fn verdict_reports_error_code() {
        let v = extract_verdict(r#"{"action":"block","ip":"10.0.0.5","port":"70000"}"#);
        assert!(!v.ok);
        assert_eq!(v.error.unwrap().code, "invalid_port");
    }

    #[test]
    fn voice_request_is_tagged() {
        let json = voice_request("req-1", "block 10.0.0.5").unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "voice");
        assert!(voice_request("req-1", "  ").is_err());
        assert!(rules_request(" ").is_err());
    }

    #[test]
    fn store_commands_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRuleStore::new(dir.path().join("rules.json"));

        let rule = r#"{"action":"block","source_address":"10.0.0.5","destination_port":"8080"}"#;
        let insert = StoreCommand::Insert { rule: rule.to_string() };
        assert_eq!(run_store(&store, &insert).unwrap(), r#"{"inserted":true}"#);
        assert_eq!(run_store(&store, &insert).unwrap(), r#"{"inserted":false}"#);

        let listed: Vec<FirewallRule> = serde_json::from_str(&run_store(&store, &StoreCommand::List).unwrap()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].interface, "lan");

        let backup = StoreCommand::Backup {
            name: Some("rules_backup_test.json".to_string()),
        };
        run_store(&store, &backup).unwrap();
        assert!(dir.path().join("rules_backup_test.json").exists());

        let remove = StoreCommand::Remove {
            action: "block".to_string(),
            ip: "10.0.0.5".to_string(),
            port: "8080".to_string(),
        };
        assert_eq!(run_store(&store, &remove).unwrap(), r#"{"removed":1}"#);
        assert_eq!(run_store(&store, &remove).unwrap(), r#"{"removed":0}"#);
    }

    #[test]
    fn remove_rejects_unknown_action() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRuleStore::new(dir.path().join("rules.json"));
        let remove = StoreCommand::Remove {
            action: "reject".to_string(),
            ip: "10.0.0.5".to_string(),
            port: "22".to_string(),
        };
        assert!(run_store(&store, &remove).is_err());
    }
}
