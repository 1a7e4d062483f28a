// ABOUTME: defines the shared firewall intent protocol used by fwctl and fwintentd.
// ABOUTME: covers validated commands, filter rules, identity keys and the service result envelope.

pub mod extract;
pub mod store;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use extract::{extract, ExtractionError};
pub use store::{FileRuleStore, InsertOutcome, RuleSet, StoreError};

pub const DEFAULT_INTERFACE: &str = "lan";
pub const DEFAULT_PROTOCOL: &str = "tcp";
pub const DEFAULT_DIRECTION: &str = "in";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Block,
    Allow,
    Remove,
    Unblock,
    List,
}

impl CommandAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Some(Self::Block),
            "allow" => Some(Self::Allow),
            "remove" => Some(Self::Remove),
            "unblock" => Some(Self::Unblock),
            "list" => Some(Self::List),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Allow => "allow",
            Self::Remove => "remove",
            Self::Unblock => "unblock",
            Self::List => "list",
        }
    }

    /// `remove` and `unblock` are synonyms: both delete a previously blocked rule.
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Remove | Self::Unblock)
    }

    /// Rule action an insert for this command produces, if it produces one at all.
    pub fn rule_action(self) -> Option<RuleAction> {
        match self {
            Self::Block => Some(RuleAction::Block),
            Self::Allow => Some(RuleAction::Pass),
            _ => None,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Pass,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Pass => "pass",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination port as requested by a command. `All` never reaches a stored rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Port {
    #[default]
    All,
    Number(u16),
}

impl FromStr for Port {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Port::All);
        }
        let invalid = || format!("port must be \"all\" or an integer in 0..=65535, got {trimmed:?}");
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        trimmed.parse::<u16>().map(Port::Number).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Port {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.to_string()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::All => f.write_str("all"),
            Port::Number(n) => write!(f, "{n}"),
        }
    }
}

impl JsonSchema for Port {
    fn schema_name() -> String {
        "Port".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <String as JsonSchema>::json_schema(gen)
    }
}

/// A validated request. `ip` is only absent for `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub action: CommandAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub port: Port,
}

impl Command {
    pub fn new(action: CommandAction, ip: Option<Ipv4Addr>, port: Port) -> Self {
        Self { action, ip, port }
    }
}

/// `(action, source address, destination port)`: the store never holds two rules with the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    pub action: RuleAction,
    pub source_address: String,
    pub destination_port: String,
}

impl RuleKey {
    pub fn new(action: RuleAction, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            action,
            source_address: ip.to_string(),
            destination_port: port.to_string(),
        }
    }

    pub fn matches(&self, rule: &FirewallRule) -> bool {
        rule.action == self.action
            && rule.source_address == self.source_address
            && rule.destination_port == self.destination_port
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.action, self.source_address, self.destination_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub action: RuleAction,
    pub source_address: String,
    pub destination_port: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_direction() -> String {
    DEFAULT_DIRECTION.to_string()
}

impl FirewallRule {
    pub fn from_key(key: &RuleKey) -> Self {
        Self {
            action: key.action,
            source_address: key.source_address.clone(),
            destination_port: key.destination_port.clone(),
            interface: default_interface(),
            protocol: default_protocol(),
            direction: default_direction(),
            description: format!("{} rule from fwintent", key.action.as_str().to_ascii_uppercase()),
            disabled: false,
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            action: self.action,
            source_address: self.source_address.clone(),
            destination_port: self.destination_port.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    AlreadyExists,
    UnblockedAll,
    Partial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Llm,
    Firewall,
    Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovedRule {
    pub ip: String,
    pub port: String,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedRemoval {
    pub ip: String,
    pub port: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServiceResult {
    Rules {
        status: Status,
        rules: Vec<FirewallRule>,
    },
    Message {
        status: Status,
        result: String,
    },
    AlreadyExists {
        status: Status,
        action: CommandAction,
        ip: String,
        port: String,
    },
    Bulk {
        status: Status,
        deleted: Vec<RemovedRule>,
        failed: Vec<FailedRemoval>,
    },
    Error {
        error: ErrorClass,
        message: String,
    },
}

impl ServiceResult {
    pub fn rules(rules: Vec<FirewallRule>) -> Self {
        Self::Rules {
            status: Status::Ok,
            rules,
        }
    }

    pub fn message(result: impl Into<String>) -> Self {
        Self::Message {
            status: Status::Ok,
            result: result.into(),
        }
    }

    pub fn already_exists(action: CommandAction, ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self::AlreadyExists {
            status: Status::AlreadyExists,
            action,
            ip: ip.into(),
            port: port.into(),
        }
    }

    pub fn bulk(deleted: Vec<RemovedRule>, failed: Vec<FailedRemoval>) -> Self {
        let status = if failed.is_empty() {
            Status::UnblockedAll
        } else {
            Status::Partial
        };
        Self::Bulk {
            status,
            deleted,
            failed,
        }
    }

    pub fn error(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Error {
            error: class,
            message: message.into(),
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Error { error, .. } => Some(*error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Voice(VoiceRequest),
    Rules(RulesRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VoiceRequest {
    pub request_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RulesRequest {
    pub request_id: String,
}

impl Request {
    pub fn request_id(&self) -> &str {
        match self {
            Request::Voice(v) => &v.request_id,
            Request::Rules(r) => &r.request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Voice(_) => "voice",
            Request::Rules(_) => "rules",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Response {
    pub request_id: String,
    pub result: ServiceResult,
}

pub fn parse_request(input: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(input)
}
