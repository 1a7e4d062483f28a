// ABOUTME: turns a raw language-model response into a validated firewall command.
// ABOUTME: tolerates markdown fences and surrounding commentary but validates every field strictly.

use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use crate::{Command, CommandAction, Port};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

impl ExtractionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedResponse(_) => "malformed_response",
            Self::UnsupportedAction(_) => "unsupported_action",
            Self::InvalidAddress(_) => "invalid_address",
            Self::InvalidPort(_) => "invalid_port",
        }
    }
}

pub fn extract(raw: &str) -> Result<Command, ExtractionError> {
    let object = locate_object(strip_fences(raw))?;

    // older prompts produced the verb under "command"
    let action_value = object.get("action").or_else(|| object.get("command"));
    let action = match action_value {
        Some(Value::String(s)) => CommandAction::parse(s).ok_or_else(|| ExtractionError::UnsupportedAction(s.clone())),
        Some(other) => Err(ExtractionError::UnsupportedAction(other.to_string())),
        None => Err(ExtractionError::UnsupportedAction("missing action".to_string())),
    }?;

    if action == CommandAction::List {
        let ip = match object.get("ip") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(value) => Some(parse_ip(value)?),
        };
        return Ok(Command::new(action, ip, Port::All));
    }

    let ip = match object.get("ip") {
        Some(value) => parse_ip(value)?,
        None => return Err(ExtractionError::InvalidAddress("missing ip".to_string())),
    };
    let port = match object.get("port") {
        Some(value) => parse_port(value)?,
        None => return Err(ExtractionError::InvalidPort("missing port".to_string())),
    };

    if !action.is_removal() {
        match port {
            Port::All => {
                return Err(ExtractionError::InvalidPort(format!(
                    "{action} needs a specific port, \"all\" is only valid for removal"
                )))
            }
            Port::Number(0) => {
                return Err(ExtractionError::InvalidPort(format!("{action} needs a port in 1..=65535")))
            }
            Port::Number(_) => {}
        }
    }

    Ok(Command::new(action, Some(ip), port))
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.trim_end().trim_end_matches('`').trim()
}

fn locate_object(text: &str) -> Result<Map<String, Value>, ExtractionError> {
    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Err(ExtractionError::MalformedResponse("no json object found".to_string())),
    };

    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ExtractionError::MalformedResponse("payload is not a json object".to_string())),
        Err(err) => Err(ExtractionError::MalformedResponse(err.to_string())),
    }
}

fn parse_ip(value: &Value) -> Result<Ipv4Addr, ExtractionError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ExtractionError::InvalidAddress(s.clone())),
        other => Err(ExtractionError::InvalidAddress(other.to_string())),
    }
}

fn parse_port(value: &Value) -> Result<Port, ExtractionError> {
    match value {
        Value::String(s) => s.parse::<Port>().map_err(|_| ExtractionError::InvalidPort(s.clone())),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Port::Number)
            .ok_or_else(|| ExtractionError::InvalidPort(n.to_string())),
        other => Err(ExtractionError::InvalidPort(other.to_string())),
    }
}
