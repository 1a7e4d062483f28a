// ABOUTME: implements the rule store: an ordered rule set plus its durable json file form.
// ABOUTME: writes go through a temp file and rename so a mutation is never half-applied.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{FirewallRule, RuleKey};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rule store {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid backup name: {0}")]
    InvalidBackupName(String),
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<FirewallRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<FirewallRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    pub fn into_rules(self) -> Vec<FirewallRule> {
        self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn find(&self, key: &RuleKey) -> Option<&FirewallRule> {
        self.rules.iter().find(|r| key.matches(r))
    }

    pub fn insert(&mut self, rule: FirewallRule) -> InsertOutcome {
        if self.find(&rule.key()).is_some() {
            return InsertOutcome::Duplicate;
        }
        self.rules.push(rule);
        InsertOutcome::Inserted
    }

    /// Removes every rule matching `key` and returns how many were dropped.
    pub fn remove(&mut self, key: &RuleKey) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| !key.matches(r));
        before - self.rules.len()
    }

    pub fn for_address<'a>(&'a self, ip: &'a str) -> impl Iterator<Item = &'a FirewallRule> + 'a {
        self.rules.iter().filter(move |r| r.source_address == ip)
    }
}

pub fn backup_name(now: DateTime<Local>) -> String {
    format!("rules_backup_{}.json", now.format("%Y%m%d_%H%M%S_%3f"))
}

#[derive(Debug, Clone)]
pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RuleSet, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(RuleSet::default()),
            Err(err) => return Err(io_error(format!("read {}", self.path.display()))(err)),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(RuleSet::default());
        }
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Copies the current file next to itself under `name`, or a timestamped default.
    pub fn backup(&self, name: Option<&str>) -> Result<PathBuf, StoreError> {
        let name = match name {
            Some(n) => {
                if n.is_empty() || n.contains('/') || n.contains('\\') || n == "." || n == ".." {
                    return Err(StoreError::InvalidBackupName(n.to_string()));
                }
                n.to_string()
            }
            None => backup_name(Local::now()),
        };
        let target = self.dir().join(name);

        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => b"[]\n".to_vec(),
            Err(err) => return Err(io_error(format!("read {}", self.path.display()))(err)),
        };
        write_atomic(&target, &data)?;
        Ok(target)
    }

    pub fn save(&self, set: &RuleSet) -> Result<(), StoreError> {
        let mut data = serde_json::to_vec_pretty(set).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        data.push(b'\n');
        write_atomic(&self.path, &data)
    }

    pub fn insert(&self, rule: FirewallRule) -> Result<InsertOutcome, StoreError> {
        let mut set = self.load()?;
        let outcome = set.insert(rule);
        if outcome == InsertOutcome::Inserted {
            self.save(&set)?;
        }
        Ok(outcome)
    }

    pub fn remove(&self, key: &RuleKey) -> Result<usize, StoreError> {
        let mut set = self.load()?;
        let removed = set.remove(key);
        if removed > 0 {
            self.save(&set)?;
        }
        Ok(removed)
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "rules".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp).map_err(io_error(format!("create {}", tmp.display())))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(io_error(format!("write {}", tmp.display())))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_error(format!("replace {}", path.display())))
}
