// ABOUTME: turns a user's free-text request into the raw response of a language model.
// ABOUTME: passes text through, posts it to an ollama-style generate endpoint, or pipes it to a program.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const SYSTEM_PROMPT: &str = "You are a network assistant. Return only a single JSON object \
representing a firewall command with keys action, ip and port. action is one of block, allow, \
remove, unblock or list. port is a TCP port number as a string, or \"all\" to remove every rule \
for the address.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("translator spawn failed: {0}")]
    Spawn(String),
    #[error("translator timed out")]
    Timeout,
    #[error("translator exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("translator returned an empty response")]
    Empty,
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model endpoint returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unreadable model reply: {0}")]
    Decode(String),
}

pub trait Translator {
    fn translate(&self, text: &str) -> impl Future<Output = Result<String, TranslateError>> + Send;
}

/// Treats the incoming text as the model response itself.
#[derive(Debug, Clone, Default)]
pub struct Passthrough;

impl Translator for Passthrough {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        Ok(text.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CommandTranslator {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTranslator {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    async fn run(&self, prompt: String) -> Result<std::process::Output, TranslateError> {
        let program = self
            .argv
            .first()
            .ok_or_else(|| TranslateError::Spawn("missing argv[0]".to_string()))?;

        let mut child = Command::new(program)
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TranslateError::Spawn(err.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|err| TranslateError::Spawn(format!("write prompt: {err}")))?;
        }

        child
            .wait_with_output()
            .await
            .map_err(|err| TranslateError::Spawn(err.to_string()))
    }
}

impl Translator for CommandTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let prompt = format!("{SYSTEM_PROMPT}\n\nRequest: {}\n", text.trim());
        let output = tokio::time::timeout(self.timeout, self.run(prompt))
            .await
            .map_err(|_| TranslateError::Timeout)??;

        if !output.status.success() {
            return Err(TranslateError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let response = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if response.is_empty() {
            return Err(TranslateError::Empty);
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Calls a non-streaming `/api/generate` endpoint and returns its `response` field.
#[derive(Debug, Clone)]
pub struct HttpTranslator {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpTranslator {
    pub fn new(url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, TranslateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TranslateError::Request(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
        })
    }
}

impl Translator for HttpTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let body = GenerateRequest {
            model: &self.model,
            system: SYSTEM_PROMPT,
            prompt: text.trim(),
            stream: false,
        };
        debug!(url = %self.url, model = %self.model, "sending model request");

        let resp = self.client.post(&self.url).json(&body).send().await.map_err(request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(TranslateError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let reply: GenerateResponse = resp.json().await.map_err(|err| {
            if err.is_timeout() {
                TranslateError::Timeout
            } else {
                TranslateError::Decode(err.to_string())
            }
        })?;
        let response = reply.response.trim().to_string();
        if response.is_empty() {
            return Err(TranslateError::Empty);
        }
        Ok(response)
    }
}

fn request_error(err: reqwest::Error) -> TranslateError {
    if err.is_timeout() {
        TranslateError::Timeout
    } else {
        TranslateError::Request(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum ConfiguredTranslator {
    Passthrough(Passthrough),
    Http(HttpTranslator),
    Command(CommandTranslator),
}

impl Translator for ConfiguredTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        match self {
            ConfiguredTranslator::Passthrough(t) => t.translate(text).await,
            ConfiguredTranslator::Http(t) => t.translate(text).await,
            ConfiguredTranslator::Command(t) => t.translate(text).await,
        }
    }
}
