// ABOUTME: runs a single command line on the firewall host over ssh or a local shell.
// ABOUTME: bounds every call with a timeout, returns stdout whole and caps stderr for messages.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::executor::ExecutionError;

const MAX_STDERR_BYTES: usize = 8192;
// stdout carries data such as the full rule list
const MAX_STDOUT_BYTES: usize = 16 * 1024 * 1024;
const SSH_CONNECTION_ERROR: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Standard error when present, otherwise standard output.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return truncate_bytes(stdout.as_bytes(), MAX_STDERR_BYTES);
        }
        match self.exit_code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

pub trait RemoteChannel {
    fn run(&self, command_line: &str) -> impl Future<Output = Result<RemoteOutput, ExecutionError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SshChannel {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<String>,
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
}

impl SshChannel {
    fn argv(&self, command_line: &str) -> Vec<String> {
        let mut argv = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity {
            argv.push("-i".to_string());
            argv.push(identity.clone());
        }
        argv.push(format!("{}@{}", self.user, self.host));
        argv.push("--".to_string());
        argv.push(command_line.to_string());
        argv
    }
}

impl RemoteChannel for SshChannel {
    async fn run(&self, command_line: &str) -> Result<RemoteOutput, ExecutionError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.argv(command_line));

        let output = run_bounded(cmd, self.exec_timeout).await?;
        if output.exit_code == Some(SSH_CONNECTION_ERROR) {
            return Err(ExecutionError::ConnectionFailed(format!(
                "ssh to {}:{} failed: {}",
                self.host,
                self.port,
                output.failure_message()
            )));
        }
        Ok(output)
    }
}

/// Runs commands through `sh -c` when the daemon lives on the firewall host itself.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    pub exec_timeout: Duration,
}

impl RemoteChannel for LocalChannel {
    async fn run(&self, command_line: &str) -> Result<RemoteOutput, ExecutionError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        run_bounded(cmd, self.exec_timeout).await
    }
}

#[derive(Debug, Clone)]
pub enum Transport {
    Ssh(SshChannel),
    Local(LocalChannel),
}

impl RemoteChannel for Transport {
    async fn run(&self, command_line: &str) -> Result<RemoteOutput, ExecutionError> {
        match self {
            Transport::Ssh(c) => c.run(command_line).await,
            Transport::Local(c) => c.run(command_line).await,
        }
    }
}

async fn run_bounded(mut cmd: Command, timeout: Duration) -> Result<RemoteOutput, ExecutionError> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(ExecutionError::ConnectionFailed(format!("spawn failed: {err}"))),
        Err(_) => {
            return Err(ExecutionError::ConnectionFailed(format!(
                "timed out after {}s",
                timeout.as_secs_f32()
            )))
        }
    };

    if output.stdout.len() > MAX_STDOUT_BYTES {
        return Err(ExecutionError::OutputTooLarge {
            bytes: output.stdout.len(),
            limit: MAX_STDOUT_BYTES,
        });
    }

    Ok(RemoteOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: truncate_bytes(&output.stderr, MAX_STDERR_BYTES),
        exit_code: output.status.code(),
    })
}

fn truncate_bytes(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).to_string();
    }

    let mut out = String::from_utf8_lossy(&bytes[..limit]).to_string();
    out.push_str("\n[truncated]\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalChannel {
        LocalChannel {
            exec_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn local_channel_captures_stdout_and_exit_code() {
        let out = local().run("echo hi").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn failure_message_prefers_stderr() {
        let out = local().run("echo out; echo err >&2; exit 3").await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.failure_message(), "err");

        let out = local().run("echo only-out; exit 4").await.unwrap();
        assert_eq!(out.failure_message(), "only-out");
    }

    #[tokio::test]
    async fn timeout_surfaces_as_connection_failure() {
        let channel = LocalChannel {
            exec_timeout: Duration::from_millis(100),
        };
        let err = channel.run("sleep 5").await.unwrap_err();
        match err {
            ExecutionError::ConnectionFailed(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ssh_argv_places_command_after_separator() {
        let channel = SshChannel {
            host: "192.168.1.101".to_string(),
            port: 2222,
            user: "root".to_string(),
            identity: Some("/root/.ssh/id_ed25519".to_string()),
            connect_timeout: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(10),
        };
        let argv = channel.argv("fwctl store list");
        assert_eq!(argv[3], "ConnectTimeout=10");
        assert_eq!(argv[5], "2222");
        assert_eq!(&argv[argv.len() - 3..], &["root@192.168.1.101", "--", "fwctl store list"]);
        assert!(argv.contains(&"/root/.ssh/id_ed25519".to_string()));
    }

    #[test]
    fn truncates_large_output() {
        let big = vec![b'a'; MAX_STDERR_BYTES + 10];
        assert!(truncate_bytes(&big, MAX_STDERR_BYTES).ends_with("[truncated]\n"));
    }

    #[tokio::test]
    async fn stdout_is_returned_whole_and_stderr_is_capped() {
        let out = local()
            .run("head -c 20000 /dev/zero | tr '\\0' a; head -c 20000 /dev/zero | tr '\\0' e >&2")
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 20000);
        assert!(out.stdout.bytes().all(|b| b == b'a'));
        assert!(out.stderr.ends_with("[truncated]\n"));
        assert!(out.stderr.len() < 20000);
    }
}
