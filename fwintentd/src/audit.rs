// ABOUTME: writes append-only audit records for each received request and its service result.
// ABOUTME: keeps auditing deterministic by logging structured json lines.

use anyhow::Context;
use fwintent_common::{Request, ServiceResult};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, serde::Serialize)]
struct AuditRecord<'a> {
    ts_unix_ms: u64,
    peer: Option<PeerCredentials>,
    request_id: &'a str,
    kind: &'a str,
    text: Option<&'a str>,
    result: &'a ServiceResult,
}

pub async fn append_record(
    audit_path: &str,
    ts_unix_ms: u64,
    peer: Option<PeerCredentials>,
    request: &Request,
    result: &ServiceResult,
) -> anyhow::Result<()> {
    let text = match request {
        Request::Voice(v) => Some(v.text.as_str()),
        Request::Rules(_) => None,
    };

    let record = AuditRecord {
        ts_unix_ms,
        peer,
        request_id: request.request_id(),
        kind: request.kind(),
        text,
        result,
    };

    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .await
        .with_context(|| format!("open audit log at {audit_path}"))?;

    use tokio::io::AsyncWriteExt;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}
