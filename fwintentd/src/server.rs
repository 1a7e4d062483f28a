// ABOUTME: hosts the unix socket server that receives intent requests and returns service results.
// ABOUTME: enforces request size and read limits, strict request parsing, and audit logging.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fwintent_common::{parse_request, ErrorClass, Request, Response, ServiceResult};
use std::os::unix::io::AsRawFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::audit;
use crate::reconcile::RuleBackend;
use crate::service::CommandService;
use crate::translator::Translator;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
#[cfg(test)]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);
#[cfg(not(test))]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

pub async fn run<B, T>(socket_path: &str, audit_path: &str, service: Arc<CommandService<B, T>>) -> anyhow::Result<()>
where
    B: RuleBackend + Send + Sync + 'static,
    T: Translator + Send + Sync + 'static,
{
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("remove existing socket at {socket_path}"))?;
    }

    let listener = UnixListener::bind(socket_path).with_context(|| format!("bind {socket_path}"))?;
    info!(socket = socket_path, "listening for intent requests");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let audit_path = audit_path.to_string();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &audit_path, &service).await {
                warn!(error = %err, "client connection failed");
            }
        });
    }
}

async fn handle_client<B, T>(mut stream: UnixStream, audit_path: &str, service: &CommandService<B, T>) -> anyhow::Result<()>
where
    B: RuleBackend + Sync,
    T: Translator + Sync,
{
    let peer = peer_credentials(&stream);

    let mut input = Vec::new();
    let mut buf = [0u8; 4096];
    let mut exceeded = false;
    let mut idle = false;
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                idle = true;
                break;
            }
        };
        if n == 0 {
            break;
        }
        if exceeded {
            continue;
        }
        if input.len() + n > MAX_REQUEST_BYTES {
            exceeded = true;
            continue;
        }
        input.extend_from_slice(&buf[..n]);
    }

    if exceeded {
        let _ = write_request_error(&mut stream, "unknown", "request exceeds max bytes").await;
        return Ok(());
    }

    if idle && input.is_empty() {
        let _ = write_request_error(&mut stream, "unknown", "read timed out").await;
        return Ok(());
    }

    let input_str = String::from_utf8_lossy(&input);
    let request = match parse_request(&input_str) {
        Ok(r) => r,
        Err(err) => {
            let _ = write_request_error(&mut stream, "unknown", &format!("parse failed: {err}")).await;
            return Ok(());
        }
    };

    if request.request_id().trim().is_empty() {
        let _ = write_request_error(&mut stream, "unknown", "request_id must be non-empty").await;
        return Ok(());
    }

    info!(request_id = request.request_id(), kind = request.kind(), "request accepted");
    let result = match &request {
        Request::Voice(voice) => service.handle_text(&voice.text).await,
        Request::Rules(_) => service.list_rules().await,
    };

    let response = Response {
        request_id: request.request_id().to_string(),
        result,
    };
    let response_json = serde_json::to_vec(&response)?;
    stream.write_all(&response_json).await?;
    stream.shutdown().await?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    if let Err(err) = audit::append_record(audit_path, now_ms, peer, &request, &response.result).await {
        warn!(error = %err, "audit write failed");
    }

    Ok(())
}

fn peer_credentials(stream: &UnixStream) -> Option<audit::PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    if len as usize != std::mem::size_of::<libc::ucred>() {
        return None;
    }

    Some(audit::PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

async fn write_request_error(stream: &mut UnixStream, request_id: &str, message: &str) -> anyhow::Result<()> {
    let response = Response {
        request_id: request_id.to_string(),
        result: ServiceResult::error(ErrorClass::Validation, message),
    };
    let response_json = serde_json::to_vec(&response)?;
    stream.write_all(&response_json).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::FakeBackend;
    use crate::translator::Passthrough;
    use fwintent_common::{FirewallRule, RuleAction, RuleKey, Status};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    struct Harness {
        _dir: tempfile::TempDir,
        socket_path: PathBuf,
        audit_path: PathBuf,
        server: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn start(backend: FakeBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("fwintentd.sock");
        let audit_path = dir.path().join("audit.jsonl");

        let socket_path_str = socket_path.to_string_lossy().to_string();
        let audit_path_str = audit_path.to_string_lossy().to_string();
        let service = Arc::new(CommandService::new(backend, Passthrough));

        let server = tokio::spawn(async move { run(&socket_path_str, &audit_path_str, service).await });

        for _ in 0..50u32 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        Harness {
            _dir: dir,
            socket_path,
            audit_path,
            server,
        }
    }

    async fn send(socket_path: &Path, payload: &[u8]) -> Response {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    async fn first_audit_line(audit_path: &Path) -> serde_json::Value {
        for _ in 0..50u32 {
            if let Ok(meta) = tokio::fs::metadata(audit_path).await {
                if meta.len() > 0 {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let text = tokio::fs::read_to_string(audit_path).await.unwrap();
        let line = text.lines().find(|l| !l.trim().is_empty()).unwrap();
        serde_json::from_str(line).unwrap()
    }

    #[tokio::test]
    async fn server_voice_block_roundtrip() {
        let h = start(FakeBackend::default()).await;

        let request = r#"{
          "type":"voice",
          "request_id":"req-block-1",
          "text":"```json\n{\"action\":\"block\",\"ip\":\"10.0.0.5\",\"port\":\"8080\"}\n```"
        }"#;
        let response = send(&h.socket_path, request.as_bytes()).await;
        assert_eq!(response.request_id, "req-block-1");
        assert_eq!(response.result, ServiceResult::message("rule added: block 10.0.0.5:8080"));

        let v = first_audit_line(&h.audit_path).await;
        assert_eq!(v["request_id"], "req-block-1");
        assert_eq!(v["kind"], "voice");
        assert_eq!(v["result"]["status"], "ok");
        assert_eq!(v["peer"]["pid"].as_u64().unwrap(), std::process::id() as u64);

        h.server.abort();
    }

    #[tokio::test]
    async fn server_rules_request_lists_snapshot() {
        let rule = FirewallRule::from_key(&RuleKey::new(RuleAction::Block, Ipv4Addr::new(10, 0, 0, 5), 22));
        let h = start(FakeBackend::with_rules(vec![rule.clone()])).await;

        let response = send(&h.socket_path, br#"{"type":"rules","request_id":"req-rules-1"}"#).await;
        match response.result {
            ServiceResult::Rules { status, rules } => {
                assert_eq!(status, Status::Ok);
                assert_eq!(rules, vec![rule]);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        h.server.abort();
    }

    #[tokio::test]
    async fn server_reports_llm_class_for_unusable_model_output() {
        let h = start(FakeBackend::default()).await;

        let request = r#"{"type":"voice","request_id":"req-llm-1","text":"I am not sure what you mean."}"#;
        let response = send(&h.socket_path, request.as_bytes()).await;
        assert_eq!(response.request_id, "req-llm-1");
        assert_eq!(response.result.error_class(), Some(ErrorClass::Llm));

        h.server.abort();
    }

    #[tokio::test]
    async fn server_returns_validation_error_for_invalid_json() {
        let h = start(FakeBackend::default()).await;

        let response = send(&h.socket_path, b"{ not json").await;
        assert_eq!(response.request_id, "unknown");
        assert_eq!(response.result.error_class(), Some(ErrorClass::Validation));

        h.server.abort();
    }

    #[tokio::test]
    async fn server_returns_validation_error_for_unknown_fields() {
        let h = start(FakeBackend::default()).await;

        let request = r#"{"type":"voice","request_id":"req-1","text":"block","x-api-key":"secret"}"#;
        let response = send(&h.socket_path, request.as_bytes()).await;
        assert_eq!(response.result.error_class(), Some(ErrorClass::Validation));

        h.server.abort();
    }

    #[tokio::test]
    async fn server_rejects_oversized_request_with_json_error() {
        let h = start(FakeBackend::default()).await;

        let big = vec![b'a'; MAX_REQUEST_BYTES + 1];
        let response = send(&h.socket_path, &big).await;
        match response.result {
            ServiceResult::Error { error, message } => {
                assert_eq!(error, ErrorClass::Validation);
                assert!(message.contains("max bytes"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        h.server.abort();
    }

    #[tokio::test]
    async fn server_rejects_blank_request_id() {
        let h = start(FakeBackend::default()).await;

        let response = send(&h.socket_path, br#"{"type":"rules","request_id":"  "}"#).await;
        assert_eq!(response.result.error_class(), Some(ErrorClass::Validation));

        h.server.abort();
    }
}
