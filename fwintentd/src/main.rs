// ABOUTME: runs the daemon that compiles firewall intents into rule changes on a remote packet filter.
// ABOUTME: exposes a local unix socket and writes an audit log for each request.

mod audit;
mod channel;
mod executor;
mod reconcile;
mod server;
mod service;
mod translator;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::channel::{LocalChannel, SshChannel, Transport};
use crate::executor::RemoteExecutor;
use crate::service::CommandService;
use crate::translator::{CommandTranslator, ConfiguredTranslator, HttpTranslator, Passthrough};

#[derive(Debug, Parser)]
#[command(name = "fwintentd")]
struct Args {
    #[arg(long, env = "FWINTENT_SOCKET", default_value = "/tmp/fwintentd.sock")]
    socket_path: String,

    #[arg(long, env = "FWINTENT_AUDIT", default_value = "./fwintentd-audit.jsonl")]
    audit_path: String,

    /// Firewall host reached over ssh.
    #[arg(long, env = "FWINTENT_HOST", default_value = "192.168.1.101")]
    host: String,

    #[arg(long, env = "FWINTENT_SSH_PORT", default_value_t = 22)]
    ssh_port: u16,

    #[arg(long, env = "FWINTENT_SSH_USER", default_value = "root")]
    ssh_user: String,

    #[arg(long, env = "FWINTENT_SSH_IDENTITY")]
    ssh_identity: Option<String>,

    /// Run store and reload commands through a local shell instead of ssh.
    #[arg(long, env = "FWINTENT_LOCAL")]
    local: bool,

    #[arg(long, env = "FWINTENT_CONNECT_TIMEOUT_SEC", default_value_t = 10)]
    connect_timeout_sec: u64,

    #[arg(long, env = "FWINTENT_EXEC_TIMEOUT_SEC", default_value_t = 10)]
    exec_timeout_sec: u64,

    #[arg(long, env = "FWINTENT_STORE_HELPER", default_value = "fwctl store --path /conf/fwintent-rules.json")]
    store_helper: String,

    #[arg(long, env = "FWINTENT_RELOAD_COMMAND", default_value = "configctl filter reload")]
    reload_command: String,

    /// Generate endpoint of the language model, e.g. http://127.0.0.1:11434/api/generate.
    #[arg(long, env = "FWINTENT_MODEL_URL")]
    model_url: Option<String>,

    #[arg(long, env = "FWINTENT_MODEL", default_value = "gemma3:12b")]
    model: String,

    /// Program that turns request text into a model response, used instead of the endpoint.
    /// With neither set, request text is treated as the model response.
    #[arg(long, env = "FWINTENT_TRANSLATOR")]
    translator: Option<String>,

    #[arg(long, env = "FWINTENT_TRANSLATOR_TIMEOUT_SEC", default_value_t = 60)]
    translator_timeout_sec: u64,

    #[arg(long, env = "FWINTENT_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_target(false)
        .with_level(true)
        .compact()
        .init();

    let exec_timeout = Duration::from_secs(args.exec_timeout_sec);
    let transport = if args.local {
        Transport::Local(LocalChannel { exec_timeout })
    } else {
        Transport::Ssh(SshChannel {
            host: args.host.clone(),
            port: args.ssh_port,
            user: args.ssh_user.clone(),
            identity: args.ssh_identity.clone(),
            connect_timeout: Duration::from_secs(args.connect_timeout_sec),
            exec_timeout,
        })
    };
    let executor = RemoteExecutor::new(transport, args.store_helper.as_str(), args.reload_command.as_str());

    let translator_timeout = Duration::from_secs(args.translator_timeout_sec);
    let argv: Vec<String> = args
        .translator
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let translator = if !argv.is_empty() {
        ConfiguredTranslator::Command(CommandTranslator::new(argv, translator_timeout))
    } else if let Some(url) = args.model_url.as_deref().filter(|u| !u.trim().is_empty()) {
        ConfiguredTranslator::Http(HttpTranslator::new(url.trim(), args.model.as_str(), translator_timeout)?)
    } else {
        ConfiguredTranslator::Passthrough(Passthrough)
    };
    let translator_kind = match &translator {
        ConfiguredTranslator::Passthrough(_) => "passthrough",
        ConfiguredTranslator::Http(_) => "http",
        ConfiguredTranslator::Command(_) => "command",
    };

    info!(
        host = %args.host,
        local = args.local,
        translator = translator_kind,
        model = %args.model,
        "fwintentd starting"
    );

    let service = Arc::new(CommandService::new(executor, translator));
    server::run(&args.socket_path, &args.audit_path, service).await
}
