// ABOUTME: provides a user-facing cli for sending firewall intents to fwintentd and managing the rule file.
// ABOUTME: prints deterministic json responses returned by the daemon or the store.

use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use fwintent_common::FileRuleStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use fwctl::{extract_verdict, rules_request, run_store, voice_request, StoreCommand};

#[derive(Debug, Parser)]
#[command(name = "fwctl")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a natural-language request to the daemon.
    Send {
        #[arg(long, default_value = "/tmp/fwintentd.sock")]
        socket_path: String,

        #[arg(long)]
        request_id: Option<String>,

        #[arg(long)]
        text: Option<String>,

        #[arg(long)]
        file: Option<String>,
    },
    /// List every rule on the firewall host through the daemon.
    Rules {
        #[arg(long, default_value = "/tmp/fwintentd.sock")]
        socket_path: String,

        #[arg(long)]
        request_id: Option<String>,
    },
    /// Check a model response locally without touching the firewall.
    Extract {
        #[arg(long)]
        text: Option<String>,

        #[arg(long)]
        file: Option<String>,
    },
    /// Operate on the rule store file; runs on the firewall host.
    Store {
        #[arg(long)]
        path: String,

        #[command(subcommand)]
        op: StoreCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Send {
            socket_path,
            request_id,
            text,
            file,
        } => {
            let text = read_input(file.as_deref(), text.as_deref()).await?;
            let request_id = request_id.unwrap_or_else(default_request_id);
            let request = voice_request(&request_id, text.trim())?;
            let response = send(&socket_path, &request).await?;
            print!("{response}");
        }
        Command::Rules {
            socket_path,
            request_id,
        } => {
            let request_id = request_id.unwrap_or_else(default_request_id);
            let request = rules_request(&request_id)?;
            let response = send(&socket_path, &request).await?;
            print!("{response}");
        }
        Command::Extract { text, file } => {
            let input = read_input(file.as_deref(), text.as_deref()).await?;
            let verdict = extract_verdict(&input);
            print!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Command::Store { path, op } => {
            let store = FileRuleStore::new(path);
            println!("{}", run_store(&store, &op)?);
        }
    }

    Ok(())
}

fn default_request_id() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("req-cli-{now_ms}")
}

async fn read_input(file: Option<&str>, text: Option<&str>) -> anyhow::Result<String> {
    if let Some(text) = text {
        return Ok(text.to_string());
    }

    if let Some(file) = file {
        return Ok(tokio::fs::read_to_string(file).await?);
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}

async fn send(socket_path: &str, input: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(input.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}
