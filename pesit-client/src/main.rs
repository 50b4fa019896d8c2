//! PeSIT command-line client: send and receive files, deliver messages,
//! probe a partner.

mod config;
mod transfer;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pesit_core::SessionError;
use tracing_subscriber::EnvFilter;

use crate::transfer::Client;

#[derive(Parser)]
#[command(name = "pesit-client", version, about = "PeSIT file transfer client")]
struct Cli {
    /// Path to the configuration file (default ./pesit-client.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Partner host, overriding the configuration
    #[arg(long)]
    host: Option<String>,
    /// Partner port, overriding the configuration
    #[arg(long)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a local file to the partner
    Send {
        file: PathBuf,
        /// Virtual filename announced to the partner (defaults to the local name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 1)]
        transfer_id: u64,
    },
    /// Receive a virtual file from the partner
    Receive {
        name: String,
        /// Local destination (defaults to the virtual filename)
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        transfer_id: u64,
    },
    /// Deliver a free-form message
    Message {
        text: String,
        /// Message reference name
        #[arg(long, default_value = "MESSAGE")]
        name: String,
    },
    /// Check that the partner accepts a session
    Test,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    let client = Client::new(cfg);

    match cli.command {
        Command::Send {
            file,
            name,
            transfer_id,
        } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("FILE")
                    .to_string(),
            };
            let report = client
                .send_file(&data, &name, transfer_id)
                .map_err(rendered)?;
            println!(
                "sent {name}: {} bytes in {:.2?}",
                report.bytes, report.duration
            );
        }
        Command::Receive {
            name,
            output,
            transfer_id,
        } => {
            let (data, report) = client.receive_file(&name, transfer_id).map_err(rendered)?;
            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            std::fs::write(&output, &data)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!(
                "received {}: {} bytes in {:.2?}",
                output.display(),
                report.bytes,
                report.duration
            );
        }
        Command::Message { text, name } => {
            let report = client.send_message(&name, &text).map_err(rendered)?;
            println!(
                "message delivered: {} bytes in {:.2?}",
                report.bytes, report.duration
            );
        }
        Command::Test => {
            let report = client.probe().map_err(rendered)?;
            println!(
                "{}:{} answered in {:.2?}",
                client.config().host,
                client.config().port,
                report.duration
            );
        }
    }
    Ok(())
}

/// Keep the partner's free-text next to the diagnostic when it sent one.
fn rendered(err: SessionError) -> anyhow::Error {
    match &err {
        SessionError::Rejected {
            diag,
            text: Some(text),
            ..
        } => anyhow::anyhow!("{diag}: {text}"),
        _ => anyhow::Error::new(err),
    }
}
