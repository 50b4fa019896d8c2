//! PeSIT server daemon: TCP or TLS listener, one thread per accepted
//! connection, local-directory file store. All wire logic lives in
//! `pesit-core`; this binary only wires config, storage and sockets
//! together.

mod config;
mod store;

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pesit_core::store::LogTracker;
use pesit_core::transport::server_tls_config;
use pesit_core::{
    SessionContext, SessionHandler, TcpTransportChannel, TlsServerChannel, TransportChannel,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::store::{ConfigPartnerDirectory, DirStore};

#[derive(Parser)]
#[command(name = "pesit-server", version, about = "PeSIT file transfer server")]
struct Cli {
    /// Path to the configuration file (default ./pesit-server.toml if present)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

type Handler = SessionHandler<DirStore, ConfigPartnerDirectory, LogTracker>;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;
    run(cfg)
}

fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let store = DirStore::new(cfg.store_root.clone())
        .with_context(|| format!("cannot use store root {}", cfg.store_root.display()))?;
    let handler: Arc<Handler> = Arc::new(SessionHandler::new(
        store,
        ConfigPartnerDirectory::new(cfg.partners.clone()),
        LogTracker,
    ));
    let tls = match &cfg.tls {
        Some(settings) => Some(
            server_tls_config(&settings.cert, &settings.key)
                .context("loading TLS certificate")?,
        ),
        None => None,
    };

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .with_context(|| format!("cannot bind port {}", cfg.port))?;
    info!(
        port = cfg.port,
        server_id = %cfg.server_id,
        secure = tls.is_some(),
        store = %cfg.store_root.display(),
        "listening"
    );

    let active = Arc::new(AtomicUsize::new(0));
    let read_timeout = Duration::from_millis(cfg.read_timeout_ms);
    loop {
        let (sock, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "accept failed");
                continue;
            }
        };
        if active.load(Ordering::SeqCst) >= cfg.max_connections {
            warn!(remote = %addr, max = cfg.max_connections, "connection limit reached, dropping");
            continue;
        }
        active.fetch_add(1, Ordering::SeqCst);

        let handler = handler.clone();
        let active = active.clone();
        let tls = tls.clone();
        let server_id = cfg.server_id.clone();
        std::thread::spawn(move || {
            let remote = addr.to_string();
            let channel = match tls {
                Some(config) => TlsServerChannel::accept(sock, config)
                    .map(|c| Box::new(c) as Box<dyn TransportChannel>),
                None => TcpTransportChannel::accepted(sock)
                    .map(|c| Box::new(c) as Box<dyn TransportChannel>),
            };
            match channel {
                Ok(mut channel) => {
                    if let Err(err) = channel.set_receive_timeout(read_timeout) {
                        warn!(remote = %remote, error = %err, "cannot set read timeout");
                    }
                    let mut ctx = SessionContext::new(&remote, &server_id);
                    if let Err(err) = handler.run_session(&mut ctx, channel.as_mut()) {
                        error!(session = %ctx.session_id, error = %err, "session failed");
                    }
                    let _ = channel.close();
                }
                Err(err) => {
                    warn!(remote = %remote, error = %err, "connection setup failed");
                }
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
