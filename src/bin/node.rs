//! ETB Node Daemon
//!
//! Runs one bus node: loads configuration and rule files, registers
//! wrapper manifests, starts the engine and serves the XML-RPC surface
//! until interrupted.
//!
//! ```bash
//! etb-node --port 26532 --rule-files rules/base.etb
//! etb-node --conf /etc/etb.toml --log /var/log/etb.log
//! ```

use anyhow::Context;
use clap::Parser;
use etb::{Config, Node};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "etb-node", version, about = "Evidential tool bus node")]
struct Args {
    /// Listen address.
    #[arg(long)]
    host: Option<String>,

    /// Listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file (defaults: ~/.etb.toml, then ./etb.toml).
    #[arg(long)]
    conf: Option<PathBuf>,

    /// Log file; stderr when omitted.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Directory of external wrapper manifests.
    #[arg(long)]
    wrappers_dir: Option<PathBuf>,

    /// Rule files loaded as permanent rules at startup.
    #[arg(long = "rule-files", num_args = 1..)]
    rule_files: Vec<PathBuf>,
}

impl Args {
    /// Command-line arguments override file and environment settings.
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.node.host = host;
        }
        if let Some(port) = self.port {
            config.node.port = port;
        }
        if let Some(log) = self.log {
            config.node.log = Some(log);
        }
        if let Some(dir) = self.wrappers_dir {
            config.node.wrappers_dir = Some(dir);
        }
        if !self.rule_files.is_empty() {
            config.node.rule_files = self.rule_files;
        }
    }
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    match &config.node.log {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().map_or_else(
                || "etb.log".to_string(),
                |n| n.to_string_lossy().into_owned(),
            );
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.conf {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load().context("loading configuration")?,
    };
    args.apply(&mut config);

    let _log_guard = init_tracing(&config);

    let node = Node::init(config).context("starting node")?;
    let serving = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { etb::rpc::server::serve(node).await })
    };

    tokio::select! {
        result = serving => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            node.shutdown();
        }
    }
    Ok(())
}
