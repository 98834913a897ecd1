use clap::Parser;
use kubic_control::config::{DaemonConfig, DEFAULT_CONFIG_FILE};
use kubic_control::logging::root_logger;
use kubic_control::{start_server, tls_config, HostRunner, Orchestrator};
use slog::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "kubicd")]
#[command(about = "Kubernetes control-plane daemon", long_about = None)]
struct Args {
    /// Configuration file; missing means built-in defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Address to listen on (default: all interfaces)
    #[arg(short, long)]
    server: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Server certificate
    #[arg(long)]
    crtfile: Option<PathBuf>,

    /// Private key of the server certificate
    #[arg(long)]
    keyfile: Option<PathBuf>,

    /// CA that client certificates must be signed by
    #[arg(long)]
    cafile: Option<PathBuf>,

    /// trace, debug, info, warn, error or critical
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, mut config: DaemonConfig) -> DaemonConfig {
        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(crt) = self.crtfile {
            config.crt_file = crt;
        }
        if let Some(key) = self.keyfile {
            config.key_file = key;
        }
        if let Some(ca) = self.cafile {
            config.ca_file = ca;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = DaemonConfig::from_file(&args.config)?;
    let config = Arc::new(args.apply(config));

    let log = root_logger("kubicd", &config.log_level);
    info!(log, "starting kubicd"; "version" => env!("CARGO_PKG_VERSION"));

    let tls = tls_config(&config)?;
    let orchestrator = Orchestrator::new(config.clone(), HostRunner::new(log.clone()).as_runner(), log.clone());
    let server = start_server(&config, orchestrator, tls, log.clone()).await?;

    info!(log, "Press Ctrl+C to shutdown gracefully");
    signal::ctrl_c().await?;

    info!(log, "shutting down");
    server.shutdown().await;
    Ok(())
}
