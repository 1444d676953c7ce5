use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reworse::config::{DEFAULT_PORT, DEFAULT_SOCKET_DIR};
use reworse::{ExchangePolicy, Filter, ListenerConfig, ProxyError, ProxyOptions, RequestLog, TlsCert};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Local intercepting HTTP/HTTPS forward proxy.
#[derive(Parser, Debug)]
#[command(name = "reworse", version, about)]
struct Cli {
    /// External port clients connect to
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the local relay sockets
    #[arg(long, default_value = DEFAULT_SOCKET_DIR)]
    socket_dir: PathBuf,

    /// PEM private key used for TLS termination
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// PEM certificate chain used for TLS termination
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Report every transport error, including routine ones
    #[arg(short, long)]
    verbose: bool,

    /// Verify origin server certificates against the webpki roots
    #[arg(long)]
    verify_upstream: bool,

    /// Give up on an origin that has not answered within this many seconds
    #[arg(long)]
    upstream_timeout_secs: Option<u64>,

    /// Log each exchange at info level
    #[arg(long)]
    log_requests: bool,
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let options = match options_from(&cli) {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            std::process::exit(255);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(serve(options, cli.log_requests)) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn options_from(cli: &Cli) -> reworse::Result<ProxyOptions> {
    let tls_cert = match (&cli.tls_key, &cli.tls_cert) {
        (Some(key), Some(cert)) => Some(TlsCert::from_files(key, cert)?),
        _ => None,
    };
    Ok(ProxyOptions {
        port: cli.port,
        listener: ListenerConfig {
            tls_cert,
            socket_dir: cli.socket_dir.clone(),
            ..ListenerConfig::default()
        },
        verbose: cli.verbose,
        accept_invalid_upstream_certs: !cli.verify_upstream,
        exchange_policy: ExchangePolicy {
            upstream_timeout: cli.upstream_timeout_secs.map(Duration::from_secs),
        },
    })
}

async fn serve(options: ProxyOptions, log_requests: bool) -> Result<(), ProxyError> {
    let mut filters: Vec<Arc<dyn Filter>> = Vec::new();
    if log_requests {
        filters.push(Arc::new(RequestLog));
    }
    let running = reworse::run(options, filters, None).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    running.close().await;
    Ok(())
}
