//! Tunnel relay server
//!
//! Accepts persistent control connections from tunnel clients, hands each
//! one a subdomain under the configured base domain, and forwards public
//! HTTPS traffic for `<subdomain>.<domain>` through the matching client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use portico_cert::{AcmeCertProvider, AcmeConfig, CertificateProvider};
use portico_control::{SessionHandler, TunnelRegistry};
use portico_server::{FrontEnd, FrontEndConfig, Redirector};
use portico_transport::ChannelConfig;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Public reverse-tunnel relay
#[derive(Parser, Debug)]
#[command(name = "portico-relay")]
#[command(about = "Expose local HTTP services on public subdomains", long_about = None)]
struct Args {
    /// Base domain served by this relay; tunnels become {name}.{domain}
    #[arg(long, env = "DOMAIN")]
    domain: String,

    /// Plaintext listener port (ACME challenges + HTTPS redirect)
    #[arg(long, env = "HTTP_PORT", default_value_t = 80)]
    http_port: u16,

    /// TLS listener port (control channel + public proxy traffic)
    #[arg(long, env = "HTTPS_PORT", default_value_t = 443)]
    https_port: u16,

    /// When false, serve everything in plaintext on the HTTP port (dev mode)
    #[arg(long, env = "ENABLE_HTTPS", default_value_t = true, action = ArgAction::Set)]
    enable_https: bool,

    /// Contact email passed to the ACME account
    #[arg(long, env = "LETSENCRYPT_EMAIL", default_value = "")]
    letsencrypt_email: String,

    /// Directory for ACME account credentials and issued certificates
    #[arg(long, env = "CERT_CACHE_DIR", default_value = "./certs")]
    cert_cache_dir: PathBuf,

    /// Deadline on each proxied request, e.g. "30s" or "2m"
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    request_timeout: Duration,

    /// Use the Let's Encrypt staging directory (for testing)
    #[arg(long, env = "ACME_STAGING", default_value_t = false, action = ArgAction::Set)]
    acme_staging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for TLS)
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("starting tunnel relay");
    info!("base domain: {}", args.domain);
    info!("tunnels will be: {{name}}.{}", args.domain);

    let registry = Arc::new(TunnelRegistry::new());
    let handler = Arc::new(SessionHandler::new(registry, args.domain.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut front_end_task;
    let mut redirector_task: Option<JoinHandle<Result<(), portico_server::ServerError>>> = None;

    if args.enable_https {
        let provider: Arc<dyn CertificateProvider> =
            AcmeCertProvider::bootstrap(AcmeConfig {
                contact_email: args.letsencrypt_email.clone(),
                cache_dir: args.cert_cache_dir.clone(),
                use_staging: args.acme_staging,
            })
            .await?;
        info!("certificate cache: {}", args.cert_cache_dir.display());

        let front_end = FrontEnd::bind(
            FrontEndConfig {
                bind_addr: bind_addr(args.https_port),
                domain: args.domain.clone(),
                request_timeout: args.request_timeout,
                channel: ChannelConfig::default(),
            },
            handler,
        )
        .await?
        .with_tls(&provider);

        let redirector = Redirector::bind(bind_addr(args.http_port), provider).await?;

        let rx = shutdown_rx.clone();
        front_end_task = tokio::spawn(front_end.run(rx));
        let rx = shutdown_rx.clone();
        redirector_task = Some(tokio::spawn(redirector.run(rx)));
    } else {
        warn!("HTTPS disabled; serving plaintext on port {} (dev mode)", args.http_port);

        let front_end = FrontEnd::bind(
            FrontEndConfig {
                bind_addr: bind_addr(args.http_port),
                domain: args.domain.clone(),
                request_timeout: args.request_timeout,
                channel: ChannelConfig::default(),
            },
            handler,
        )
        .await?;

        let rx = shutdown_rx.clone();
        front_end_task = tokio::spawn(front_end.run(rx));
    }

    info!("tunnel relay is running, press Ctrl+C to stop");

    // Run until a signal arrives or a listener dies
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping servers");
        }
        result = &mut front_end_task => {
            match result {
                Ok(Ok(())) => error!("front-end exited unexpectedly"),
                Ok(Err(e)) => error!("front-end error: {}", e),
                Err(e) => error!("front-end task failed: {}", e),
            }
            anyhow::bail!("front-end terminated");
        }
    }

    // Stop accepting, then give servers a bounded window to wind down
    let _ = shutdown_tx.send(true);

    let mut tasks = vec![front_end_task];
    if let Some(task) = redirector_task.take() {
        tasks.push(task);
    }
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("servers did not stop within 10s");
    }

    info!("tunnel relay stopped");
    Ok(())
}

fn bind_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            result = ctrl_c => {
                if let Err(e) = result {
                    error!("error listening for shutdown signal: {}", e);
                }
            }
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!("error listening for shutdown signal: {}", e);
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Parse durations like "30s", "2m", "500ms", or a bare number of seconds
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();

    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {}", value))?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(format!(
            "invalid duration unit '{}', expected ms, s, m, or h",
            unit
        )),
    }
}
