//! ngtor
//!
//! Exposes a local TCP port through an ngrok tunnel reached over Tor:
//! - Dials the tunnel service through a SOCKS5 proxy (Tor, then Tor Browser)
//! - Authenticates and binds a TCP tunnel
//! - Relays every forwarded connection to 127.0.0.1:<port>

use anyhow::{Context, Result};
use clap::Parser;
use ngtor::{
    config::{generate_example_config, Config, LoggingConfig},
    transport::{Bootstrap, InsecureTlsConnector},
    Client,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long to wait for GOAWAY to be written on Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// ngtor - ngrok TCP tunnels over Tor
#[derive(Parser, Debug)]
#[command(name = "ngtor")]
#[command(about = "Expose a local TCP port through ngrok, connecting over Tor")]
#[command(version)]
struct Args {
    /// ngrok auth token
    #[arg(required_unless_present = "print_config")]
    auth_token: Option<String>,

    /// Local port to forward connections to
    #[arg(
        required_unless_present = "print_config",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    local_port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SOCKS5 proxy to try, in order (overrides config, repeatable)
    #[arg(short, long = "proxy")]
    proxies: Vec<String>,

    /// Tunnel service control endpoint (overrides config)
    #[arg(short, long)]
    remote: Option<String>,

    /// Log level or filter directive (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        print!("{}", example);
        return Ok(());
    }

    // Load configuration; no file means defaults
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    if !args.proxies.is_empty() {
        config.tunnel.proxies = args.proxies.clone();
    }
    if let Some(remote) = &args.remote {
        config.tunnel.remote = remote.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_logging(&config.logging)?;
    config.validate().context("Invalid configuration")?;

    let auth_token = args.auth_token.context("Missing <AUTH_TOKEN>")?;
    let local_port = args.local_port.context("Missing <LOCAL_PORT>")?;

    info!("ngtor v{}", ngtor::VERSION);

    let sni = config.tunnel.sni()?;
    let tls = InsecureTlsConnector::new(sni.clone())?;
    let bootstrap = Bootstrap::new(
        config.tunnel.proxies.clone(),
        config.tunnel.remote_address()?,
        tls,
    );

    info!(
        "connecting to {} ({} proxy candidates)",
        bootstrap.remote(),
        bootstrap.proxies().len()
    );
    let session = match bootstrap.connect().await {
        Ok(session) => session,
        Err(e) => {
            error!("unrecoverable: {}", e);
            return Err(e.into());
        }
    };

    warn!("note: ngrok uses a self-signed certificate which is not checked by ngtor");
    warn!("      thus traffic may be intercepted and modified at the Tor exit node");

    let mut client = Client::new(session, auth_token).with_hostname(sni);

    info!("authenticating with ngrok");
    client.authenticate().await.context("auth failed")?;

    info!("binding to port");
    let url = client.bind(local_port).await.context("bind failed")?;
    info!("listening on {} --> 127.0.0.1:{}", url, local_port);

    let upstream = format!("127.0.0.1:{}", local_port);

    // Wait for shutdown signal
    tokio::select! {
        result = client.serve(&upstream) => {
            result.context("can't accept connection")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            let session = client.session();
            session.close();
            // Give the writer a moment to deliver GOAWAY
            if tokio::time::timeout(SHUTDOWN_GRACE, session.closed()).await.is_err() {
                debug!("session did not close within {:?}", SHUTDOWN_GRACE);
            }
        }
    }

    Ok(())
}

/// Install the tracing subscriber for the configured level and format
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("Invalid log level '{}'", logging.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        "pretty" => builder.pretty().init(),
        other => {
            builder.init();
            warn!("Unknown log format '{}', using default", other);
        }
    }

    Ok(())
}
