use anyhow::Context;
use clap::Parser;
use ingest_rs::config::{Config, LoggingConfig};
use ingest_rs::smtp::SmtpServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ingest-rs")]
#[command(about = "Authenticated SMTP ingestion gateway", long_about = None)]
struct Cli {
    /// Configuration file, created with defaults if missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override smtp.host
    #[arg(long)]
    host: Option<String>,

    /// Override smtp.port
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, created) = Config::load_or_create(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if created {
        println!(
            "Created default {} - please update with your settings",
            cli.config.display()
        );
    }

    if let Some(host) = cli.host {
        config.smtp.host = host;
    }
    if let Some(port) = cli.port {
        config.smtp.port = port;
    }
    config.validate()?;

    init_logging(&config.logging);

    info!("Starting ingest-rs");
    info!("  Mail directory: {}", config.storage.mail_dir);
    info!("  Log directory: {}", config.storage.log_dir);
    if config.relay.enabled {
        info!("  Relay: {}:{}", config.relay.host, config.relay.port);
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            info!("Shutting down SMTP server");
            signal_token.cancel();
        }
    });

    serve(&config, shutdown).await?;
    info!("SMTP server exited successfully");

    Ok(())
}

/// Bind and run the SMTP server until `shutdown` fires
///
/// Bind and accept-loop failures are returned so the process exits non-zero.
async fn serve(config: &Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let server = SmtpServer::bind(config)
        .await
        .context("Failed to start SMTP server")?;
    let addr = server.local_addr()?;
    println!("SMTP Server running on {}", addr);
    println!("Server is ready to handle emails. Press Ctrl+C to stop.");

    server.run(shutdown).await.context("SMTP server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config(port: u16) -> Config {
        let mut config = Config::default();
        config.smtp.host = "127.0.0.1".to_string();
        config.smtp.port = port;
        config.smtp.port_probe_range = 0;
        config
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = serve(&local_config(port), CancellationToken::new()).await;
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to start SMTP server"));
    }

    #[tokio::test]
    async fn test_serve_returns_ok_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve(&local_config(0), shutdown),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
