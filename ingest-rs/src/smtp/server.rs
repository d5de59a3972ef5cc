use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{GatewayError, Result};
use crate::pipeline::MessagePipeline;
use crate::security::TlsConfig;
use crate::smtp::session::{SessionSettings, SmtpSession};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct SmtpServer {
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    pipeline: Arc<MessagePipeline>,
    tls_config: Option<Arc<TlsConfig>>,
}

impl SmtpServer {
    /// Build every shared component from `config` and bind the listener
    pub async fn bind(config: &Config) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::new(config.api_keys.clone())?);
        if credentials.is_empty() {
            warn!("No API keys configured, every login will be rejected");
        } else {
            info!("Loaded {} API key(s)", credentials.len());
        }
        let pipeline = Arc::new(MessagePipeline::from_config(config, credentials));

        let tls_config = match (&config.smtp.tls_cert_path, &config.smtp.tls_key_path) {
            (Some(cert), Some(key)) => Some(Arc::new(TlsConfig::from_pem_files(cert, key)?)),
            _ => None,
        };

        let listener =
            bind_listener(&config.smtp.host, config.smtp.port, config.smtp.port_probe_range)
                .await?;

        Ok(Self {
            listener,
            settings: Arc::new(SessionSettings::from_config(config)),
            pipeline,
            tls_config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "SMTP server listening on {} (relay {})",
            self.local_addr()?,
            if self.pipeline.relay_enabled() { "enabled" } else { "disabled" }
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SMTP server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New SMTP connection from {}", addr);

                        let session = SmtpSession::new(
                            self.settings.clone(),
                            self.pipeline.clone(),
                            self.tls_config.clone(),
                        );

                        tokio::spawn(async move {
                            if let Err(e) = session.handle(socket).await {
                                error!("Session error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Bind `host:port`, moving up to `probe_range` ports higher while the port is taken
pub async fn bind_listener(host: &str, port: u16, probe_range: u16) -> Result<TcpListener> {
    // Port 0 lets the OS choose; nothing to probe
    let last = if port == 0 {
        0
    } else {
        port.saturating_add(probe_range)
    };

    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    warn!("Port {} in use, bound {} instead", port, candidate);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("Port {} in use", candidate);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(GatewayError::Config(format!(
        "No available ports found in range {}-{}",
        port, last
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_listener_probes_next_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match bind_listener("127.0.0.1", port, 5).await {
            Ok(listener) => {
                let bound = listener.local_addr().unwrap().port();
                assert!(bound > port && bound <= port.saturating_add(5));
            }
            // Every port in the window may be busy on a loaded machine
            Err(e) => assert!(matches!(e, GatewayError::Config(_))),
        }
    }

    #[tokio::test]
    async fn test_bind_listener_without_probe_range() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_listener("127.0.0.1", port, 0).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let mut config = Config::default();
        config.smtp.host = "127.0.0.1".to_string();
        config.smtp.port = 0;

        let server = SmtpServer::bind(&config).await.unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));

        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
