//! Upstream relay
//!
//! Forwards an accepted message to the configured provider: a fresh
//! connection per message, STARTTLS required before `AUTH`, one attempt, then
//! the connection is closed. All I/O is async and bounded by the configured
//! timeout so a slow upstream only holds up its own session.

use crate::config::RelayConfig;
use crate::error::{GatewayError, Result};
use crate::message::InboundMessage;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

pub struct RelayForwarder {
    config: RelayConfig,
}

impl RelayForwarder {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn upstream(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Send `message` upstream using its original envelope
    pub async fn forward(&self, message: &InboundMessage) -> Result<()> {
        let envelope = Self::envelope(message)?;
        let transport = self.transport()?;

        debug!(
            "Relaying message from {:?} to {} recipient(s) via {}",
            envelope.from(),
            envelope.to().len(),
            self.upstream()
        );

        timeout(self.timeout(), transport.send_raw(&envelope, &message.data))
            .await
            .map_err(|_| {
                GatewayError::Relay(format!(
                    "Timed out after {}s talking to {}",
                    self.config.timeout_secs,
                    self.upstream()
                ))
            })?
            .map_err(|e| GatewayError::Relay(format!("{}: {}", self.upstream(), e)))?;

        info!("Message relayed via {}", self.upstream());
        Ok(())
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|e| GatewayError::Relay(format!("Invalid relay host: {}", e)))?
            .port(self.config.port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .authentication(vec![Mechanism::Login, Mechanism::Plain])
            .timeout(Some(self.timeout()))
            .build();

        Ok(transport)
    }

    /// Envelope from the inbound `MAIL FROM` / `RCPT TO`
    fn envelope(message: &InboundMessage) -> Result<Envelope> {
        let from = if message.sender.is_empty() {
            None
        } else {
            Some(parse_address(&message.sender)?)
        };

        let to = message
            .recipients
            .iter()
            .map(|rcpt| parse_address(rcpt))
            .collect::<Result<Vec<_>>>()?;

        Envelope::new(from, to).map_err(|e| GatewayError::Relay(format!("Invalid envelope: {}", e)))
    }
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse::<Address>()
        .map_err(|e| GatewayError::Relay(format!("Invalid address '{}': {}", address, e)))
}
