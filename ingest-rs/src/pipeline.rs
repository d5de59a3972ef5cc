//! Message pipeline
//!
//! Runs once per completed `DATA` transaction, strictly in order:
//!
//! 1. read the `X-API-Key` header (missing → `"none"`)
//! 2. check it against the [`CredentialStore`]; unknown keys are dropped
//! 3. persist the raw message ([`MailStore`])
//! 4. append a [`LogRecord`] to the [`DeliveryLog`]
//! 5. relay upstream when enabled ([`RelayForwarder`])
//!
//! Only a failure in step 3 fails the transaction. A log failure is reported
//! but the stored message stands; a relay failure is logged and otherwise
//! ignored.

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{GatewayError, Result};
use crate::message::{InboundMessage, MISSING_API_KEY};
use crate::relay::RelayForwarder;
use crate::smtp::context::SessionContext;
use crate::storage::{DeliveryLog, LogRecord, MailStore};
use chrono::Local;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Disabled,
    Relayed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Missing or unknown API key; nothing was stored
    Dropped { api_key: String },
    Accepted {
        /// Name of the stored message file
        mail_id: String,
        logged: bool,
        relay: RelayStatus,
    },
}

pub struct MessagePipeline {
    credentials: Arc<CredentialStore>,
    mail_store: MailStore,
    delivery_log: DeliveryLog,
    relay: Option<RelayForwarder>,
}

impl MessagePipeline {
    pub fn new(
        credentials: Arc<CredentialStore>,
        mail_store: MailStore,
        delivery_log: DeliveryLog,
        relay: Option<RelayForwarder>,
    ) -> Self {
        Self {
            credentials,
            mail_store,
            delivery_log,
            relay,
        }
    }

    pub fn from_config(config: &Config, credentials: Arc<CredentialStore>) -> Self {
        let relay = config
            .relay
            .enabled
            .then(|| RelayForwarder::new(config.relay.clone()));

        Self::new(
            credentials,
            MailStore::new(&config.storage.mail_dir),
            DeliveryLog::new(&config.storage.log_dir),
            relay,
        )
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay.is_some()
    }

    pub async fn process(
        &self,
        ctx: &SessionContext,
        message: &InboundMessage,
    ) -> Result<PipelineOutcome> {
        if !ctx.is_authenticated() {
            return Err(GatewayError::AuthenticationRequired);
        }

        let summary = message.summary();
        let api_key = summary
            .api_key
            .clone()
            .unwrap_or_else(|| MISSING_API_KEY.to_string());

        if let Err(e) = self.credentials.authorize(&api_key) {
            warn!("Dropping message: {}", e);
            return Ok(PipelineOutcome::Dropped { api_key });
        }

        let mail_id = self.mail_store.store(&message.data).await.map_err(|e| {
            error!("Failed to persist message: {}", e);
            e
        })?;

        let record = LogRecord {
            timestamp: Local::now(),
            api_key: api_key.clone(),
            from: summary.from.unwrap_or_else(|| message.sender.clone()),
            to: if summary.to.is_empty() {
                message.recipients.clone()
            } else {
                summary.to
            },
            subject: summary.subject.unwrap_or_default(),
        };

        let logged = match self.delivery_log.append(&record).await {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to log message {}: {}", mail_id, e);
                false
            }
        };

        let relay = match &self.relay {
            None => RelayStatus::Disabled,
            Some(forwarder) => match forwarder.forward(message).await {
                Ok(()) => {
                    info!("Email relayed successfully: {}", record.subject);
                    RelayStatus::Relayed
                }
                Err(e) => {
                    warn!("Failed to relay email {}: {}", mail_id, e);
                    RelayStatus::Failed(e.to_string())
                }
            },
        };

        info!("Email processed and saved: {} (API key {})", mail_id, api_key);
        Ok(PipelineOutcome::Accepted {
            mail_id,
            logged,
            relay,
        })
    }
}
