//! ingest-rs: authenticated SMTP ingestion gateway
//!
//! Accepts mail from clients that authenticate with `AUTH LOGIN`, checks the
//! `X-API-Key` header of every message against the configured keys, stores
//! the raw message, appends a line to a day-partitioned delivery log and,
//! when enabled, relays the message to an upstream provider over STARTTLS.
//!
//! # Example
//!
//! ```no_run
//! use ingest_rs::config::Config;
//! use ingest_rs::smtp::SmtpServer;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (config, _) = Config::load_or_create("config.toml")?;
//!
//!     let server = SmtpServer::bind(&config).await?;
//!     server.run(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`credentials`]: API key and login lookup
//! - [`error`]: Error types and handling
//! - [`message`]: Inbound message and header extraction
//! - [`pipeline`]: verify, persist, log and relay
//! - [`relay`]: Upstream SMTP forwarding
//! - [`security`]: Inbound TLS
//! - [`smtp`]: SMTP protocol implementation
//! - [`storage`]: Mail store and delivery log

pub mod config;
pub mod credentials;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod relay;
pub mod security;
pub mod smtp;
pub mod storage;

pub use config::Config;
pub use error::{GatewayError, Result};
