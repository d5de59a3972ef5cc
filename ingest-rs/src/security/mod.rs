//! Transport security
//!
//! - [`tls`]: STARTTLS configuration for inbound sessions

pub mod tls;

pub use tls::TlsConfig;
