//! Inbound SMTP
//!
//! - [`server`]: listener, port probing and graceful shutdown
//! - [`session`]: per-connection command loop and DATA handling
//! - [`auth`]: `AUTH LOGIN` state machine
//! - [`context`]: per-session state handed to the pipeline
//! - [`commands`]: SMTP command parsing

pub mod auth;
pub mod commands;
pub mod context;
pub mod server;
pub mod session;

pub use auth::{AuthMachine, AuthReply, AuthState};
pub use commands::SmtpCommand;
pub use context::SessionContext;
pub use server::SmtpServer;
pub use session::{SessionSettings, SmtpSession};
