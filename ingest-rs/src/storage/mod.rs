//! Message and log storage
//!
//! Both stores are plain directories shared by every session:
//! - [`mail_store`]: one `.eml` file per accepted message, never overwritten
//! - [`delivery_log`]: one pipe-delimited text file per calendar day

pub mod delivery_log;
pub mod mail_store;

pub use delivery_log::{DeliveryLog, LogRecord};
pub use mail_store::MailStore;
