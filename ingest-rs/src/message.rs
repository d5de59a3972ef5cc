//! Inbound message representation
//!
//! A message is the envelope collected by the SMTP session plus the raw
//! bytes received after `DATA`. Headers are only parsed on demand; the
//! raw bytes are what gets stored and relayed.

use mail_parser::{Address, MessageParser};

/// Header carrying the caller's API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Used in place of a missing `X-API-Key` header; never a configured key
pub const MISSING_API_KEY: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Envelope sender from `MAIL FROM` (may be empty for `<>`)
    pub sender: String,
    /// Envelope recipients from `RCPT TO`, in the order received
    pub recipients: Vec<String>,
    /// Headers and body exactly as received
    pub data: Vec<u8>,
}

/// The header fields the pipeline cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSummary {
    pub api_key: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: Option<String>,
}

impl InboundMessage {
    pub fn new(sender: String, recipients: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            sender,
            recipients,
            data,
        }
    }

    /// Parse the headers the pipeline reads. Header names match case-insensitively.
    pub fn summary(&self) -> MessageSummary {
        let Some(parsed) = MessageParser::default().parse_headers(&self.data[..]) else {
            return MessageSummary::default();
        };

        let api_key = parsed
            .headers()
            .iter()
            .find(|header| header.name().eq_ignore_ascii_case(API_KEY_HEADER))
            .and_then(|header| header.value().as_text())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let from = parsed
            .from()
            .and_then(Address::first)
            .and_then(|addr| addr.address())
            .map(str::to_string);

        let to = parsed
            .to()
            .map(|addresses| {
                addresses
                    .iter()
                    .filter_map(|addr| addr.address())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        MessageSummary {
            api_key,
            from,
            to,
            subject: parsed.subject().map(str::to_string),
        }
    }

    /// The `X-API-Key` value, or [`MISSING_API_KEY`] when the header is absent
    pub fn api_key(&self) -> String {
        self.summary()
            .api_key
            .unwrap_or_else(|| MISSING_API_KEY.to_string())
    }
}
