use crate::message::InboundMessage;

/// Per-connection mutable state
///
/// Owned by exactly one [`SmtpSession`](super::SmtpSession) and dropped with
/// the connection.
#[derive(Debug, Default)]
pub struct SessionContext {
    authenticated: bool,
    api_key: Option<String>,
    tls_active: bool,
    helo_domain: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    data: Vec<u8>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// API key bound by a successful `AUTH`
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn mark_authenticated(&mut self, api_key: String) {
        self.authenticated = true;
        self.api_key = Some(api_key);
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn helo_domain(&self) -> Option<&str> {
        self.helo_domain.as_deref()
    }

    pub fn set_helo_domain(&mut self, domain: String) {
        self.helo_domain = Some(domain);
    }

    /// Forget everything learnt before the TLS handshake (RFC 3207 §4.2)
    pub fn enable_tls(&mut self) {
        *self = Self {
            tls_active: true,
            ..Self::default()
        };
    }

    pub fn start_transaction(&mut self, sender: String) {
        self.sender = Some(sender);
        self.recipients.clear();
        self.data.clear();
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn add_recipient(&mut self, recipient: String) {
        self.recipients.push(recipient);
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn append_data(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Drop the envelope and buffered data, keeping authentication
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.data.clear();
    }

    /// Hand the finished transaction to the pipeline and reset for the next one
    pub fn take_message(&mut self) -> InboundMessage {
        let message = InboundMessage::new(
            self.sender.take().unwrap_or_default(),
            std::mem::take(&mut self.recipients),
            std::mem::take(&mut self.data),
        );
        self.reset_transaction();
        message
    }
}
