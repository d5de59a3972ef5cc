use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::pipeline::{MessagePipeline, PipelineOutcome, RelayStatus};
use crate::security::TlsConfig;
use crate::smtp::auth::{decode_response, AuthMachine, AuthReply};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::context::SessionContext;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 100;

/// Maximum command line length (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Timeout for reading a command line or an AUTH response
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for reading DATA content
const DATA_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Plain or TLS connection, so STARTTLS can swap the transport mid-session
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder while the handshake owns the TcpStream
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

fn upgrading_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "I/O attempted during STARTTLS upgrade",
    )
}

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

/// Outcome of [`read_bounded_line`]
#[derive(Debug, PartialEq)]
enum LineRead {
    Eof,
    Line,
    /// Longer than the limit; the rest of the line has been discarded
    TooLong,
}

enum SessionResult {
    /// Restart command processing on the upgraded stream
    Continue,
    Quit,
}

/// Settings shared by every session of a listener
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_size: usize,
    pub require_tls_for_auth: bool,
    pub reject_unknown_api_key: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.smtp.hostname.clone(),
            max_message_size: config.smtp.max_message_size,
            require_tls_for_auth: config.smtp.require_tls_for_auth,
            reject_unknown_api_key: config.smtp.reject_unknown_api_key,
        }
    }
}

/// Drives one inbound connection
///
/// Only authenticated clients may start a mail transaction. `AUTH` is
/// delegated to the [`AuthMachine`]; a completed `DATA` transaction is handed
/// to the [`MessagePipeline`].
pub struct SmtpSession {
    state: SmtpState,
    ctx: SessionContext,
    auth: AuthMachine,
    settings: Arc<SessionSettings>,
    pipeline: Arc<MessagePipeline>,
    tls_config: Option<Arc<TlsConfig>>,
    error_count: usize,
}

impl SmtpSession {
    pub fn new(
        settings: Arc<SessionSettings>,
        pipeline: Arc<MessagePipeline>,
        tls_config: Option<Arc<TlsConfig>>,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            ctx: SessionContext::new(),
            auth: AuthMachine::new(),
            settings,
            pipeline,
            tls_config,
            error_count: 0,
        }
    }

    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        if let Ok(peer_addr) = stream.peer_addr() {
            debug!("Client address: {}", peer_addr);
        }

        let mut smtp_stream = SmtpStream::Plain(stream);

        reply(
            &mut smtp_stream,
            &format!("220 {} ESMTP Service Ready\r\n", self.settings.hostname),
        )
        .await?;

        loop {
            match self.process_commands(&mut smtp_stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        let mut buf_reader = BufReader::new(&mut *stream);
        let mut line = Vec::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                reply(&mut buf_reader, "421 Too many errors, closing connection\r\n").await?;
                return Ok(SessionResult::Quit);
            }

            let read = match timeout(
                COMMAND_TIMEOUT,
                read_bounded_line(&mut buf_reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    error!("IO error reading line: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Command timeout, disconnecting");
                    reply(&mut buf_reader, "421 Timeout, closing connection\r\n").await?;
                    return Ok(SessionResult::Quit);
                }
            };

            match read {
                LineRead::Eof => {
                    debug!("Client disconnected");
                    return Ok(SessionResult::Quit);
                }
                LineRead::TooLong => {
                    error!("Line longer than {} bytes", MAX_LINE_LENGTH);
                    reply(&mut buf_reader, "500 Line too long\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
                LineRead::Line => {}
            }

            let Ok(text) = std::str::from_utf8(&line) else {
                warn!("Command is not valid UTF-8");
                reply(
                    &mut buf_reader,
                    "500 5.5.2 Syntax error, invalid characters\r\n",
                )
                .await?;
                self.error_count += 1;
                continue;
            };

            let line_trimmed = text.trim_end();
            debug!("Received: {}", line_trimmed);

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(e) => {
                    error!("Command parse error: {}", e);
                    reply(&mut buf_reader, "501 Syntax error in parameters or arguments\r\n")
                        .await?;
                    self.error_count += 1;
                    continue;
                }
            };

            match cmd {
                SmtpCommand::Starttls => {
                    drop(buf_reader);

                    if self.handle_starttls_upgrade(stream).await? {
                        info!("STARTTLS upgrade completed, restarting session");
                        return Ok(SessionResult::Continue);
                    }
                    buf_reader = BufReader::new(&mut *stream);
                }
                SmtpCommand::Auth {
                    mechanism,
                    initial_response,
                } => {
                    self.handle_auth(mechanism, initial_response, &mut buf_reader)
                        .await?;
                }
                cmd => {
                    let response = self.handle_command(cmd);
                    reply(&mut buf_reader, &response).await?;

                    if response.starts_with("221") {
                        return Ok(SessionResult::Quit);
                    }

                    if self.state == SmtpState::Data {
                        let response = self.receive_data(&mut buf_reader).await?;
                        reply(&mut buf_reader, &response).await?;
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (&self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("HELO from {}", domain);
                self.ctx.set_helo_domain(domain.clone());
                self.ctx.reset_transaction();
                self.state = SmtpState::Greeted;
                format!("250 {} Hello {}\r\n", self.settings.hostname, domain)
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {}", domain);
                self.ctx.set_helo_domain(domain.clone());
                self.ctx.reset_transaction();
                self.state = SmtpState::Greeted;
                self.ehlo_response(&domain)
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom(from)) => {
                if !self.ctx.is_authenticated() {
                    warn!("MAIL FROM rejected: authentication required");
                    return "530 5.7.0 Authentication required\r\n".to_string();
                }

                info!("MAIL FROM: {}", from);
                self.ctx.start_transaction(from);
                self.state = SmtpState::MailFrom;
                "250 OK\r\n".to_string()
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                if self.ctx.recipients().len() >= MAX_RECIPIENTS {
                    warn!("Too many recipients: {}", self.ctx.recipients().len());
                    return format!("452 Too many recipients (max {})\r\n", MAX_RECIPIENTS);
                }

                info!("RCPT TO: {}", to);
                self.ctx.add_recipient(to);
                self.state = SmtpState::RcptTo;
                "250 OK\r\n".to_string()
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                debug!("DATA command received");
                self.state = SmtpState::Data;
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (_, SmtpCommand::Rset) => {
                self.ctx.reset_transaction();
                if self.state != SmtpState::Fresh {
                    self.state = SmtpState::Greeted;
                }
                "250 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 OK\r\n".to_string(),
            (_, SmtpCommand::Quit) => {
                info!("QUIT command");
                format!("221 {} closing connection\r\n", self.settings.hostname)
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                warn!("Unknown command: {}", cmd);
                self.error_count += 1;
                "502 Command not implemented\r\n".to_string()
            }
            _ => {
                warn!("Invalid command sequence");
                self.error_count += 1;
                "503 Bad sequence of commands\r\n".to_string()
            }
        }
    }

    fn ehlo_response(&self, domain: &str) -> String {
        let mut response = format!("250-{} Hello {}\r\n", self.settings.hostname, domain);

        if self.tls_config.is_some() && !self.ctx.tls_active() {
            response.push_str("250-STARTTLS\r\n");
        }

        response.push_str(&format!("250-SIZE {}\r\n", self.settings.max_message_size));

        if self.auth_allowed() {
            response.push_str("250-AUTH LOGIN\r\n");
        }

        response.push_str("250 HELP\r\n");
        response
    }

    fn auth_allowed(&self) -> bool {
        !self.settings.require_tls_for_auth || self.ctx.tls_active()
    }

    /// Run the `AUTH LOGIN` exchange until the machine stops challenging
    async fn handle_auth<S>(
        &mut self,
        mechanism: Option<String>,
        initial_response: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.auth_allowed() {
            reply(buf_reader, "538 5.7.11 Encryption required for requested authentication mechanism\r\n").await?;
            return Ok(());
        }

        if !matches!(self.state, SmtpState::Greeted) {
            reply(buf_reader, "503 Bad sequence of commands\r\n").await?;
            self.error_count += 1;
            return Ok(());
        }

        let initial_username = match initial_response.as_deref().map(decode_response) {
            None => None,
            Some(Ok(username)) => Some(username),
            Some(Err(e)) => {
                warn!("AUTH initial response rejected: {}", e);
                reply(buf_reader, &AuthReply::MalformedResponse.to_response()).await?;
                self.error_count += 1;
                return Ok(());
            }
        };

        let mut auth_reply = self.auth.begin(mechanism.as_deref(), initial_username);

        while auth_reply.is_challenge() {
            reply(buf_reader, &auth_reply.to_response()).await?;

            let mut line = Vec::new();
            let read = timeout(
                COMMAND_TIMEOUT,
                read_bounded_line(buf_reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            .map_err(|_| GatewayError::SmtpProtocol("AUTH timeout".to_string()))??;

            let text = match read {
                LineRead::Eof => {
                    return Err(GatewayError::SmtpProtocol(
                        "Connection closed during AUTH".to_string(),
                    ));
                }
                LineRead::TooLong => None,
                LineRead::Line => std::str::from_utf8(&line).ok().map(str::trim),
            };

            auth_reply = match text {
                None => {
                    warn!("AUTH response is too long or not valid UTF-8");
                    self.auth.cancel(AuthReply::MalformedResponse)
                }
                Some("*") => self.auth.cancel(AuthReply::Cancelled),
                Some(text) => match decode_response(text) {
                    Ok(value) => {
                        self.auth
                            .respond(value, self.pipeline.credentials(), &mut self.ctx)
                    }
                    Err(e) => {
                        warn!("AUTH response rejected: {}", e);
                        self.auth.cancel(AuthReply::MalformedResponse)
                    }
                },
            };
        }

        if !matches!(auth_reply, AuthReply::Success) {
            self.error_count += 1;
        }
        reply(buf_reader, &auth_reply.to_response()).await
    }

    /// Read the message body and run it through the pipeline
    ///
    /// Returns the final reply for the transaction.
    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = Vec::new();
        let mut too_large = false;

        loop {
            // Room for the terminator and one stuffed dot even when the budget is spent
            let limit = self
                .settings
                .max_message_size
                .saturating_sub(self.ctx.data_len())
                + 3;

            let read = match timeout(DATA_TIMEOUT, read_bounded_line(buf_reader, &mut line, limit))
                .await
            {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    error!("IO error during DATA: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("DATA timeout");
                    return Err(GatewayError::SmtpProtocol("Timeout during DATA".to_string()));
                }
            };

            match read {
                LineRead::Eof => {
                    return Err(GatewayError::SmtpProtocol(
                        "Connection closed during DATA".to_string(),
                    ));
                }
                LineRead::TooLong => {
                    if !too_large {
                        warn!(
                            "Message exceeds {} bytes, discarding",
                            self.settings.max_message_size
                        );
                    }
                    too_large = true;
                    continue;
                }
                LineRead::Line => {}
            }

            if line == b".\r\n" || line == b".\n" {
                debug!("End of DATA received, total size: {} bytes", self.ctx.data_len());
                break;
            }

            if too_large {
                continue;
            }

            // Dot-stuffing (RFC 5321 §4.5.2)
            let chunk = if line.starts_with(b"..") { &line[1..] } else { &line[..] };

            if self.ctx.data_len() + chunk.len() > self.settings.max_message_size {
                warn!("Message exceeds {} bytes, discarding", self.settings.max_message_size);
                too_large = true;
                continue;
            }

            self.ctx.append_data(chunk);
        }

        self.state = SmtpState::Greeted;

        if too_large {
            self.ctx.reset_transaction();
            return Ok(format!(
                "552 Message exceeds fixed maximum message size ({} bytes)\r\n",
                self.settings.max_message_size
            ));
        }

        let message = self.ctx.take_message();
        if message.data.is_empty() {
            warn!("Empty message received");
            return Ok("554 Empty message\r\n".to_string());
        }

        let response = match self.pipeline.process(&self.ctx, &message).await {
            Ok(PipelineOutcome::Accepted { mail_id, relay, .. }) => {
                if let RelayStatus::Failed(reason) = relay {
                    debug!("Accepted {} despite relay failure: {}", mail_id, reason);
                }
                "250 OK: Message accepted\r\n".to_string()
            }
            Ok(PipelineOutcome::Dropped { .. }) if self.settings.reject_unknown_api_key => {
                "550 5.7.1 Missing or unknown API key\r\n".to_string()
            }
            // Unknown keys are dropped without telling the client
            Ok(PipelineOutcome::Dropped { .. }) => "250 OK: Message accepted\r\n".to_string(),
            Err(e) => {
                error!("Message processing failed: {}", e);
                "451 Requested action aborted: local error in processing\r\n".to_string()
            }
        };

        Ok(response)
    }

    /// Returns `Ok(true)` when the stream has been replaced by a TLS stream
    async fn handle_starttls_upgrade(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        let tls_config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                reply(stream, "502 STARTTLS not available\r\n").await?;
                return Ok(false);
            }
        };

        if self.ctx.tls_active() {
            reply(stream, "503 Already using TLS\r\n").await?;
            return Ok(false);
        }

        if self.state != SmtpState::Greeted {
            reply(stream, "503 Bad sequence of commands\r\n").await?;
            return Ok(false);
        }

        reply(stream, "220 Ready to start TLS\r\n").await?;

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(GatewayError::SmtpProtocol(
                    "Stream is not a plain connection".to_string(),
                ));
            }
        };

        let tls_stream = tls_config.acceptor().accept(tcp_stream).await.map_err(|e| {
            error!("TLS handshake failed: {}", e);
            GatewayError::Tls(format!("TLS handshake failed: {}", e))
        })?;

        *stream = SmtpStream::Tls(Box::new(tls_stream));

        // Client must EHLO again (RFC 3207)
        self.ctx.enable_tls();
        self.auth = AuthMachine::new();
        self.state = SmtpState::Fresh;

        Ok(true)
    }
}

/// Read one line of at most `limit` bytes (newline included) into `buf`
///
/// Never buffers more than `limit + 1` bytes of a line; an over-long line is
/// drained through its newline and reported as [`LineRead::TooLong`].
async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let cap = limit as u64 + 1;

    buf.clear();
    let n = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if n <= limit {
        return Ok(LineRead::Line);
    }

    // Over the limit: skip to the end of the line without keeping it
    while !buf.ends_with(b"\n") {
        buf.clear();
        if (&mut *reader).take(cap).read_until(b'\n', buf).await? == 0 {
            break;
        }
    }
    buf.clear();
    Ok(LineRead::TooLong)
}

async fn reply<W>(writer: &mut W, response: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_bounded_line_within_limit() {
        let mut reader = BufReader::new(&b"NOOP\r\nQUIT\r\n"[..]);
        let mut buf = Vec::new();

        let read = read_bounded_line(&mut reader, &mut buf, 16).await.unwrap();
        assert_eq!(read, LineRead::Line);
        assert_eq!(buf, b"NOOP\r\n");

        let read = read_bounded_line(&mut reader, &mut buf, 16).await.unwrap();
        assert_eq!(read, LineRead::Line);
        assert_eq!(buf, b"QUIT\r\n");

        let read = read_bounded_line(&mut reader, &mut buf, 16).await.unwrap();
        assert_eq!(read, LineRead::Eof);
    }

    #[tokio::test]
    async fn test_read_bounded_line_discards_long_line() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let mut reader = BufReader::new(&input[..]);
        let mut buf = Vec::new();

        let read = read_bounded_line(&mut reader, &mut buf, 10).await.unwrap();
        assert_eq!(read, LineRead::TooLong);
        assert!(buf.len() <= 11);

        // The next line is intact
        let read = read_bounded_line(&mut reader, &mut buf, 10).await.unwrap();
        assert_eq!(read, LineRead::Line);
        assert_eq!(buf, b"NOOP\r\n");
    }

    #[tokio::test]
    async fn test_read_bounded_line_limit_includes_newline() {
        let mut reader = BufReader::new(&b"abcd\r\n"[..]);
        let mut buf = Vec::new();

        let read = read_bounded_line(&mut reader, &mut buf, 5).await.unwrap();
        assert_eq!(read, LineRead::TooLong);
    }

    #[tokio::test]
    async fn test_read_bounded_line_unterminated_overflow() {
        let input = vec![b'x'; 64];
        let mut reader = BufReader::new(&input[..]);
        let mut buf = Vec::new();

        let read = read_bounded_line(&mut reader, &mut buf, 8).await.unwrap();
        assert_eq!(read, LineRead::TooLong);
        let read = read_bounded_line(&mut reader, &mut buf, 8).await.unwrap();
        assert_eq!(read, LineRead::Eof);
    }
}
