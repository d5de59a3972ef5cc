//! SMTP `AUTH LOGIN` state machine
//!
//! The machine performs no I/O. The session feeds it the `AUTH` arguments and
//! each decoded client response, and writes back whatever [`AuthReply`] it
//! returns. Base64 framing lives in [`AuthReply::to_response`] and
//! [`decode_response`].
//!
//! ```text
//! Idle --AUTH LOGIN--> AwaitingUsername --user--> AwaitingPassword --pass--> Authenticated
//!                                                                    \-----> Rejected
//! ```
//!
//! `Rejected` is not a lockout: a new `AUTH` starts over from `Idle`.

use crate::credentials::CredentialStore;
use crate::error::{GatewayError, Result};
use crate::smtp::context::SessionContext;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, info, warn};

pub const USERNAME_PROMPT: &str = "Username:";
pub const PASSWORD_PROMPT: &str = "Password:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    AwaitingUsername,
    AwaitingPassword { username: String },
    Authenticated,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReply {
    /// 334 with a base64 encoded prompt
    Challenge(&'static str),
    Success,
    Failed,
    /// `AUTH` without a mechanism
    SyntaxError,
    UnsupportedMechanism,
    AlreadyAuthenticated,
    /// Client sent `*` to abort the exchange
    Cancelled,
    /// Client response was not valid base64
    MalformedResponse,
    /// A response arrived while no challenge was outstanding
    BadSequence,
}

impl AuthReply {
    pub fn code(&self) -> u16 {
        match self {
            Self::Challenge(_) => 334,
            Self::Success => 235,
            Self::Failed => 535,
            Self::SyntaxError => 502,
            Self::UnsupportedMechanism => 504,
            Self::AlreadyAuthenticated | Self::BadSequence => 503,
            Self::Cancelled | Self::MalformedResponse => 501,
        }
    }

    pub fn is_challenge(&self) -> bool {
        matches!(self, Self::Challenge(_))
    }

    /// Render the reply as a CRLF terminated SMTP response line
    pub fn to_response(&self) -> String {
        match self {
            Self::Challenge(prompt) => format!("334 {}\r\n", BASE64.encode(prompt)),
            Self::Success => "235 2.7.0 Authentication successful\r\n".to_string(),
            Self::Failed => "535 5.7.8 Authentication failed\r\n".to_string(),
            Self::SyntaxError => "502 5.5.2 AUTH command error. Syntax: AUTH LOGIN\r\n".to_string(),
            Self::UnsupportedMechanism => {
                "504 5.5.4 Only LOGIN authentication supported\r\n".to_string()
            }
            Self::AlreadyAuthenticated => "503 5.5.1 Already authenticated\r\n".to_string(),
            Self::Cancelled => "501 5.7.0 Authentication cancelled\r\n".to_string(),
            Self::MalformedResponse => "501 5.5.2 Cannot decode response\r\n".to_string(),
            Self::BadSequence => "503 5.5.1 Bad sequence of commands\r\n".to_string(),
        }
    }
}

/// Decode one base64 client response line
pub fn decode_response(line: &str) -> Result<String> {
    let decoded = BASE64
        .decode(line.trim())
        .map_err(|e| GatewayError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| GatewayError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))
}

#[derive(Debug)]
pub struct AuthMachine {
    state: AuthState,
}

impl Default for AuthMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthMachine {
    pub fn new() -> Self {
        Self {
            state: AuthState::Idle,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Whether a challenge is outstanding and the next client line is a response
    pub fn is_awaiting_response(&self) -> bool {
        matches!(
            self.state,
            AuthState::AwaitingUsername | AuthState::AwaitingPassword { .. }
        )
    }

    /// Handle `AUTH <mechanism> [initial-response]`
    ///
    /// `initial_username` is the already decoded initial response, if the
    /// client sent one.
    pub fn begin(
        &mut self,
        mechanism: Option<&str>,
        initial_username: Option<String>,
    ) -> AuthReply {
        if self.state == AuthState::Authenticated {
            return AuthReply::AlreadyAuthenticated;
        }
        self.state = AuthState::Idle;

        let Some(mechanism) = mechanism.filter(|m| !m.is_empty()) else {
            return AuthReply::SyntaxError;
        };

        if !mechanism.eq_ignore_ascii_case("LOGIN") {
            debug!("Unsupported AUTH mechanism {}", mechanism);
            return AuthReply::UnsupportedMechanism;
        }

        match initial_username {
            Some(username) => {
                self.state = AuthState::AwaitingPassword { username };
                AuthReply::Challenge(PASSWORD_PROMPT)
            }
            None => {
                self.state = AuthState::AwaitingUsername;
                AuthReply::Challenge(USERNAME_PROMPT)
            }
        }
    }

    /// Feed the decoded client response to the outstanding challenge
    pub fn respond(
        &mut self,
        value: String,
        store: &CredentialStore,
        ctx: &mut SessionContext,
    ) -> AuthReply {
        match std::mem::replace(&mut self.state, AuthState::Idle) {
            AuthState::AwaitingUsername => {
                self.state = AuthState::AwaitingPassword { username: value };
                AuthReply::Challenge(PASSWORD_PROMPT)
            }
            AuthState::AwaitingPassword { username } => {
                match store.authenticate(&username, &value) {
                    Ok(api_key) => {
                        info!("Authentication successful for {}", username);
                        ctx.mark_authenticated(api_key.to_string());
                        self.state = AuthState::Authenticated;
                        AuthReply::Success
                    }
                    Err(e) => {
                        warn!("{} for {}", e, username);
                        self.state = AuthState::Rejected;
                        AuthReply::Failed
                    }
                }
            }
            other => {
                self.state = other;
                AuthReply::BadSequence
            }
        }
    }

    /// Abort an outstanding exchange
    pub fn cancel(&mut self, reply: AuthReply) -> AuthReply {
        if self.is_awaiting_response() {
            self.state = AuthState::Idle;
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyEntry;
    use std::collections::BTreeMap;

    fn store() -> CredentialStore {
        let mut entries = BTreeMap::new();
        entries.insert(
            "abc123".to_string(),
            ApiKeyEntry {
                daily_limit: -1,
                user: "admin".to_string(),
                password: "secret".to_string(),
            },
        );
        entries.insert(
            "def456".to_string(),
            ApiKeyEntry {
                daily_limit: 100,
                user: "reports".to_string(),
                password: "pa55".to_string(),
            },
        );
        CredentialStore::new(entries).unwrap()
    }

    fn login(
        machine: &mut AuthMachine,
        ctx: &mut SessionContext,
        user: &str,
        pass: &str,
    ) -> AuthReply {
        let store = store();
        assert_eq!(
            machine.begin(Some("LOGIN"), None),
            AuthReply::Challenge(USERNAME_PROMPT)
        );
        assert_eq!(
            machine.respond(user.to_string(), &store, ctx),
            AuthReply::Challenge(PASSWORD_PROMPT)
        );
        machine.respond(pass.to_string(), &store, ctx)
    }

    #[test]
    fn test_login_success_binds_api_key() {
        for (user, pass, key) in [("admin", "secret", "abc123"), ("reports", "pa55", "def456")] {
            let mut machine = AuthMachine::new();
            let mut ctx = SessionContext::new();

            assert_eq!(login(&mut machine, &mut ctx, user, pass), AuthReply::Success);
            assert_eq!(machine.state(), &AuthState::Authenticated);
            assert!(ctx.is_authenticated());
            assert_eq!(ctx.api_key(), Some(key));
        }
    }

    #[test]
    fn test_login_failure_rejects() {
        let mut machine = AuthMachine::new();
        let mut ctx = SessionContext::new();

        assert_eq!(login(&mut machine, &mut ctx, "admin", "pa55"), AuthReply::Failed);
        assert_eq!(machine.state(), &AuthState::Rejected);
        assert!(!ctx.is_authenticated());
        assert!(ctx.api_key().is_none());
    }

    #[test]
    fn test_retry_after_rejection() {
        let mut machine = AuthMachine::new();
        let mut ctx = SessionContext::new();

        assert_eq!(login(&mut machine, &mut ctx, "admin", "wrong"), AuthReply::Failed);
        assert_eq!(login(&mut machine, &mut ctx, "admin", "secret"), AuthReply::Success);
        assert_eq!(ctx.api_key(), Some("abc123"));
    }

    #[test]
    fn test_mechanism_is_case_insensitive() {
        let mut machine = AuthMachine::new();
        assert_eq!(
            machine.begin(Some("login"), None),
            AuthReply::Challenge(USERNAME_PROMPT)
        );
        assert_eq!(machine.state(), &AuthState::AwaitingUsername);
    }

    #[test]
    fn test_missing_mechanism_is_syntax_error() {
        let mut machine = AuthMachine::new();
        assert_eq!(machine.begin(None, None), AuthReply::SyntaxError);
        assert_eq!(machine.state(), &AuthState::Idle);
        assert_eq!(AuthReply::SyntaxError.code(), 502);
    }

    #[test]
    fn test_other_mechanism_not_supported() {
        let mut machine = AuthMachine::new();
        assert_eq!(machine.begin(Some("PLAIN"), None), AuthReply::UnsupportedMechanism);
        assert_eq!(machine.state(), &AuthState::Idle);
        assert_eq!(AuthReply::UnsupportedMechanism.code(), 504);
    }

    #[test]
    fn test_initial_response_skips_username_challenge() {
        let store = store();
        let mut machine = AuthMachine::new();
        let mut ctx = SessionContext::new();

        assert_eq!(
            machine.begin(Some("LOGIN"), Some("admin".to_string())),
            AuthReply::Challenge(PASSWORD_PROMPT)
        );
        assert_eq!(
            machine.respond("secret".to_string(), &store, &mut ctx),
            AuthReply::Success
        );
    }

    #[test]
    fn test_second_auth_after_success() {
        let mut machine = AuthMachine::new();
        let mut ctx = SessionContext::new();
        login(&mut machine, &mut ctx, "admin", "secret");

        assert_eq!(
            machine.begin(Some("LOGIN"), None),
            AuthReply::AlreadyAuthenticated
        );
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let mut machine = AuthMachine::new();
        machine.begin(Some("LOGIN"), None);
        assert!(machine.is_awaiting_response());

        assert_eq!(machine.cancel(AuthReply::Cancelled), AuthReply::Cancelled);
        assert_eq!(machine.state(), &AuthState::Idle);
    }

    #[test]
    fn test_respond_without_challenge() {
        let store = store();
        let mut machine = AuthMachine::new();
        let mut ctx = SessionContext::new();
        assert_eq!(
            machine.respond("admin".to_string(), &store, &mut ctx),
            AuthReply::BadSequence
        );
        assert_eq!(machine.state(), &AuthState::Idle);
    }

    #[test]
    fn test_challenge_framing() {
        assert_eq!(
            AuthReply::Challenge(USERNAME_PROMPT).to_response(),
            "334 VXNlcm5hbWU6\r\n"
        );
        assert_eq!(
            AuthReply::Challenge(PASSWORD_PROMPT).to_response(),
            "334 UGFzc3dvcmQ6\r\n"
        );
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response("YWRtaW4=\r\n").unwrap(), "admin");
        assert!(decode_response("not base64!").is_err());
    }
}
