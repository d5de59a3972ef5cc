use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    Starttls,
    /// `AUTH [mechanism [initial-response]]`
    Auth {
        mechanism: Option<String>,
        initial_response: Option<String>,
    },
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(GatewayError::SmtpProtocol("Empty command".to_string()));
        }

        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();

        match verb.as_str() {
            "HELO" => Self::domain(&verb, args).map(SmtpCommand::Helo),
            "EHLO" => Self::domain(&verb, args).map(SmtpCommand::Ehlo),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                let mut words = args.split_whitespace();
                Ok(SmtpCommand::Auth {
                    mechanism: words.next().map(str::to_string),
                    initial_response: words.next().map(str::to_string),
                })
            }
            "MAIL" => Self::parse_path(args, "FROM:").map(SmtpCommand::MailFrom),
            "RCPT" => match Self::parse_path(args, "TO:")? {
                to if to.is_empty() => {
                    Err(GatewayError::SmtpProtocol("Empty recipient".to_string()))
                }
                to => Ok(SmtpCommand::RcptTo(to)),
            },
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            _ => Ok(SmtpCommand::Unknown(verb)),
        }
    }

    fn domain(verb: &str, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(GatewayError::SmtpProtocol(format!("{} requires domain", verb)));
        }
        Ok(args.to_string())
    }

    /// Parse `FROM:<path> [params]` / `TO:<path> [params]`, dropping any ESMTP parameters
    fn parse_path(args: &str, prefix: &str) -> Result<String> {
        let rest = match args.get(..prefix.len()) {
            Some(head) if head.eq_ignore_ascii_case(prefix) => args[prefix.len()..].trim_start(),
            _ => {
                return Err(GatewayError::SmtpProtocol(format!(
                    "Invalid syntax, expected {}<address>",
                    prefix
                )));
            }
        };

        let address = match rest.strip_prefix('<') {
            Some(inner) => inner.split('>').next().unwrap_or(""),
            None => rest.split_whitespace().next().unwrap_or(""),
        };

        Ok(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
    }

    #[test]
    fn test_parse_ehlo() {
        let cmd = SmtpCommand::parse("ehlo example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Ehlo("example.com".to_string()));
    }

    #[test]
    fn test_parse_auth_login() {
        let cmd = SmtpCommand::parse("AUTH LOGIN").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::Auth {
                mechanism: Some("LOGIN".to_string()),
                initial_response: None,
            }
        );
    }

    #[test]
    fn test_parse_auth_with_initial_response() {
        let cmd = SmtpCommand::parse("AUTH LOGIN YWRtaW4=").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::Auth {
                mechanism: Some("LOGIN".to_string()),
                initial_response: Some("YWRtaW4=".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_bare_auth() {
        let cmd = SmtpCommand::parse("AUTH").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::Auth {
                mechanism: None,
                initial_response: None,
            }
        );
    }

    #[test]
    fn test_parse_mail_from() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("sender@example.com".to_string()));
    }

    #[test]
    fn test_parse_mail_from_with_params() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com> SIZE=1024").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("sender@example.com".to_string()));
    }

    #[test]
    fn test_parse_null_sender() {
        let cmd = SmtpCommand::parse("MAIL FROM:<>").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom(String::new()));
    }

    #[test]
    fn test_parse_rcpt_to() {
        let cmd = SmtpCommand::parse("RCPT TO:<recipient@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
    }

    #[test]
    fn test_parse_invalid_mail() {
        assert!(SmtpCommand::parse("MAIL sender@example.com").is_err());
        assert!(SmtpCommand::parse("RCPT TO:<>").is_err());
    }

    #[test]
    fn test_parse_data_and_quit() {
        assert_eq!(SmtpCommand::parse("DATA").unwrap(), SmtpCommand::Data);
        assert_eq!(SmtpCommand::parse("QUIT").unwrap(), SmtpCommand::Quit);
        assert_eq!(SmtpCommand::parse("STARTTLS").unwrap(), SmtpCommand::Starttls);
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            SmtpCommand::parse("VRFY admin").unwrap(),
            SmtpCommand::Unknown("VRFY".to_string())
        );
    }
}
