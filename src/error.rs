use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong inside one SMTP session.
///
/// None of these ever leave the session: protocol-level variants turn into a
/// reply on the wire, the others end the session quietly.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no line received within {0:?}")]
    Timeout(Duration),

    #[error("peer did not take a reply within {0:?}")]
    WriteTimeout(Duration),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("handler for {verb} failed: {reason}")]
    Handler { verb: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SessionError::Handler {
            verb: "RCPT".into(),
            reason: "oops".into(),
        };
        assert_eq!(err.to_string(), "handler for RCPT failed: oops");
        assert_eq!(
            SessionError::WriteTimeout(Duration::from_secs(5)).to_string(),
            "peer did not take a reply within 5s"
        );
    }
}
