use std::fmt;

/// An SMTP reply: a three digit code and one or more lines of text.
///
/// Multi-line replies use `<code>-` on every line but the last, which uses
/// `<code> ` (RFC 5321 section 4.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline<I, S>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            lines.push(String::new());
        }
        Self { code, lines }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    #[cfg(test)]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn greeting(fqdn: &str) -> Self {
        Self::new(220, format!("{} ESMTP", fqdn))
    }

    pub fn unrecognised() -> Self {
        Self::new(502, "5.5.2 Command not recognised")
    }

    pub fn timeout() -> Self {
        Self::new(421, "Timeout")
    }

    /// Bytes as they go on the wire, CRLF included.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}
