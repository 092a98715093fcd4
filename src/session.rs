//! One SMTP conversation, from greeting to close.
//!
//! The session owns its transport for its whole life. It only ever waits on
//! three things: reading one line, writing one reply, and the optional pause
//! before answering a finished DATA. Every read and write is bounded by the
//! configured timeout. A read timeout ends the session after a best-effort
//! `421 Timeout`; a write timeout means the peer stopped reading, so the
//! session just goes away.

use crate::commands::{Action, CommandRegistry, Context};
use crate::config::SinkConfig;
use crate::error::SessionError;
use crate::identity::new_message_id;
use crate::logging::safe_log_string;
use crate::policy;
use crate::reply::Reply;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};
use tokio::time;
use tracing::{debug, error, info, warn};

/// Longest line accepted in one piece, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const DATA_TERMINATOR: &[u8] = b".\r\n";

/// Upper bound on the farewell work after a session has ended: the `421`
/// and the transport shutdown.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Greeting,
    CommandLoop,
    DataMode,
    Closed,
}

/// Per-connection values the command handlers work on.
pub struct SessionState {
    pub peer: String,
    pub fqdn: String,
    /// Reported by the DATA success reply, renewed by RSET.
    pub message_id: String,
    rng: StdRng,
}

impl SessionState {
    pub fn new(peer: String, fqdn: String, mut rng: StdRng) -> Self {
        let message_id = new_message_id(&fqdn, &mut rng);
        Self {
            peer,
            fqdn,
            message_id,
            rng,
        }
    }

    pub fn renew_message_id(&mut self) {
        self.message_id = new_message_id(&self.fqdn, &mut self.rng);
    }
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
}

pub struct Session<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    state: SessionState,
    config: SinkConfig,
    registry: Arc<CommandRegistry>,
    phase: Phase,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        peer: String,
        fqdn: String,
        config: SinkConfig,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        Self::with_rng(stream, peer, fqdn, config, registry, StdRng::from_entropy())
    }

    /// Like [`Session::new`] with a caller supplied random source, so bounce
    /// selection and message ids can be reproduced.
    pub fn with_rng(
        stream: S,
        peer: String,
        fqdn: String,
        config: SinkConfig,
        registry: Arc<CommandRegistry>,
        rng: StdRng,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            state: SessionState::new(peer, fqdn, rng),
            config,
            registry,
            phase: Phase::Greeting,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn message_id(&self) -> &str {
        &self.state.message_id
    }

    /// Drives the conversation until the connection is closed. Nothing that
    /// goes wrong in here reaches the caller.
    pub async fn run(mut self) {
        info!(peer = %self.state.peer, id = %self.state.message_id, "Session started");

        match self.converse().await {
            Ok(()) => {}
            Err(SessionError::Timeout(after)) => {
                info!(peer = %self.state.peer, ?after, phase = ?self.phase, "Timed out");
                let _ = self.send_within(CLOSE_GRACE, &Reply::timeout()).await;
            }
            Err(SessionError::WriteTimeout(after)) => {
                info!(peer = %self.state.peer, ?after, phase = ?self.phase, "Peer stopped reading");
            }
            Err(SessionError::Disconnected) => {
                debug!(peer = %self.state.peer, phase = ?self.phase, "Peer went away");
            }
            Err(e) => {
                warn!(peer = %self.state.peer, error = %e, "Transport error");
            }
        }

        self.close().await;
        info!(peer = %self.state.peer, "Session closed");
    }

    async fn converse(&mut self) -> Result<(), SessionError> {
        let greeting = Reply::greeting(&self.state.fqdn);
        self.send(&greeting).await?;
        self.phase = Phase::CommandLoop;

        loop {
            let line = self.read_line().await?;
            match self.dispatch(line) {
                Action::Reply(reply) => self.send(&reply).await?,
                Action::StartData(reply) => {
                    self.send(&reply).await?;
                    self.phase = Phase::DataMode;
                    self.receive_data().await?;
                    self.phase = Phase::CommandLoop;
                }
                Action::Close(reply) => {
                    self.send(&reply).await?;
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&mut self, line: Line) -> Action {
        let raw = match line {
            Line::Complete(raw) => raw,
            Line::TooLong => {
                debug!(peer = %self.state.peer, "Command line too long");
                return Action::Reply(Reply::new(500, "5.5.6 Line too long"));
            }
        };
        let text = match std::str::from_utf8(strip_terminator(&raw)) {
            Ok(text) => text,
            Err(_) => {
                return self.protocol_error(
                    "",
                    SessionError::Syntax("command line is not UTF-8".into()),
                )
            }
        };
        debug!(peer = %self.state.peer, line = %safe_log_string(text), ">>");

        let (verb, arg) = split_command(text);
        let registry = Arc::clone(&self.registry);
        let command = match registry.lookup(verb) {
            Some(command) => command,
            None => return Action::Reply(Reply::unrecognised()),
        };

        let mut ctx = Context {
            state: &mut self.state,
            registry: registry.as_ref(),
        };
        match (command.handler)(&mut ctx, arg) {
            Ok(action) => action,
            Err(e) => self.protocol_error(&command.verb, e),
        }
    }

    fn protocol_error(&self, verb: &str, err: SessionError) -> Action {
        match err {
            SessionError::Syntax(reason) => {
                debug!(peer = %self.state.peer, %reason, "Syntax error");
                Action::Reply(Reply::new(501, "5.5.2 Syntax error"))
            }
            SessionError::Handler { .. } => {
                error!(peer = %self.state.peer, error = %err, "Handler failed");
                Action::Reply(Reply::unrecognised())
            }
            other => {
                let fault = SessionError::Handler {
                    verb: verb.to_string(),
                    reason: other.to_string(),
                };
                self.protocol_error(verb, fault)
            }
        }
    }

    async fn receive_data(&mut self) -> Result<(), SessionError> {
        let mut lines = 0usize;
        let mut bytes = 0usize;
        loop {
            match self.read_line().await? {
                Line::Complete(raw) if raw == DATA_TERMINATOR => break,
                Line::Complete(raw) => {
                    lines += 1;
                    bytes += raw.len();
                }
                Line::TooLong => {
                    lines += 1;
                    bytes += MAX_LINE_LEN;
                }
            }
        }

        let reply = policy::completion_response(
            self.config.mode,
            &self.state.message_id,
            &mut self.state.rng,
        );
        info!(
            peer = %self.state.peer,
            id = %self.state.message_id,
            mode = %self.config.mode,
            lines,
            bytes,
            code = reply.code(),
            "Message discarded"
        );

        if !self.config.delay.is_zero() {
            time::sleep(self.config.delay).await;
        }
        self.send(&reply).await
    }

    async fn read_line(&mut self) -> Result<Line, SessionError> {
        let limit = self.config.timeout;
        bounded(limit, SessionError::Timeout, read_bounded_line(&mut self.reader)).await
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        self.send_within(self.config.timeout, reply).await
    }

    async fn send_within(&mut self, limit: Duration, reply: &Reply) -> Result<(), SessionError> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        debug!(peer = %self.state.peer, code = reply.code(), "<<");
        let wire = reply.to_wire();
        let writer = &mut self.writer;
        bounded(limit, SessionError::WriteTimeout, async move {
            writer.write_all(wire.as_bytes()).await?;
            writer.flush().await?;
            Ok::<(), SessionError>(())
        })
        .await
    }

    async fn close(&mut self) {
        self.phase = Phase::Closed;
        let writer = &mut self.writer;
        if time::timeout(CLOSE_GRACE, writer.shutdown()).await.is_err() {
            debug!(peer = %self.state.peer, "Shutdown abandoned");
        }
    }
}

async fn bounded<T, F>(
    limit: Duration,
    elapsed: fn(Duration) -> SessionError,
    fut: F,
) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    match time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(elapsed(limit)),
    }
}

/// Reads up to and including the next LF, never buffering more than
/// [`MAX_LINE_LEN`] bytes. Longer lines are drained and reported as too long.
async fn read_bounded_line<R>(reader: &mut R) -> Result<Line, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(SessionError::Disconnected);
    }
    if buf.last() == Some(&b'\n') {
        return Ok(Line::Complete(buf));
    }
    if n < MAX_LINE_LEN {
        // EOF in the middle of a line
        return Err(SessionError::Disconnected);
    }

    loop {
        buf.clear();
        let n = (&mut *reader)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(SessionError::Disconnected);
        }
        if buf.last() == Some(&b'\n') {
            return Ok(Line::TooLong);
        }
    }
}

fn strip_terminator(raw: &[u8]) -> &[u8] {
    raw.strip_suffix(b"\r\n")
        .or_else(|| raw.strip_suffix(b"\n"))
        .unwrap_or(raw)
}

/// Splits a command line at its first space into verb and argument.
fn split_command(line: &str) -> (&str, &str) {
    line.split_once(' ').unwrap_or((line, ""))
}
