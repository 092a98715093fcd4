use crate::error::SessionError;
use crate::reply::Reply;
use crate::session::SessionState;

use std::collections::BTreeMap;

/// What the session does after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write the reply and read the next command.
    Reply(Reply),
    /// Write the reply and switch to reading the message body.
    StartData(Reply),
    /// Write the reply and close the connection.
    Close(Reply),
}

/// Everything a handler may look at or change.
pub struct Context<'a> {
    pub state: &'a mut SessionState,
    pub registry: &'a CommandRegistry,
}

/// Handlers get the text after the verb, already stripped of its line ending.
/// Faults are reported through the `Err` side; a panic takes down the whole
/// session task, though other sessions keep running.
pub type Handler = fn(&mut Context<'_>, &str) -> Result<Action, SessionError>;

#[derive(Clone)]
pub struct Command {
    pub verb: String,
    pub handler: Handler,
    pub help: Option<&'static str>,
}

/// Verb table shared read-only by every session.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The verbs the sink answers to.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("HELO", helo, Some("Syntax: HELO hostname"));
        registry.register("EHLO", ehlo, Some("Syntax: EHLO hostname"));
        registry.register("MAIL", mail, Some("Syntax: MAIL FROM:<address>"));
        registry.register("RCPT", rcpt, Some("Syntax: RCPT TO:<address>"));
        registry.register("DATA", data, Some("Syntax: DATA"));
        registry.register("STARTTLS", starttls, None);
        registry.register("NOOP", noop, Some("Syntax: NOOP"));
        registry.register("RSET", rset, Some("Syntax: RSET"));
        registry.register("VRFY", vrfy, Some("Syntax: VRFY address"));
        registry.register("ETRN", etrn, Some("Syntax: ETRN domain"));
        registry.register("QUIT", quit, Some("Syntax: QUIT"));
        registry.register("HELP", help, Some("Syntax: HELP [verb]"));
        registry
    }

    /// Adds or replaces `verb`. Verbs are stored upper-cased.
    pub fn register(&mut self, verb: &str, handler: Handler, help: Option<&'static str>) {
        let verb = verb.to_ascii_uppercase();
        self.commands.insert(
            verb.clone(),
            Command {
                verb,
                handler,
                help,
            },
        );
    }

    pub fn lookup(&self, verb: &str) -> Option<&Command> {
        self.commands.get(&verb.to_ascii_uppercase())
    }

    /// Verbs with help text, in alphabetical order.
    pub fn helpable_verbs(&self) -> Vec<&str> {
        self.commands
            .values()
            .filter(|c| c.help.is_some())
            .map(|c| c.verb.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

const EHLO_EXTENSIONS: [&str; 8] = [
    "HELP",
    "PIPELINING",
    "SIZE 512000",
    "VRFY",
    "ETRN",
    "ENHANCEDSTATUSCODES",
    "8BITMIME",
    "DSN",
];

fn helo(ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(250, ctx.state.fqdn.clone())))
}

fn ehlo(ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    let lines = std::iter::once(ctx.state.fqdn.clone())
        .chain(EHLO_EXTENSIONS.iter().map(|ext| ext.to_string()));
    Ok(Action::Reply(Reply::multiline(250, lines)))
}

fn mail(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(250, "2.1.0 OK")))
}

fn rcpt(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(250, "2.1.5 OK")))
}

fn data(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::StartData(Reply::new(
        354,
        "End data with <CR><LF>.<CR><LF>",
    )))
}

// TLS upgrade is not offered: the sink only ever talks in the clear or over
// an implicit TLS listener.
fn starttls(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(500, "Not implemented")))
}

fn noop(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(250, "2.0.0 OK")))
}

fn rset(ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    ctx.state.renew_message_id();
    Ok(Action::Reply(Reply::new(250, "2.0.0 OK")))
}

fn vrfy(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(252, "2.0.0 Cannot VRFY user")))
}

fn etrn(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Reply(Reply::new(250, "Queueing started")))
}

fn quit(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
    Ok(Action::Close(Reply::new(221, "2.0.0 Goodbye")))
}

fn help(ctx: &mut Context<'_>, arg: &str) -> Result<Action, SessionError> {
    let topic = arg.trim();
    let listing = format!(
        "Supported commands: {}",
        ctx.registry.helpable_verbs().join(" ")
    );
    if topic.is_empty() {
        return Ok(Action::Reply(Reply::new(250, listing)));
    }
    match ctx.registry.lookup(topic).and_then(|c| c.help) {
        Some(text) => Ok(Action::Reply(Reply::new(250, text))),
        None => Ok(Action::Reply(Reply::new(501, listing))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state() -> SessionState {
        SessionState::new("127.0.0.1:4000".into(), "sink.test".into(), StdRng::seed_from_u64(9))
    }

    fn dispatch(registry: &CommandRegistry, state: &mut SessionState, line: &str) -> Action {
        let (verb, arg) = line.split_once(' ').unwrap_or((line, ""));
        let command = registry.lookup(verb).expect("verb not registered");
        let mut ctx = Context { state, registry };
        (command.handler)(&mut ctx, arg).unwrap()
    }

    fn reply_of(action: Action) -> String {
        match action {
            Action::Reply(r) | Action::StartData(r) | Action::Close(r) => r.to_wire(),
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = CommandRegistry::standard();
        assert!(registry.lookup("helo").is_some());
        assert!(registry.lookup("HeLo").is_some());
        assert!(registry.lookup("BDAT").is_none());
        assert_eq!(registry.len(), 12);
        assert!(!registry.is_empty());
        assert!(CommandRegistry::new().is_empty());
    }

    #[test]
    fn test_helpable_verbs_sorted_without_starttls() {
        let registry = CommandRegistry::standard();
        assert_eq!(
            registry.helpable_verbs(),
            vec!["DATA", "EHLO", "ETRN", "HELO", "HELP", "MAIL", "NOOP", "QUIT", "RCPT", "RSET", "VRFY"]
        );
    }

    #[test]
    fn test_fixed_replies_ignore_arguments() {
        let registry = CommandRegistry::standard();
        let mut state = state();
        assert_eq!(reply_of(dispatch(&registry, &mut state, "HELO client.test")), "250 sink.test\r\n");
        assert_eq!(
            reply_of(dispatch(&registry, &mut state, "MAIL FROM:<evil@x>")),
            "250 2.1.0 OK\r\n"
        );
        assert_eq!(reply_of(dispatch(&registry, &mut state, "RCPT TO:<a@b>")), "250 2.1.5 OK\r\n");
        assert_eq!(reply_of(dispatch(&registry, &mut state, "VRFY root")), "252 2.0.0 Cannot VRFY user\r\n");
        assert_eq!(reply_of(dispatch(&registry, &mut state, "ETRN sink.test")), "250 Queueing started\r\n");
        assert_eq!(reply_of(dispatch(&registry, &mut state, "STARTTLS")), "500 Not implemented\r\n");
    }

    #[test]
    fn test_ehlo_lists_extensions() {
        let registry = CommandRegistry::standard();
        let mut state = state();
        match dispatch(&registry, &mut state, "EHLO client.test") {
            Action::Reply(reply) => {
                assert_eq!(reply.lines().len(), 9);
                assert_eq!(reply.lines()[0], "sink.test");
                assert_eq!(reply.lines()[8], "DSN");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transitions() {
        let registry = CommandRegistry::standard();
        let mut state = state();
        assert!(matches!(dispatch(&registry, &mut state, "DATA"), Action::StartData(_)));
        assert_eq!(
            dispatch(&registry, &mut state, "QUIT"),
            Action::Close(Reply::new(221, "2.0.0 Goodbye"))
        );
    }

    #[test]
    fn test_rset_renews_message_id_and_noop_does_not() {
        let registry = CommandRegistry::standard();
        let mut state = state();
        let first = state.message_id.clone();
        dispatch(&registry, &mut state, "NOOP");
        dispatch(&registry, &mut state, "NOOP");
        assert_eq!(state.message_id, first);
        dispatch(&registry, &mut state, "RSET");
        assert_ne!(state.message_id, first);
        assert!(!state.message_id.is_empty());
    }

    #[test]
    fn test_help() {
        let registry = CommandRegistry::standard();
        let mut state = state();
        assert!(reply_of(dispatch(&registry, &mut state, "HELP"))
            .starts_with("250 Supported commands: DATA EHLO"));
        assert_eq!(
            reply_of(dispatch(&registry, &mut state, "HELP mail")),
            "250 Syntax: MAIL FROM:<address>\r\n"
        );
        assert!(reply_of(dispatch(&registry, &mut state, "HELP STARTTLS"))
            .starts_with("501 Supported commands:"));
        assert!(reply_of(dispatch(&registry, &mut state, "HELP BOGUS"))
            .starts_with("501 Supported commands:"));
    }

    #[test]
    fn test_register_adds_verb() {
        fn xclient(_ctx: &mut Context<'_>, _arg: &str) -> Result<Action, SessionError> {
            Ok(Action::Reply(Reply::new(250, "ok")))
        }
        let mut registry = CommandRegistry::standard();
        registry.register("xclient", xclient, Some("Syntax: XCLIENT"));
        assert!(registry.lookup("XCLIENT").is_some());
        assert!(registry.helpable_verbs().contains(&"XCLIENT"));
    }
}
