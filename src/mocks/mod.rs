//! Mock implementations for testing.
//!
//! [`MockServer`] is shared state standing in for a remote server: it counts
//! sessions, records what was delivered and can be told to misbehave.
//! [`MockConnectionFactory`] opens [`MockTransport`] sessions against it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{ConnectPhase, SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::transport::{next_session_id, Connection, ConnectionFactory, SmtpTransport};

/// A step of the protocol transaction that a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// `MAIL FROM`.
    Mail,
    /// `RCPT TO`.
    Rcpt,
    /// `DATA`.
    Data,
    /// Message payload and terminator.
    Payload,
    /// `RSET`.
    Rset,
    /// `NOOP`.
    Noop,
    /// `QUIT`.
    Quit,
    /// `EHLO`, `HELO`, `STARTTLS` or `AUTH`.
    Other,
}

impl Step {
    fn of(command: &SmtpCommand) -> Self {
        match command {
            SmtpCommand::MailFrom(_) => Step::Mail,
            SmtpCommand::RcptTo(_) => Step::Rcpt,
            SmtpCommand::Data => Step::Data,
            SmtpCommand::Rset => Step::Rset,
            SmtpCommand::Noop => Step::Noop,
            SmtpCommand::Quit => Step::Quit,
            _ => Step::Other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Reply(u16),
    Drop,
}

/// A message the server accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Session that carried it.
    pub session: u64,
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients in RCPT order.
    pub recipients: Vec<String>,
    /// Composed message as handed to the transport.
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct ServerState {
    create_calls: usize,
    created: usize,
    open: usize,
    quits: usize,
    fail_creation_at: Option<usize>,
    fail_all_creations: bool,
    generation: u64,
    sessions: HashMap<u64, u64>,
    rejected: HashSet<String>,
    faults: HashMap<Step, VecDeque<Fault>>,
    delivered: Vec<DeliveredMessage>,
    commands: Vec<(&'static str, String)>,
    payload_delay: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Shared state of a simulated server.
#[derive(Debug, Default)]
pub struct MockServer {
    state: Mutex<ServerState>,
}

impl MockServer {
    /// Creates a server that accepts everything.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the `k`-th session creation (1-based) fail.
    pub fn fail_creation_at(&self, k: usize) {
        self.state().fail_creation_at = Some(k);
    }

    /// Makes every session creation fail while set.
    pub fn fail_all_creations(&self, fail: bool) {
        self.state().fail_all_creations = fail;
    }

    /// Kills every session opened so far; later commands on them fail.
    pub fn kill_existing(&self) {
        self.state().generation += 1;
    }

    /// Rejects `RCPT TO` for the given mailbox with 550.
    pub fn reject_recipient(&self, mailbox: impl Into<String>) {
        self.state().rejected.insert(mailbox.into());
    }

    /// Replies `code` to the next `times` occurrences of `step`.
    pub fn fail_next(&self, step: Step, code: u16, times: usize) {
        let mut state = self.state();
        let queue = state.faults.entry(step).or_default();
        queue.extend(std::iter::repeat(Fault::Reply(code)).take(times));
    }

    /// Drops the session at the next occurrence of `step`.
    pub fn drop_at(&self, step: Step) {
        self.state().faults.entry(step).or_default().push_back(Fault::Drop);
    }

    /// Delays each accepted payload, holding the session busy.
    pub fn set_payload_delay(&self, delay: Duration) {
        self.state().payload_delay = Some(delay);
    }

    /// Number of create calls, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    /// Number of sessions successfully opened.
    pub fn created_count(&self) -> usize {
        self.state().created
    }

    /// Number of sessions not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.state().open
    }

    /// Number of QUIT commands answered.
    pub fn quit_count(&self) -> usize {
        self.state().quits
    }

    /// Returns true if the session exists and was not killed.
    pub fn is_alive(&self, session: u64) -> bool {
        let state = self.state();
        state.sessions.get(&session) == Some(&state.generation)
    }

    /// Messages accepted so far, in acceptance order.
    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.state().delivered.clone()
    }

    /// Transaction commands seen so far, as sent on the wire.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Number of times a command with the given verb was seen.
    pub fn command_count(&self, verb: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|(v, _)| *v == verb)
            .count()
    }

    /// Highest number of payloads in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    fn open_session(&self) -> SmtpResult<u64> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.fail_all_creations || state.fail_creation_at == Some(state.create_calls) {
            return Err(SmtpError::connect(
                SmtpErrorKind::ConnectionRefused,
                ConnectPhase::Dial,
                "connection refused",
            ));
        }
        let id = next_session_id();
        let generation = state.generation;
        state.sessions.insert(id, generation);
        state.created += 1;
        state.open += 1;
        Ok(id)
    }

    fn close_session(&self, session: u64) {
        let mut state = self.state();
        state.sessions.remove(&session);
        state.open = state.open.saturating_sub(1);
    }

    fn check_alive(&self, session: u64) -> SmtpResult<()> {
        if self.is_alive(session) {
            Ok(())
        } else {
            Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "connection closed by peer",
            ))
        }
    }

    fn take_fault(&self, session: u64, step: Step) -> SmtpResult<Option<u16>> {
        let mut state = self.state();
        let fault = state.faults.get_mut(&step).and_then(VecDeque::pop_front);
        match fault {
            Some(Fault::Reply(code)) => Ok(Some(code)),
            Some(Fault::Drop) => {
                state.sessions.insert(session, u64::MAX);
                Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    "connection reset during transaction",
                ))
            }
            None => Ok(None),
        }
    }
}

/// Session against a [`MockServer`].
#[derive(Debug)]
pub struct MockTransport {
    id: u64,
    server: Arc<MockServer>,
    from: Option<String>,
    recipients: Vec<String>,
    data_open: bool,
}

impl MockTransport {
    /// Opens a session, honoring the server's creation faults.
    pub fn open(server: Arc<MockServer>) -> SmtpResult<Self> {
        let id = server.open_session()?;
        Ok(Self {
            id,
            server,
            from: None,
            recipients: Vec::new(),
            data_open: false,
        })
    }

    fn reset(&mut self) {
        self.from = None;
        self.recipients.clear();
        self.data_open = false;
    }

    fn reply(&mut self, command: &SmtpCommand) -> SmtpResponse {
        match command {
            SmtpCommand::MailFrom(from) => {
                self.reset();
                self.from = Some(from.clone());
                SmtpResponse::new(codes::OK, "sender ok")
            }
            SmtpCommand::RcptTo(to) => {
                if self.server.state().rejected.contains(to) {
                    SmtpResponse::new(550, "mailbox unavailable")
                } else if self.from.is_none() {
                    SmtpResponse::new(503, "need MAIL command")
                } else {
                    self.recipients.push(to.clone());
                    SmtpResponse::new(codes::OK, "recipient ok")
                }
            }
            SmtpCommand::Data => {
                if self.recipients.is_empty() {
                    SmtpResponse::new(503, "need RCPT command")
                } else {
                    self.data_open = true;
                    SmtpResponse::new(codes::START_MAIL_INPUT, "end data with <CR><LF>.<CR><LF>")
                }
            }
            SmtpCommand::Rset => {
                self.reset();
                SmtpResponse::new(codes::OK, "reset")
            }
            SmtpCommand::Quit => {
                self.server.state().quits += 1;
                SmtpResponse::new(codes::SERVICE_CLOSING, "bye")
            }
            SmtpCommand::StartTls => SmtpResponse::new(codes::SERVICE_READY, "ready"),
            SmtpCommand::Auth { .. } => SmtpResponse::new(codes::AUTH_SUCCESS, "authenticated"),
            SmtpCommand::Ehlo(_) | SmtpCommand::Helo(_) | SmtpCommand::Noop => {
                SmtpResponse::new(codes::OK, "ok")
            }
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.server.close_session(self.id);
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.server.check_alive(self.id)?;

        let step = Step::of(command);
        if !matches!(step, Step::Noop | Step::Quit) {
            self.server
                .state()
                .commands
                .push((command.verb(), command.to_string()));
        }

        if let Some(code) = self.server.take_fault(self.id, step)? {
            return Ok(SmtpResponse::new(code, "injected failure"));
        }
        Ok(self.reply(command))
    }

    async fn send_data(&mut self, message: &[u8]) -> SmtpResult<SmtpResponse> {
        self.server.check_alive(self.id)?;
        if !self.data_open {
            return Ok(SmtpResponse::new(503, "DATA not started"));
        }
        self.data_open = false;

        let delay = {
            let mut state = self.server.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.payload_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.server.state().in_flight -= 1;

        if let Some(code) = self.server.take_fault(self.id, Step::Payload)? {
            self.reset();
            return Ok(SmtpResponse::new(code, "injected failure"));
        }

        let delivered = DeliveredMessage {
            session: self.id,
            from: self.from.take().unwrap_or_default(),
            recipients: std::mem::take(&mut self.recipients),
            data: message.to_vec(),
        };
        self.server.state().delivered.push(delivered);
        Ok(SmtpResponse::new(codes::OK, "queued"))
    }

    fn is_tls(&self) -> bool {
        false
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Factory opening [`MockTransport`] sessions.
#[derive(Debug, Clone)]
pub struct MockConnectionFactory {
    server: Arc<MockServer>,
}

impl MockConnectionFactory {
    /// Creates a factory with a fresh server.
    pub fn new() -> Self {
        Self::with_server(MockServer::new())
    }

    /// Creates a factory for an existing server.
    pub fn with_server(server: Arc<MockServer>) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<MockServer> {
        &self.server
    }
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(&self) -> SmtpResult<Connection> {
        let transport = MockTransport::open(Arc::clone(&self.server))?;
        Ok(Box::new(transport))
    }
}
