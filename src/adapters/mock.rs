//! Scripted in-memory instrument.
//!
//! `MockAdapter` answers commands from a response table and records every
//! write and timeout change, so protocol code can be exercised without
//! hardware. A `MockHandle` keeps access to that record after the adapter has
//! been moved into a `Transport`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ends_line, Framing, Link, LinkProvider, OpenError};
use crate::config::{LinkConfig, TransportKind};
use crate::error::{DiscoveryError, TransportError};

#[derive(Debug, Default)]
struct MockState {
    persistent: HashMap<String, Vec<u8>>,
    once: HashMap<String, VecDeque<Vec<u8>>>,
    rx: VecDeque<u8>,
    written: Vec<String>,
    raw_written: Vec<Vec<u8>>,
    timeout: Duration,
    timeout_history: Vec<Duration>,
    read_terminator: String,
    write_terminator: String,
    closed: bool,
}

impl MockState {
    fn respond_to(&mut self, command: &str) {
        let reply = match self.once.get_mut(command).and_then(VecDeque::pop_front) {
            Some(reply) => Some(reply),
            None => self.persistent.get(command).cloned(),
        };
        if let Some(reply) = reply {
            self.rx.extend(reply);
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock link with scripted replies.
pub struct MockAdapter {
    resource: String,
    framing: Framing,
    reply_terminator: String,
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Mock with the given framing and a 50 ms timeout.
    pub fn new(resource: &str, framing: Framing) -> Self {
        let state = MockState {
            timeout: Duration::from_millis(50),
            read_terminator: "\n".to_string(),
            write_terminator: "\n".to_string(),
            ..MockState::default()
        };
        Self {
            resource: resource.to_string(),
            framing,
            reply_terminator: match framing {
                Framing::Manual => "\r\n".to_string(),
                Framing::Builtin => "\n".to_string(),
            },
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Mock serial port (manual framing, replies end in `"\r\n"`).
    pub fn serial(resource: &str) -> Self {
        Self::new(resource, Framing::Manual)
    }

    /// Mock bus resource (built-in framing).
    pub fn bus(resource: &str) -> Self {
        Self::new(resource, Framing::Builtin)
    }

    /// Answer `command` with `reply` every time it is received.
    pub fn with_response(self, command: &str, reply: impl Into<Vec<u8>>) -> Self {
        lock(&self.state)
            .persistent
            .insert(command.to_string(), reply.into());
        self
    }

    /// Answer `command` with `reply` once; queued one-shot replies take
    /// precedence over the persistent one.
    pub fn with_response_once(self, command: &str, reply: impl Into<Vec<u8>>) -> Self {
        lock(&self.state)
            .once
            .entry(command.to_string())
            .or_default()
            .push_back(reply.into());
        self
    }

    /// Answer `command` with a text line followed by the reply terminator.
    pub fn with_line(self, command: &str, line: &str) -> Self {
        let reply = format!("{}{}", line, self.reply_terminator);
        self.with_response(command, reply)
    }

    /// Answer `*IDN?` with `identity`.
    pub fn with_identity(self, identity: &str) -> Self {
        self.with_line("*IDN?", identity)
    }

    /// Initial timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        lock(&self.state).timeout = timeout;
        self
    }

    /// Handle for inspecting the mock after it has been boxed.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Link for MockAdapter {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn configure_terminators(&mut self, read: &str, write: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.read_terminator = read.to_string();
        state.write_terminator = write.to_string();
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8_lossy(bytes);
        let command = text.trim_end_matches(['\r', '\n']).to_string();
        state.raw_written.push(bytes.to_vec());
        state.written.push(command.clone());
        state.respond_to(&command);
        Ok(())
    }

    fn read_message(&mut self, terminator: &[u8]) -> Result<Vec<u8>, TransportError> {
        let framing = self.framing;
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let timeout = state.timeout;
        let pending: Vec<u8> = state.rx.iter().copied().collect();
        match framing {
            Framing::Manual => {
                let end =
                    (1..=pending.len()).find(|&end| ends_line(&pending[..end], terminator));
                match end {
                    Some(end) => Ok(state.rx.drain(..end).collect()),
                    None => {
                        state.rx.clear();
                        Err(TransportError::Timeout(timeout))
                    }
                }
            }
            Framing::Builtin => {
                if pending.is_empty() {
                    return Err(TransportError::Timeout(timeout));
                }
                let read_terminator = state.read_terminator.clone().into_bytes();
                let end = pending
                    .windows(read_terminator.len().max(1))
                    .position(|w| w == read_terminator.as_slice())
                    .map_or(pending.len(), |pos| pos + read_terminator.len());
                let mut message: Vec<u8> = state.rx.drain(..end).collect();
                if message.ends_with(&read_terminator) {
                    message.truncate(message.len() - read_terminator.len());
                }
                Ok(message)
            }
        }
    }

    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let count = n.min(state.rx.len());
        Ok(state.rx.drain(..count).collect())
    }

    fn timeout(&self) -> Duration {
        lock(&self.state).timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.timeout = timeout;
        state.timeout_history.push(timeout);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

/// Shared view of a `MockAdapter`'s recorded traffic.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Commands received, terminators removed.
    pub fn written(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    /// Raw bytes of every write, terminators included.
    pub fn raw_written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).raw_written.clone()
    }

    /// Every timeout set through the link, in order.
    pub fn timeout_history(&self) -> Vec<Duration> {
        lock(&self.state).timeout_history.clone()
    }

    /// Current timeout.
    pub fn timeout(&self) -> Duration {
        lock(&self.state).timeout
    }

    /// Terminators handed to the link as `(read, write)`.
    pub fn terminators(&self) -> (String, String) {
        let state = lock(&self.state);
        (state.read_terminator.clone(), state.write_terminator.clone())
    }

    /// True once the link has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Inject unsolicited bytes into the receive buffer.
    pub fn push_rx(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes.iter().copied());
    }

    /// Replace the persistent reply to `command`.
    pub fn set_response(&self, command: &str, reply: impl Into<Vec<u8>>) {
        lock(&self.state)
            .persistent
            .insert(command.to_string(), reply.into());
    }
}

#[derive(Default)]
struct MockSlot {
    adapter: Option<MockAdapter>,
    busy_for: u32,
    fail_for: u32,
    attempts: u32,
}

/// Discovery source backed by mock adapters.
pub struct MockProvider {
    kind: TransportKind,
    order: Vec<String>,
    slots: RefCell<HashMap<String, MockSlot>>,
}

impl MockProvider {
    /// Provider with no candidates.
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            order: Vec::new(),
            slots: RefCell::new(HashMap::new()),
        }
    }

    /// Add a candidate that opens into `adapter`.
    pub fn with_device(mut self, adapter: MockAdapter) -> Self {
        let resource = adapter.resource.clone();
        self.order.push(resource.clone());
        self.slots.get_mut().insert(
            resource,
            MockSlot {
                adapter: Some(adapter),
                ..MockSlot::default()
            },
        );
        self
    }

    /// Report the candidate busy for its first `attempts` opens.
    pub fn busy_for(self, resource: &str, attempts: u32) -> Self {
        if let Some(slot) = self.slots.borrow_mut().get_mut(resource) {
            slot.busy_for = attempts;
        }
        self
    }

    /// Fail the candidate's first `attempts` opens.
    pub fn failing_for(self, resource: &str, attempts: u32) -> Self {
        if let Some(slot) = self.slots.borrow_mut().get_mut(resource) {
            slot.fail_for = attempts;
        }
        self
    }

    /// Open attempts made on `resource`.
    pub fn attempts(&self, resource: &str) -> u32 {
        self.slots
            .borrow()
            .get(resource)
            .map_or(0, |slot| slot.attempts)
    }
}

impl LinkProvider for MockProvider {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn candidates(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.order.clone())
    }

    fn open(&self, resource: &str, config: &LinkConfig) -> Result<Box<dyn Link>, OpenError> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(resource).ok_or_else(|| {
            OpenError::Failed(TransportError::Backend(format!("no such resource {}", resource)))
        })?;
        slot.attempts += 1;
        if slot.busy_for > 0 {
            slot.busy_for -= 1;
            return Err(OpenError::Busy(format!("{} is locked", resource)));
        }
        if slot.fail_for > 0 {
            slot.fail_for -= 1;
            return Err(OpenError::Failed(TransportError::Backend(
                "transient open failure".to_string(),
            )));
        }
        let mut adapter = slot.adapter.take().ok_or_else(|| {
            OpenError::Failed(TransportError::Backend(format!("{} already open", resource)))
        })?;
        adapter
            .set_timeout(config.timeout())
            .map_err(OpenError::Failed)?;
        Ok(Box::new(adapter))
    }
}
