//! Scripted adapter links for testing
//!
//! [`MockTransport`] answers every write from an [`AdapterScript`] the way an
//! ELM327 would: reply text, blank line, prompt.

use super::{transport_channel, Transport, TransportEvents, TransportSenders};
use crate::connection::{EstablishContext, LinkFactory, LinkInfo};
use crate::error::{ConnectError, TransportError};
use crate::events::LinkState;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Command to reply mapping
#[derive(Debug, Clone)]
pub struct AdapterScript {
    replies: HashMap<String, String>,
    silent: HashSet<String>,
    fallback: String,
}

impl Default for AdapterScript {
    fn default() -> Self {
        let mut script = Self {
            replies: HashMap::new(),
            silent: HashSet::new(),
            fallback: "NO DATA".to_string(),
        };
        for (command, reply) in [
            ("ATZ", "ELM327 v1.5"),
            ("ATE0", "OK"),
            ("ATS0", "OK"),
            ("ATH1", "OK"),
            ("ATSP0", "OK"),
            ("AT#2", "OK"),
            ("AT#1", "KINGBOLEN EDIAG v2.1"),
            ("ATDPN", "A6"),
            ("ATRV", "12.6V"),
            ("03", "43 00 00 00 00 00 00"),
            ("07", "47 00 00 00 00 00 00"),
            ("04", "44"),
            ("0101", "41 01 00 07 65 00"),
            ("010C", "41 0C 1A F8"),
            ("010D", "41 0D 3C"),
            ("0105", "41 05 5A"),
            ("010F", "41 0F 41"),
            ("0111", "41 11 33"),
            ("0142", "41 42 31 26"),
        ] {
            script.replies.insert(command.to_string(), reply.to_string());
        }
        script
    }
}

impl AdapterScript {
    /// Script with no replies at all; every command gets the fallback
    pub fn empty() -> Self {
        Self {
            replies: HashMap::new(),
            silent: HashSet::new(),
            fallback: "NO DATA".to_string(),
        }
    }

    pub fn reply(mut self, command: &str, reply: &str) -> Self {
        self.silent.remove(command);
        self.replies.insert(command.to_string(), reply.to_string());
        self
    }

    /// Never answer `command`, so it times out
    pub fn silent(mut self, command: &str) -> Self {
        self.silent.insert(command.to_string());
        self
    }

    /// Framed reply bytes for a command, `None` when it stays silent
    pub fn respond(&self, command: &str) -> Option<Vec<u8>> {
        let command = command.trim();
        if self.silent.contains(command) {
            return None;
        }
        let reply = self.replies.get(command).unwrap_or(&self.fallback);
        Some(format!("{}\r\r>", reply).into_bytes())
    }
}

#[derive(Default)]
struct MockState {
    writes: Vec<String>,
    senders: Option<TransportSenders>,
    fail_writes: bool,
    /// Bumped on every open; a stale clone must not close a newer link
    epoch: u64,
    opens: usize,
    closes: usize,
}

/// In-memory adapter link
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<RwLock<AdapterScript>>,
    state: Arc<Mutex<MockState>>,
    latency: Duration,
    epoch: u64,
}

impl MockTransport {
    pub fn new(script: AdapterScript) -> Self {
        Self {
            script: Arc::new(RwLock::new(script)),
            state: Arc::new(Mutex::new(MockState::default())),
            latency: Duration::ZERO,
            epoch: 0,
        }
    }

    /// Delay every reply by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the reply for one command
    pub fn set_reply(&self, command: &str, reply: &str) {
        let mut script = self.script.write();
        *script = script.clone().reply(command, reply);
    }

    pub fn set_silent(&self, command: &str) {
        let mut script = self.script.write();
        *script = script.clone().silent(command);
    }

    /// Commands written so far, without line endings
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Push unsolicited bytes as if the adapter sent them
    pub fn inject(&self, bytes: &[u8]) {
        let sender = self.data_sender();
        if let Some(sender) = sender {
            let _ = sender.try_send(bytes.to_vec());
        }
    }

    /// Simulate the adapter going out of range
    pub fn drop_link(&self) {
        if let Some(senders) = self.state.lock().senders.take() {
            let _ = senders.closed.send(());
        }
    }

    fn data_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.state
            .lock()
            .senders
            .as_ref()
            .map(|senders| senders.data.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<TransportEvents, TransportError> {
        let (senders, events) = transport_channel();
        let mut state = self.state.lock();
        state.opens += 1;
        state.epoch += 1;
        state.senders = Some(senders);
        self.epoch = state.epoch;
        Ok(events)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        let sender = {
            let mut state = self.state.lock();
            if state.fail_writes {
                return Err(TransportError::WriteFailed(format!("{} rejected", command)));
            }
            state.writes.push(command.clone());
            state
                .senders
                .as_ref()
                .map(|senders| senders.data.clone())
                .ok_or(TransportError::NotOpen)?
        };

        let Some(reply) = self.script.read().respond(&command) else {
            return Ok(());
        };
        if self.latency.is_zero() {
            let _ = sender.try_send(reply);
        } else {
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = sender.send(reply).await;
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closes += 1;
        if state.epoch == self.epoch {
            state.senders = None;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Link factory handing out one shared [`MockTransport`]
#[derive(Clone)]
pub struct MockLink {
    transport: MockTransport,
    failures: Arc<Mutex<Vec<ConnectError>>>,
}

impl MockLink {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Make the next `establish` call fail with `error`
    pub fn fail_next(&self, error: ConnectError) {
        self.failures.lock().push(error);
    }
}

#[async_trait]
impl LinkFactory for MockLink {
    async fn establish(
        &self,
        ctx: EstablishContext,
    ) -> Result<(Box<dyn Transport>, LinkInfo), ConnectError> {
        ctx.set_state(LinkState::Connecting);
        if let Some(error) = self.failures.lock().pop() {
            return Err(error);
        }
        Ok((
            Box::new(self.transport.clone()),
            LinkInfo {
                device_id: "mock".to_string(),
                device_name: Some("Mock ELM327".to_string()),
                rssi: None,
            },
        ))
    }
}
