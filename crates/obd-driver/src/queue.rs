//! Command Queue Engine
//!
//! Serialises commands onto a [`Transport`]. A single worker task owns the
//! transport, the [`ResponseFramer`] and the one in-flight slot, so nothing
//! here needs a lock:
//!
//! - commands start in submission order, one at a time
//! - each command has its own deadline, counted from the write
//! - a timeout or write failure rejects that command only; the next one
//!   is always attempted

use crate::error::{QueueError, TransportError};
use crate::events::DriverEvent;
use crate::framer::ResponseFramer;
use crate::metrics::SharedMetrics;
use crate::transport::{Transport, TransportEvents};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

type Responder = oneshot::Sender<Result<String, QueueError>>;

/// A logical command waiting for, or holding, the link
struct Command {
    text: String,
    submitted_at: Instant,
    timeout: Duration,
    responder: Responder,
}

/// Witness that exactly one command is in flight
struct PendingResponse {
    command: Command,
    started: Instant,
    deadline: Instant,
}

enum QueueMessage {
    Submit(Command),
    Shutdown,
}

/// Link trouble reported to the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// The transport went away
    Closed,
    /// The transport reported an error but is still open
    Error(TransportError),
}

/// Handle to a running queue worker
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    default_timeout: Duration,
}

impl CommandQueue {
    /// Start a worker that owns `transport` and its open `link`
    pub fn spawn(
        transport: Box<dyn Transport>,
        link: TransportEvents,
        metrics: SharedMetrics,
        notices: mpsc::UnboundedSender<LinkNotice>,
        events: broadcast::Sender<DriverEvent>,
        default_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            transport,
            framer: ResponseFramer::new(),
            waiting: VecDeque::new(),
            pending: None,
            metrics,
            notices,
            events,
        };
        tokio::spawn(worker.run(rx, link));
        Self {
            tx,
            default_timeout,
        }
    }

    /// Queue a command and return the receiver for its frame.
    ///
    /// Commands are ordered by the call to `enqueue`, not by when the
    /// receiver is awaited.
    pub fn enqueue(
        &self,
        text: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Result<String, QueueError>>, QueueError> {
        let (responder, rx) = oneshot::channel();
        let command = Command {
            text: text.into(),
            submitted_at: Instant::now(),
            timeout: timeout.unwrap_or(self.default_timeout),
            responder,
        };
        self.tx
            .send(QueueMessage::Submit(command))
            .map_err(|_| QueueError::Stopped)?;
        Ok(rx)
    }

    /// Submit a command and wait for its frame
    pub async fn submit(&self, text: &str, timeout: Duration) -> Result<String, QueueError> {
        let rx = self.enqueue(text, Some(timeout))?;
        rx.await.map_err(|_| QueueError::Stopped)?
    }

    /// Submit with the default command timeout
    pub async fn send(&self, text: &str) -> Result<String, QueueError> {
        let rx = self.enqueue(text, None)?;
        rx.await.map_err(|_| QueueError::Stopped)?
    }

    /// Stop the worker; queued commands are rejected and the link closed
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Worker {
    transport: Box<dyn Transport>,
    framer: ResponseFramer,
    waiting: VecDeque<Command>,
    pending: Option<PendingResponse>,
    metrics: SharedMetrics,
    notices: mpsc::UnboundedSender<LinkNotice>,
    events: broadcast::Sender<DriverEvent>,
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueMessage>, mut link: TransportEvents) {
        info!("Command queue started on {}", self.transport.describe());
        let mut data_open = true;
        let mut link_lost = false;

        loop {
            let deadline = self.pending.as_ref().map(|pending| pending.deadline);
            tokio::select! {
                biased;

                data = link.data.recv(), if data_open => match data {
                    Some(bytes) => {
                        self.metrics.lock().record_received(bytes.len());
                        self.framer.feed(&bytes);
                    }
                    None => data_open = false,
                },
                Some(error) = link.errors.recv() => {
                    warn!("Link error on {}: {}", self.transport.describe(), error);
                    let _ = self.notices.send(LinkNotice::Error(error));
                }
                _ = &mut link.closed, if !link_lost => {
                    link_lost = true;
                }
                _ = deadline_reached(deadline) => self.expire(),
                message = rx.recv() => match message {
                    Some(QueueMessage::Submit(command)) => {
                        debug!("Queued {} ({} waiting)", command.text, self.waiting.len());
                        self.waiting.push_back(command);
                    }
                    Some(QueueMessage::Shutdown) | None => break,
                },
            }

            if link_lost {
                warn!("Link {} closed", self.transport.describe());
                self.fail_all(|text| QueueError::LinkClosed(text.to_string()));
                let _ = self.notices.send(LinkNotice::Closed);
                break;
            }
            self.pump().await;
        }

        self.fail_all(|_| QueueError::Stopped);
        if let Err(e) = self.transport.close().await {
            debug!("Closing {} failed: {}", self.transport.describe(), e);
        }
        info!("Command queue stopped");
    }

    /// Resolve the in-flight command from buffered frames and start the
    /// next one once the slot is free
    async fn pump(&mut self) {
        loop {
            if self.pending.is_some() {
                let Some(frame) = self.framer.next_frame() else {
                    break;
                };
                if let Some(pending) = self.pending.take() {
                    self.finish(pending.command, pending.started, Ok(frame));
                }
                continue;
            }

            let Some(command) = self.waiting.pop_front() else {
                break;
            };
            self.start(command).await;
        }
        self.update_depth();
    }

    async fn start(&mut self, command: Command) {
        let line = format!("{}\r", command.text);
        self.metrics.lock().record_sent(&command.text, line.len());
        debug!(
            "-> {} (queued {}ms)",
            command.text,
            command.submitted_at.elapsed().as_millis()
        );

        let started = Instant::now();
        match self.transport.write(line.as_bytes()).await {
            Ok(()) => {
                self.pending = Some(PendingResponse {
                    deadline: started + command.timeout,
                    started,
                    command,
                });
            }
            Err(e) => {
                let error = QueueError::WriteFailed {
                    command: command.text.clone(),
                    reason: e.to_string(),
                };
                self.finish(command, started, Err(error));
            }
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired = matches!(&self.pending, Some(pending) if pending.deadline <= now);
        if !expired {
            return;
        }
        if let Some(pending) = self.pending.take() {
            let error = QueueError::Timeout {
                command: pending.command.text.clone(),
                timeout_ms: pending.command.timeout.as_millis() as u64,
            };
            self.finish(pending.command, pending.started, Err(error));
        }
    }

    fn finish(&mut self, command: Command, started: Instant, result: Result<String, QueueError>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(frame) => {
                debug!("<- {} {:?} ({}ms)", command.text, frame, duration_ms);
                self.metrics.lock().record_success(&command.text, duration_ms);
                let _ = self.events.send(DriverEvent::CommandCompleted {
                    command: command.text.clone(),
                    duration_ms,
                });
            }
            Err(error) => {
                warn!("Command {} failed: {}", command.text, error);
                self.metrics
                    .lock()
                    .record_failure(&command.text, duration_ms, error);
                let _ = self.events.send(DriverEvent::CommandFailed {
                    command: command.text.clone(),
                    error: error.to_string(),
                });
            }
        }
        // the caller may have stopped waiting
        let _ = command.responder.send(result);
    }

    fn fail_all(&mut self, error: impl Fn(&str) -> QueueError) {
        if let Some(pending) = self.pending.take() {
            let err = error(&pending.command.text);
            self.finish(pending.command, pending.started, Err(err));
        }
        while let Some(command) = self.waiting.pop_front() {
            let err = error(&command.text);
            let now = Instant::now();
            self.finish(command, now, Err(err));
        }
        self.update_depth();
    }

    fn update_depth(&self) {
        let depth = self.waiting.len() + usize::from(self.pending.is_some());
        self.metrics.lock().set_queue_depth(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ConnectionMetrics;
    use crate::transport::mock::{AdapterScript, MockTransport};
    use obd_protocol::{parse_dtc_response, DtcStatus};
    use proptest::prelude::*;

    struct Harness {
        queue: CommandQueue,
        mock: MockTransport,
        metrics: SharedMetrics,
        notices: mpsc::UnboundedReceiver<LinkNotice>,
        events: broadcast::Receiver<DriverEvent>,
    }

    async fn harness(script: AdapterScript) -> Harness {
        let mock = MockTransport::new(script);
        let mut transport = mock.clone();
        let link = transport.open().await.unwrap();
        let metrics = ConnectionMetrics::shared();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(256);
        let queue = CommandQueue::spawn(
            Box::new(transport),
            link,
            metrics.clone(),
            notice_tx,
            events_tx,
            Duration::from_millis(500),
        );
        Harness {
            queue,
            mock,
            metrics,
            notices,
            events,
        }
    }

    #[tokio::test]
    async fn test_read_dtc_end_to_end() {
        let h = harness(AdapterScript::default().reply("03", "43 01 33 00 00")).await;
        let frame = h.queue.send("03").await.unwrap();
        assert_eq!(frame, "43 01 33 00 00");

        let codes = parse_dtc_response(&frame, DtcStatus::Current).unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0133");
        assert_eq!(h.mock.writes(), vec!["03"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_wedge_queue() {
        let h = harness(AdapterScript::default().silent("0105")).await;
        let slow = h.queue.enqueue("0105", Some(Duration::from_millis(100))).unwrap();
        let next = h.queue.enqueue("010C", None).unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(next.await.unwrap().unwrap(), "41 0C 1A F8");

        let metrics = h.metrics.lock().clone();
        assert_eq!(metrics.commands_timed_out, 1);
        assert_eq!(metrics.commands_succeeded, 1);
        assert_eq!(metrics.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_from_write() {
        let h = harness(AdapterScript::default().silent("0105")).await;
        let first = h.queue.enqueue("0105", Some(Duration::from_millis(300))).unwrap();
        let second = h.queue.enqueue("0105", Some(Duration::from_millis(300))).unwrap();
        let begin = Instant::now();

        first.await.unwrap().unwrap_err();
        second.await.unwrap().unwrap_err();
        // the second deadline only starts once the first command gave up
        assert!(begin.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_write_failure_rejects_only_that_command() {
        let h = harness(AdapterScript::default()).await;
        h.mock.fail_writes(true);
        let err = h.queue.send("010C").await.unwrap_err();
        assert!(matches!(err, QueueError::WriteFailed { .. }));

        h.mock.fail_writes(false);
        assert_eq!(h.queue.send("010D").await.unwrap(), "41 0D 3C");
        assert_eq!(h.metrics.lock().commands_failed, 1);
    }

    #[tokio::test]
    async fn test_stale_frame_goes_to_next_command() {
        let h = harness(AdapterScript::default()).await;
        h.mock.inject(b"STALE\r>");
        tokio::task::yield_now().await;
        let frame = h.queue.send("010D").await.unwrap();
        assert_eq!(frame, "STALE");
    }

    #[tokio::test]
    async fn test_link_loss_rejects_in_flight() {
        let mut h = harness(AdapterScript::default().silent("03")).await;
        let in_flight = h.queue.enqueue("03", Some(Duration::from_secs(30))).unwrap();
        tokio::task::yield_now().await;
        h.mock.drop_link();

        let err = in_flight.await.unwrap().unwrap_err();
        assert_eq!(err, QueueError::LinkClosed("03".to_string()));
        assert_eq!(h.notices.recv().await, Some(LinkNotice::Closed));
        assert!(matches!(h.queue.send("0100").await, Err(QueueError::Stopped)));
    }

    #[tokio::test]
    async fn test_emits_completion_events() {
        let mut h = harness(AdapterScript::default()).await;
        h.queue.send("ATRV").await.unwrap();
        match h.events.recv().await.unwrap() {
            DriverEvent::CommandCompleted { command, .. } => assert_eq!(command, "ATRV"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_completion_order_is_submission_order(
            outcomes in proptest::collection::vec(any::<bool>(), 1..12)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            let completed = runtime.block_on(async {
                let mut script = AdapterScript::default();
                let mut commands = Vec::new();
                for (idx, answers) in outcomes.iter().enumerate() {
                    let command = format!("01{:02X}", 0x20 + idx);
                    script = if *answers {
                        script.reply(&command, "41 00")
                    } else {
                        script.silent(&command)
                    };
                    commands.push(command);
                }

                let mut h = harness(script).await;
                let receivers: Vec<_> = commands
                    .iter()
                    .map(|c| h.queue.enqueue(c.as_str(), Some(Duration::from_millis(50))).unwrap())
                    .collect();
                for rx in receivers {
                    let _ = rx.await;
                }

                let mut order = Vec::new();
                while let Ok(event) = h.events.try_recv() {
                    match event {
                        DriverEvent::CommandCompleted { command, .. }
                        | DriverEvent::CommandFailed { command, .. } => order.push(command),
                        _ => {}
                    }
                }
                (commands, order)
            });

            prop_assert_eq!(completed.0, completed.1);
        }
    }
}
