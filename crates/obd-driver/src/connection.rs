//! Discovery & Connection Manager
//!
//! Owns the life cycle of one adapter link:
//!
//! ```text
//! idle -> scanning(filtered) -> scanning(widened) -> connecting -> handshaking -> ready
//!                                                                     ready -> disconnected
//! ```
//!
//! How a link is found is delegated to a [`LinkFactory`] (BLE discovery,
//! serial port, mock). Once the handshake succeeds a supervisor task
//! watches for link loss and idle time, and schedules a single reconnect
//! when the link goes away.

use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::config::DriverConfig;
use crate::error::{ConnectError, DriverError};
use crate::events::{DisconnectReason, DriverEvent, LinkState};
use crate::handshake::{run_handshake, HandshakeReport};
use crate::metrics::{ConnectionMetrics, SharedMetrics};
use crate::queue::{CommandQueue, LinkNotice};
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Identity of the adapter behind a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub device_id: String,
    pub device_name: Option<String>,
    pub rssi: Option<i16>,
}

/// What a [`LinkFactory`] may touch while it establishes a link
#[derive(Clone)]
pub struct EstablishContext {
    state: Arc<watch::Sender<LinkState>>,
    pub metrics: SharedMetrics,
    events: broadcast::Sender<DriverEvent>,
    pub cancel: CancelSignal,
    /// This attempt replaces a lost link
    pub reconnect: bool,
}

impl EstablishContext {
    pub fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }
}

/// Finds an adapter and hands back an unopened transport to it
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn establish(
        &self,
        ctx: EstablishContext,
    ) -> Result<(Box<dyn Transport>, LinkInfo), ConnectError>;
}

/// Point-in-time view of the connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub state: LinkState,
    pub device: Option<LinkInfo>,
    pub handshake: Option<HandshakeReport>,
    pub metrics: ConnectionMetrics,
    pub last_error: Option<String>,
    pub seconds_since_last_command: Option<f64>,
}

struct ActiveLink {
    queue: CommandQueue,
    info: LinkInfo,
    handshake: HandshakeReport,
    generation: u64,
    supervisor: CancelHandle,
}

struct Shared {
    config: DriverConfig,
    link: Arc<dyn LinkFactory>,
    metrics: SharedMetrics,
    state: Arc<watch::Sender<LinkState>>,
    events: broadcast::Sender<DriverEvent>,
    /// Serialises connect cycles
    connect_lock: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveLink>>,
    reconnect: Mutex<Option<CancelHandle>>,
    last_error: Mutex<Option<String>>,
    generation: AtomicU64,
}

/// Cloneable handle to one adapter connection
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: DriverConfig, link: Arc<dyn LinkFactory>) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                link,
                metrics: ConnectionMetrics::shared(),
                state: Arc::new(state),
                events,
                connect_lock: tokio::sync::Mutex::new(()),
                active: Mutex::new(None),
                reconnect: Mutex::new(None),
                last_error: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.shared.metrics.clone()
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Follow state transitions
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.events.subscribe()
    }

    /// Queue of the ready link
    pub fn queue(&self) -> Result<CommandQueue, DriverError> {
        self.shared
            .active
            .lock()
            .as_ref()
            .filter(|active| !active.queue.is_closed())
            .map(|active| active.queue.clone())
            .ok_or(DriverError::NotConnected)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let (device, handshake) = match self.shared.active.lock().as_ref() {
            Some(active) => (Some(active.info.clone()), Some(active.handshake.clone())),
            None => (None, None),
        };
        let metrics = self.shared.metrics.lock().clone();
        let last_error = self
            .shared
            .last_error
            .lock()
            .clone()
            .or_else(|| metrics.last_error.clone());
        ConnectionSnapshot {
            state: self.state(),
            device,
            handshake,
            seconds_since_last_command: metrics.seconds_since_last_command(),
            metrics,
            last_error,
        }
    }

    /// Discover, open and initialise the adapter.
    ///
    /// Returns straight away when the link is already ready. Raising
    /// `cancel` aborts discovery or the handshake and rejects the call.
    pub async fn connect(&self, cancel: CancelSignal) -> Result<ConnectionSnapshot, ConnectError> {
        self.connect_cycle(cancel, false).await
    }

    /// Tear the link down and cancel any scheduled reconnect
    pub fn disconnect(&self) {
        if let Some(pending) = self.shared.reconnect.lock().take() {
            pending.cancel();
        }
        let active = self.shared.active.lock().take();
        if let Some(active) = active {
            info!("Disconnecting from {}", active.info.device_id);
            active.supervisor.cancel();
            active.queue.shutdown();
            self.shared.metrics.lock().record_disconnect();
            self.set_state(LinkState::Disconnected);
            self.emit(DriverEvent::Disconnected {
                reason: DisconnectReason::Requested,
            });
        }
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!("Link state {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.shared.events.send(event);
    }

    async fn connect_cycle(
        &self,
        cancel: CancelSignal,
        reconnect: bool,
    ) -> Result<ConnectionSnapshot, ConnectError> {
        let _guard = self.shared.connect_lock.lock().await;
        if self.state().is_ready() && self.queue().is_ok() {
            return Ok(self.snapshot());
        }
        self.shared.config.validate()?;

        let attempt = {
            let mut metrics = self.shared.metrics.lock();
            metrics.record_connect_attempt();
            metrics.connection_attempts
        };
        self.emit(DriverEvent::ConnectAttempt { attempt, reconnect });
        let started = Instant::now();

        match self.establish(cancel, reconnect).await {
            Ok(snapshot) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                *self.shared.last_error.lock() = None;
                info!(
                    "Connected to {} in {}ms (attempt {})",
                    snapshot
                        .device
                        .as_ref()
                        .map(|d| d.device_id.as_str())
                        .unwrap_or("adapter"),
                    duration_ms,
                    attempt
                );
                self.emit(DriverEvent::Connected {
                    device: snapshot
                        .device
                        .as_ref()
                        .map(|d| d.device_name.clone().unwrap_or_else(|| d.device_id.clone()))
                        .unwrap_or_default(),
                    reconnect,
                    duration_ms,
                });
                Ok(snapshot)
            }
            Err(e) => {
                warn!("Connect attempt {} failed: {}", attempt, e);
                *self.shared.last_error.lock() = Some(e.to_string());
                self.set_state(LinkState::Disconnected);
                self.emit(DriverEvent::ConnectFailed {
                    error: e.to_string(),
                    reconnect,
                });
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        mut cancel: CancelSignal,
        reconnect: bool,
    ) -> Result<ConnectionSnapshot, ConnectError> {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let ctx = EstablishContext {
            state: self.shared.state.clone(),
            metrics: self.shared.metrics.clone(),
            events: self.shared.events.clone(),
            cancel: cancel.clone(),
            reconnect,
        };
        let (mut transport, info) = self.shared.link.establish(ctx).await?;
        if cancel.is_cancelled() {
            let _ = transport.close().await;
            return Err(ConnectError::Cancelled);
        }

        self.set_state(LinkState::Connecting);
        let link_events = transport.open().await?;
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let queue = CommandQueue::spawn(
            transport,
            link_events,
            self.shared.metrics.clone(),
            notice_tx,
            self.shared.events.clone(),
            self.shared.config.command_timeout(),
        );

        self.set_state(LinkState::Handshaking);
        let handshake = tokio::select! {
            result = run_handshake(&queue, &self.shared.config, &self.shared.metrics) => result,
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        };
        let handshake = match handshake {
            Ok(report) => report,
            Err(e) => {
                queue.shutdown();
                return Err(e);
            }
        };

        {
            let mut metrics = self.shared.metrics.lock();
            metrics.record_ready();
            if info.rssi.is_some() {
                metrics.last_rssi = info.rssi;
            }
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (supervisor, stop) = cancel_pair();
        *self.shared.active.lock() = Some(ActiveLink {
            queue,
            info,
            handshake,
            generation,
            supervisor,
        });
        self.set_state(LinkState::Ready);
        tokio::spawn(supervise(self.clone(), generation, notice_rx, stop));

        Ok(self.snapshot())
    }

    /// Drop the active link if it is still the one `generation` refers to
    fn handle_link_loss(&self, generation: u64, reason: DisconnectReason) {
        let active = {
            let mut slot = self.shared.active.lock();
            match slot.as_ref() {
                Some(active) if active.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            return;
        };

        warn!("Link to {} lost: {:?}", active.info.device_id, reason);
        active.queue.shutdown();
        self.shared.metrics.lock().record_disconnect();
        self.set_state(LinkState::Disconnected);
        self.emit(DriverEvent::Disconnected { reason });

        if self.shared.config.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    /// One new discovery cycle after the reconnect delay
    fn schedule_reconnect(&self) {
        let delay = self.shared.config.reconnect_delay();
        let (handle, signal) = cancel_pair();
        if let Some(previous) = self.shared.reconnect.lock().replace(handle) {
            previous.cancel();
        }
        self.emit(DriverEvent::ReconnectScheduled {
            in_ms: delay.as_millis() as u64,
        });
        info!("Reconnecting in {}ms", delay.as_millis());

        let manager = self.clone();
        let lost_at = Instant::now();
        tokio::spawn(async move {
            let mut wait = signal.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait.cancelled() => {
                    debug!("Scheduled reconnect cancelled");
                    return;
                }
            }

            manager.shared.metrics.lock().record_reconnect_attempt();
            match manager.connect_cycle(signal, true).await {
                Ok(_) => {
                    let duration_ms = lost_at.elapsed().as_millis() as u64;
                    manager
                        .shared
                        .metrics
                        .lock()
                        .record_reconnect_success(duration_ms);
                    info!("Reconnected {}ms after link loss", duration_ms);
                }
                Err(e) => {
                    manager.shared.metrics.lock().record_reconnect_failure();
                    error!("Reconnect failed: {}", e);
                }
            }
        });
    }
}

async fn next_tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Watch one ready link until it is lost, idles out, or is torn down
async fn supervise(
    manager: ConnectionManager,
    generation: u64,
    mut notices: mpsc::UnboundedReceiver<LinkNotice>,
    mut stop: CancelSignal,
) {
    let period = manager.shared.config.watchdog_interval();
    let mut watchdog =
        period.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            notice = notices.recv() => match notice {
                Some(LinkNotice::Error(e)) => {
                    *manager.shared.last_error.lock() = Some(e.to_string());
                }
                Some(LinkNotice::Closed) | None => {
                    manager.handle_link_loss(generation, DisconnectReason::LinkLost);
                    return;
                }
            },
            _ = next_tick(&mut watchdog) => {
                let Some(period) = period else { continue };
                let idle = manager.shared.metrics.lock().idle_for();
                if let Some(idle) = idle.filter(|idle| *idle >= period) {
                    let idle_ms = idle.as_millis() as u64;
                    warn!("No adapter activity for {}ms, forcing reconnect", idle_ms);
                    manager.shared.metrics.lock().record_watchdog_trigger();
                    manager.emit(DriverEvent::WatchdogTrigger { idle_ms });
                    manager.handle_link_loss(generation, DisconnectReason::Watchdog);
                    return;
                }
            }
        }
    }
}
