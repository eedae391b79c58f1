//! In-memory BLE central for testing
//!
//! Peripherals come on air at a fixed offset from the central's creation
//! and advertise once per scan. A filtered scan only reports peripherals
//! that put a filtered service UUID in their advertisement.

use super::{uuid_matches, Advertisement, BleCentral, Characteristic, CharacteristicProperties};
use crate::error::BleError;
use crate::transport::mock::AdapterScript;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// A simulated adapter
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub advertisement: Advertisement,
    /// Offset from central creation before it starts advertising
    pub on_air_after: Duration,
    /// How long a connect request takes to complete
    pub connect_delay: Duration,
    pub characteristics: Vec<Characteristic>,
}

impl MockPeripheral {
    pub fn new(id: &str) -> Self {
        Self {
            advertisement: Advertisement {
                id: id.to_string(),
                name: None,
                address: None,
                rssi: Some(-60),
                service_uuids: Vec::new(),
            },
            on_air_after: Duration::ZERO,
            connect_delay: Duration::ZERO,
            characteristics: vec![Characteristic {
                uuid: "ffe1".to_string(),
                properties: CharacteristicProperties {
                    write: true,
                    write_without_response: true,
                    notify: true,
                    indicate: false,
                },
            }],
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.advertisement.name = Some(name.to_string());
        self
    }

    pub fn advertising(mut self, service: &str) -> Self {
        self.advertisement.service_uuids.push(service.to_string());
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.advertisement.address = Some(address.to_string());
        self
    }

    pub fn on_air_after(mut self, delay: Duration) -> Self {
        self.on_air_after = delay;
        self
    }

    pub fn connect_after(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_characteristics(mut self, characteristics: Vec<Characteristic>) -> Self {
        self.characteristics = characteristics;
        self
    }
}

/// A scan request as the central saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub at: Instant,
    pub filter: Vec<String>,
}

#[derive(Default)]
struct CentralState {
    peripherals: Vec<MockPeripheral>,
    scans: Vec<ScanRecord>,
    scan_task: Option<JoinHandle<()>>,
    connected: Option<String>,
    disconnects: usize,
    notify: Option<mpsc::Sender<Vec<u8>>>,
    notice: Option<oneshot::Sender<()>>,
    writes: Vec<(String, String)>,
}

pub struct MockBleCentral {
    created: Instant,
    adverts: broadcast::Sender<Advertisement>,
    state: Mutex<CentralState>,
    script: RwLock<AdapterScript>,
}

impl Default for MockBleCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBleCentral {
    pub fn new() -> Self {
        let (adverts, _) = broadcast::channel(64);
        Self {
            created: Instant::now(),
            adverts,
            state: Mutex::new(CentralState::default()),
            script: RwLock::new(AdapterScript::default()),
        }
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.state.lock().peripherals.push(peripheral);
    }

    pub fn set_script(&self, script: AdapterScript) {
        *self.script.write() = script;
    }

    pub fn scans(&self) -> Vec<ScanRecord> {
        self.state.lock().scans.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.state
            .lock()
            .scan_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn connected(&self) -> Option<String> {
        self.state.lock().connected.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    /// (characteristic, command) pairs written so far
    pub fn writes(&self) -> Vec<(String, String)> {
        self.state.lock().writes.clone()
    }

    /// Simulate the peripheral going out of range
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        state.connected = None;
        state.notify = None;
        if let Some(notice) = state.notice.take() {
            let _ = notice.send(());
        }
    }

    fn peripheral(&self, id: &str) -> Result<MockPeripheral, BleError> {
        self.state
            .lock()
            .peripherals
            .iter()
            .find(|p| p.advertisement.id == id)
            .cloned()
            .ok_or_else(|| BleError::UnknownPeripheral(id.to_string()))
    }
}

fn visible(peripheral: &MockPeripheral, filter: &[String]) -> bool {
    filter.is_empty()
        || peripheral
            .advertisement
            .service_uuids
            .iter()
            .any(|uuid| filter.iter().any(|wanted| uuid_matches(uuid, wanted)))
}

#[async_trait]
impl BleCentral for MockBleCentral {
    fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.adverts.subscribe()
    }

    async fn start_scan(&self, service_filter: &[String], _allow_duplicates: bool) -> Result<(), BleError> {
        let mut state = self.state.lock();
        state.scans.push(ScanRecord {
            at: Instant::now(),
            filter: service_filter.to_vec(),
        });

        let mut schedule: Vec<(Instant, Advertisement)> = state
            .peripherals
            .iter()
            .filter(|p| visible(p, service_filter))
            .map(|p| {
                let on_air = (self.created + p.on_air_after).max(Instant::now());
                (on_air, p.advertisement.clone())
            })
            .collect();
        schedule.sort_by_key(|(at, _)| *at);

        let adverts = self.adverts.clone();
        if let Some(previous) = state.scan_task.replace(tokio::spawn(async move {
            for (at, advertisement) in schedule {
                sleep_until(at).await;
                let _ = adverts.send(advertisement);
            }
            std::future::pending::<()>().await;
        })) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(task) = self.state.lock().scan_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &str) -> Result<(), BleError> {
        let found = self.peripheral(peripheral)?;
        if !found.connect_delay.is_zero() {
            tokio::time::sleep(found.connect_delay).await;
        }
        self.state.lock().connected = Some(peripheral.to_string());
        Ok(())
    }

    async fn disconnect(&self, _peripheral: &str) -> Result<(), BleError> {
        let mut state = self.state.lock();
        state.connected = None;
        state.notify = None;
        state.notice = None;
        state.disconnects += 1;
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &str,
        _service: Option<&str>,
        uuids: &[String],
    ) -> Result<Vec<Characteristic>, BleError> {
        let peripheral = self.peripheral(peripheral)?;
        Ok(peripheral
            .characteristics
            .into_iter()
            .filter(|c| uuids.is_empty() || uuids.iter().any(|u| uuid_matches(u, &c.uuid)))
            .collect())
    }

    async fn subscribe(
        &self,
        peripheral: &str,
        characteristic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        let found = self
            .peripheral(peripheral)?
            .characteristics
            .iter()
            .any(|c| uuid_matches(&c.uuid, characteristic) && c.properties.can_notify());
        if !found {
            return Err(BleError::SubscribeFailed(characteristic.to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().notify = Some(tx);
        Ok(rx)
    }

    async fn write(
        &self,
        _peripheral: &str,
        characteristic: &str,
        bytes: &[u8],
        _with_response: bool,
    ) -> Result<(), BleError> {
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        let notify = {
            let mut state = self.state.lock();
            if state.connected.is_none() {
                return Err(BleError::WriteFailed("not connected".to_string()));
            }
            state.writes.push((characteristic.to_string(), command.clone()));
            state.notify.clone()
        };
        let reply = self.script.read().respond(&command);
        if let (Some(notify), Some(reply)) = (notify, reply) {
            let _ = notify.try_send(reply);
        }
        Ok(())
    }

    fn disconnect_notice(&self, _peripheral: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().notice = Some(tx);
        rx
    }
}
