//! Two-phase BLE discovery
//!
//! Phase one scans with the adapter's service UUID as filter. Many cheap
//! adapters leave that UUID out of their advertisements, so if nothing
//! matched by the widen deadline the scan restarts without a filter and
//! the overall deadline is extended.

use super::{normalize_address, uuid_matches, Advertisement, BleCentral, Characteristic};
use crate::config::DriverConfig;
use crate::connection::{EstablishContext, LinkFactory, LinkInfo};
use crate::error::{BleError, ConnectError};
use crate::events::{DriverEvent, LinkState, ScanPhase};
use crate::transport::{BleTransport, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Finds and connects a BLE adapter through an injected [`BleCentral`]
pub struct BleLink {
    central: Arc<dyn BleCentral>,
    config: DriverConfig,
}

impl BleLink {
    pub fn new(central: Arc<dyn BleCentral>, config: DriverConfig) -> Self {
        Self { central, config }
    }

    /// Name token, advertised service, or configured address
    fn matches(&self, advert: &Advertisement) -> bool {
        let name_match = advert.name.as_deref().is_some_and(|name| {
            let name = name.to_ascii_lowercase();
            std::iter::once(&self.config.device_name)
                .chain(self.config.name_tokens.iter())
                .filter(|token| !token.is_empty())
                .any(|token| name.contains(&token.to_ascii_lowercase()))
        });

        let service_match = !self.config.service_uuid.is_empty()
            && advert
                .service_uuids
                .iter()
                .any(|uuid| uuid_matches(uuid, &self.config.service_uuid));

        let address_match = self.config.device_address.as_deref().is_some_and(|target| {
            let target = normalize_address(target);
            [advert.address.as_deref(), Some(advert.id.as_str())]
                .into_iter()
                .flatten()
                .map(normalize_address)
                .any(|candidate| !target.is_empty() && (candidate == target || candidate.ends_with(&target)))
        });

        name_match || service_match || address_match
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.central.stop_scan().await {
            warn!("Stopping scan failed: {}", e);
        }
    }

    async fn discover(&self, ctx: &EstablishContext) -> Result<(Advertisement, ScanPhase), ConnectError> {
        let mut adverts = self.central.advertisements();
        let mut cancel = ctx.cancel.clone();

        let filtered = self.config.filter_by_service && !self.config.service_uuid.is_empty();
        let (mut phase, filter) = if filtered {
            (ScanPhase::Filtered, vec![self.config.service_uuid.clone()])
        } else {
            (ScanPhase::Unfiltered, Vec::new())
        };

        let started = Instant::now();
        let mut deadline = started + self.config.connect_timeout();
        let widen_at = started + self.config.widen_after();
        let mut widened = !filtered;

        self.central.start_scan(&filter, false).await?;
        ctx.set_state(LinkState::Scanning(phase));
        ctx.emit(DriverEvent::ScanStarted { phase });
        info!("Scanning for adapter ({:?})", phase);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_scan().await;
                    return Err(ConnectError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    self.stop_scan().await;
                    return Err(ConnectError::DiscoveryTimeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                _ = sleep_until(widen_at), if !widened => {
                    widened = true;
                    let extension = self.config.second_phase();
                    self.stop_scan().await;
                    self.central.start_scan(&[], false).await?;
                    phase = ScanPhase::Widened;
                    deadline += extension;

                    let after_ms = started.elapsed().as_millis() as u64;
                    info!("No adapter after {}ms, widening scan by {}ms", after_ms, extension.as_millis());
                    ctx.set_state(LinkState::Scanning(phase));
                    ctx.emit(DriverEvent::ScanWidened {
                        after_ms,
                        extension_ms: extension.as_millis() as u64,
                    });
                    ctx.emit(DriverEvent::ScanStarted { phase });
                }
                advert = adverts.recv() => match advert {
                    Ok(advert) if self.matches(&advert) => {
                        self.stop_scan().await;
                        return Ok((advert, phase));
                    }
                    Ok(advert) => debug!("Ignoring {} ({:?})", advert.id, advert.name),
                    Err(RecvError::Lagged(skipped)) => debug!("Skipped {} advertisements", skipped),
                    Err(RecvError::Closed) => {
                        self.stop_scan().await;
                        return Err(BleError::ScanFailed("advertisement stream closed".to_string()).into());
                    }
                },
            }
        }
    }

    /// TX/RX by exact UUID, else the first writable and first notifying
    /// characteristic
    async fn resolve_characteristics(
        &self,
        peripheral: &str,
    ) -> Result<(Characteristic, Characteristic), ConnectError> {
        let wanted = [
            self.config.tx_characteristic_uuid.clone(),
            self.config.rx_characteristic_uuid.clone(),
        ];
        let exact = self
            .central
            .discover_characteristics(peripheral, Some(&self.config.service_uuid), &wanted)
            .await
            .unwrap_or_else(|e| {
                debug!("Service lookup failed: {}", e);
                Vec::new()
            });
        let tx = exact
            .iter()
            .find(|c| uuid_matches(&c.uuid, &self.config.tx_characteristic_uuid))
            .cloned();
        let rx = exact
            .iter()
            .find(|c| uuid_matches(&c.uuid, &self.config.rx_characteristic_uuid))
            .cloned();
        if let (Some(tx), Some(rx)) = (&tx, &rx) {
            return Ok((tx.clone(), rx.clone()));
        }

        debug!("Falling back to characteristic properties on {}", peripheral);
        let all = self
            .central
            .discover_characteristics(peripheral, None, &[])
            .await?;
        let tx = tx.or_else(|| all.iter().find(|c| c.properties.can_write()).cloned());
        let rx = rx.or_else(|| all.iter().find(|c| c.properties.can_notify()).cloned());
        match (tx, rx) {
            (Some(tx), Some(rx)) => Ok((tx, rx)),
            _ => Err(ConnectError::CharacteristicsNotFound(peripheral.to_string())),
        }
    }
}

#[async_trait]
impl LinkFactory for BleLink {
    async fn establish(
        &self,
        ctx: EstablishContext,
    ) -> Result<(Box<dyn Transport>, LinkInfo), ConnectError> {
        let (advert, phase) = self.discover(&ctx).await?;
        info!("Matched adapter {} ({:?}) in {:?} scan", advert.id, advert.name, phase);
        {
            let mut metrics = ctx.metrics.lock();
            metrics.last_connect_phase = Some(phase);
            metrics.last_rssi = advert.rssi;
        }
        ctx.emit(DriverEvent::PeripheralMatched {
            id: advert.id.clone(),
            name: advert.name.clone(),
            rssi: advert.rssi,
        });

        ctx.set_state(LinkState::Connecting);
        let mut cancel = ctx.cancel.clone();
        let resolved = tokio::select! {
            result = async {
                self.central.connect(&advert.id).await?;
                self.resolve_characteristics(&advert.id).await
            } => result,
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        };
        let (tx, rx) = match resolved {
            Ok(pair) => pair,
            Err(e) => {
                // a cancelled connect may still have landed
                let _ = self.central.disconnect(&advert.id).await;
                return Err(e);
            }
        };
        debug!("Using TX {} / RX {}", tx.uuid, rx.uuid);

        let transport = BleTransport::new(
            self.central.clone(),
            advert.id.clone(),
            tx.uuid,
            rx.uuid,
            tx.properties.write,
        );
        Ok((
            Box::new(transport),
            LinkInfo {
                device_id: advert.id,
                device_name: advert.name,
                rssi: advert.rssi,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{MockBleCentral, MockPeripheral};
    use crate::ble::CharacteristicProperties;
    use crate::cancel::{cancel_pair, CancelSignal};
    use crate::connection::ConnectionManager;
    use std::time::Duration;

    fn config(timeout_ms: u64) -> DriverConfig {
        DriverConfig {
            connect_timeout_ms: timeout_ms,
            auto_reconnect: false,
            watchdog_interval_ms: 0,
            ..Default::default()
        }
    }

    fn manager(central: &Arc<MockBleCentral>, config: DriverConfig) -> ConnectionManager {
        let link = BleLink::new(central.clone(), config.clone());
        ConnectionManager::new(config, Arc::new(link))
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_scan_finds_advertised_service() {
        let central = Arc::new(MockBleCentral::new());
        central.add_peripheral(MockPeripheral::new("dev-1").named("KINGBOLEN Ediag").advertising("ffe0"));
        let manager = manager(&central, config(15000));

        let snapshot = manager.connect(CancelSignal::never()).await.unwrap();
        assert!(snapshot.state.is_ready());
        assert_eq!(snapshot.metrics.last_connect_phase, Some(ScanPhase::Filtered));
        assert_eq!(central.scans().len(), 1);
        assert!(!central.is_scanning());
        assert_eq!(central.connected().as_deref(), Some("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_widens_then_times_out() {
        let central = Arc::new(MockBleCentral::new());
        central.add_peripheral(MockPeripheral::new("other").named("Headphones"));
        let manager = manager(&central, config(10000));
        let begin = Instant::now();

        let err = manager.connect(CancelSignal::never()).await.unwrap_err();
        assert_eq!(err, ConnectError::DiscoveryTimeout { elapsed_ms: 14000 });

        let scans = central.scans();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].filter, vec!["0000ffe0-0000-1000-8000-00805f9b34fb".to_string()]);
        assert!(scans[1].filter.is_empty());
        assert!(scans[1].at - begin <= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_widened_scan_finds_silent_adapter() {
        let central = Arc::new(MockBleCentral::new());
        // advertises no service UUID, invisible to the filtered scan
        central.add_peripheral(MockPeripheral::new("dev-2").named("OBDII VCI"));
        let manager = manager(&central, config(10000));
        let mut events = manager.subscribe_events();

        let snapshot = manager.connect(CancelSignal::never()).await.unwrap();
        assert_eq!(snapshot.metrics.last_connect_phase, Some(ScanPhase::Widened));

        let mut widened = None;
        while let Ok(event) = events.try_recv() {
            if let DriverEvent::ScanWidened { after_ms, extension_ms } = event {
                widened = Some((after_ms, extension_ms));
            }
        }
        assert_eq!(widened, Some((5000, 4000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_match_without_name() {
        let central = Arc::new(MockBleCentral::new());
        central.add_peripheral(MockPeripheral::new("p-77").with_address("AA:BB:CC:DD:EE:FF"));
        let config = DriverConfig {
            device_address: Some("aabbccddeeff".to_string()),
            filter_by_service: false,
            ..config(5000)
        };
        let manager = manager(&central, config);

        let snapshot = manager.connect(CancelSignal::never()).await.unwrap();
        assert_eq!(snapshot.device.unwrap().device_id, "p-77");
        assert_eq!(snapshot.metrics.last_connect_phase, Some(ScanPhase::Unfiltered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_characteristic_fallback_by_properties() {
        let central = Arc::new(MockBleCentral::new());
        let write = Characteristic {
            uuid: "fff2".to_string(),
            properties: CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            },
        };
        let notify = Characteristic {
            uuid: "fff1".to_string(),
            properties: CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        };
        central.add_peripheral(
            MockPeripheral::new("dev-3")
                .named("KINGBOLEN")
                .advertising("ffe0")
                .with_characteristics(vec![notify, write]),
        );
        let manager = manager(&central, config(15000));

        manager.connect(CancelSignal::never()).await.unwrap();
        let writes = central.writes();
        assert!(!writes.is_empty());
        assert!(writes.iter().all(|(uuid, _)| uuid == "fff2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristics_are_fatal() {
        let central = Arc::new(MockBleCentral::new());
        central.add_peripheral(
            MockPeripheral::new("dev-4")
                .named("KINGBOLEN")
                .advertising("ffe0")
                .with_characteristics(Vec::new()),
        );
        let manager = manager(&central, config(15000));

        let err = manager.connect(CancelSignal::never()).await.unwrap_err();
        assert_eq!(err, ConnectError::CharacteristicsNotFound("dev-4".to_string()));
        assert_eq!(central.disconnect_count(), 1);
        assert!(central.connected().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_scan() {
        let central = Arc::new(MockBleCentral::new());
        central.add_peripheral(
            MockPeripheral::new("late")
                .named("KINGBOLEN")
                .advertising("ffe0")
                .on_air_after(Duration::from_secs(8)),
        );
        let manager = manager(&central, config(15000));
        let (handle, signal) = cancel_pair();

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(signal).await }
        });
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(central.is_scanning());
        handle.cancel();

        assert_eq!(connecting.await.unwrap().unwrap_err(), ConnectError::Cancelled);
        assert!(!central.is_scanning());
        assert!(central.connected().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_slow_connect() {
        let central = Arc::new(MockBleCentral::new());
        central.add_peripheral(
            MockPeripheral::new("slow")
                .named("KINGBOLEN")
                .advertising("ffe0")
                .connect_after(Duration::from_secs(10)),
        );
        let manager = manager(&central, config(30000));
        let (handle, signal) = cancel_pair();
        let begin = Instant::now();

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(signal).await }
        });
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!central.is_scanning());
        handle.cancel();

        assert_eq!(connecting.await.unwrap().unwrap_err(), ConnectError::Cancelled);
        assert!(begin.elapsed() < Duration::from_secs(10));
        assert!(central.connected().is_none());
        assert_eq!(central.disconnect_count(), 1);
    }

    #[test]
    fn test_name_tokens_are_case_insensitive() {
        let link = BleLink::new(Arc::new(MockBleCentral::new()), DriverConfig::default());
        let advert = |name: &str| Advertisement {
            id: "x".to_string(),
            name: Some(name.to_string()),
            address: None,
            rssi: None,
            service_uuids: Vec::new(),
        };
        assert!(link.matches(&advert("kingbolen-7")));
        assert!(link.matches(&advert("My Ediag")));
        assert!(!link.matches(&advert("Speaker")));
    }
}
