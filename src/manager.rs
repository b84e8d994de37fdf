use std::collections::HashMap;
use std::sync::Arc;

use btleplug::api::{
    BDAddr, Central as _, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use chrono::Utc;
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::watcher::{
    Advertisement, AdvertisementHandler, ManufacturerData, StoppedHandler, Watcher, WatcherError,
    WatcherStatus,
};

#[derive(Default)]
struct Handlers {
    advertisement: Mutex<Option<Arc<dyn Fn(Advertisement) + Send + Sync>>>,
    stopped: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Handlers {
    fn advertisement(&self, advertisement: Advertisement) {
        let handler = self.advertisement.lock().clone();
        if let Some(handler) = handler {
            handler(advertisement);
        }
    }

    // Stopped handlers may block for a whole retry interval, so they never run
    // on the runtime.
    fn stopped(&self) {
        let Some(handler) = self.stopped.lock().clone() else {
            return;
        };
        if let Err(err) = std::thread::Builder::new()
            .name("watcher-stopped".to_string())
            .spawn(move || handler())
        {
            error!("Error delivering watcher stopped notification: {:?}", err);
        }
    }
}

/// Advertisement watcher backed by a btleplug adapter.
///
/// `start` and `stop` block on the runtime and must be called from outside of
/// it (e.g. through `spawn_blocking`).
pub struct BtleWatcher {
    adapter: Adapter,
    runtime: Handle,
    status: Arc<Mutex<WatcherStatus>>,
    handlers: Arc<Handlers>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleWatcher {
    /// Uses the first adapter the platform reports.
    pub async fn first_adapter() -> Result<Self, WatcherError> {
        let manager = Manager::new()
            .await
            .map_err(|err| WatcherError::Start(err.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|err| WatcherError::Start(err.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(WatcherError::Unavailable)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }

        Ok(BtleWatcher {
            adapter,
            runtime: Handle::current(),
            status: Arc::new(Mutex::new(WatcherStatus::Created)),
            handlers: Arc::new(Handlers::default()),
            pump: Mutex::new(None),
        })
    }

    fn ensure_pump(&self) {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let adapter = self.adapter.clone();
        let status = self.status.clone();
        let handlers = self.handlers.clone();
        *pump = Some(self.runtime.spawn(async move {
            if let Err(err) = pump_events(&adapter, &handlers).await {
                error!("Error handling BTLE events: {:?}", err);
            }
            debug!("BTLE event stream closed");

            let was_started = {
                let mut status = status.lock();
                let was_started = *status == WatcherStatus::Started;
                if was_started {
                    *status = WatcherStatus::Aborted;
                }
                was_started
            };
            if was_started {
                handlers.stopped();
            }
        }));
    }
}

impl Watcher for BtleWatcher {
    fn start(&self) -> Result<(), WatcherError> {
        self.ensure_pump();
        self.runtime
            .block_on(self.adapter.start_scan(ScanFilter::default()))
            .map_err(|err| WatcherError::Start(err.to_string()))?;
        *self.status.lock() = WatcherStatus::Started;
        Ok(())
    }

    fn stop(&self) -> Result<(), WatcherError> {
        let was_started = {
            let mut status = self.status.lock();
            let was_started = *status == WatcherStatus::Started;
            if was_started {
                *status = WatcherStatus::Stopping;
            }
            was_started
        };

        let result = self.runtime.block_on(self.adapter.stop_scan());
        *self.status.lock() = WatcherStatus::Stopped;
        if was_started {
            self.handlers.stopped();
        }
        result.map_err(|err| WatcherError::Stop(err.to_string()))
    }

    fn status(&self) -> WatcherStatus {
        *self.status.lock()
    }

    fn on_advertisement(&self, handler: AdvertisementHandler) {
        *self.handlers.advertisement.lock() = Some(Arc::from(handler));
    }

    fn on_stopped(&self, handler: StoppedHandler) {
        *self.handlers.stopped.lock() = Some(Arc::from(handler));
    }
}

impl Drop for BtleWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }
}

async fn pump_events(adapter: &Adapter, handlers: &Handlers) -> Result<(), btleplug::Error> {
    let mut events = adapter.events().await?;

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => match advertisement(adapter, &id, manufacturer_data).await {
                Ok(advertisement) => handlers.advertisement(advertisement),
                Err(err) => warn!("Error reading properties of {:?}: {:?}", id, err),
            },
            CentralEvent::DeviceDisconnected(id) => debug!("DeviceDisconnected: {:?}", id),
            _ => {}
        }
    }
    Ok(())
}

async fn advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    manufacturer_data: HashMap<u16, Vec<u8>>,
) -> Result<Advertisement, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let properties = peripheral.properties().await?;
    let (address, rssi) = properties
        .map(|PeripheralProperties { address, rssi, .. }| (address, rssi))
        .unwrap_or((peripheral.address(), None));

    Ok(Advertisement {
        address: address_to_u64(address),
        rssi: rssi.unwrap_or_default(),
        timestamp: Utc::now(),
        manufacturer_data: manufacturer_data
            .into_iter()
            .map(|(company_id, data)| ManufacturerData { company_id, data })
            .collect(),
    })
}

fn address_to_u64(address: BDAddr) -> u64 {
    address
        .into_inner()
        .iter()
        .fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_to_u64() {
        let address = BDAddr::from([0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
        assert_eq!(address_to_u64(address), 0xA1B2_C3D4_E5F6);
        assert_eq!(address_to_u64(BDAddr::default()), 0);
    }
}
