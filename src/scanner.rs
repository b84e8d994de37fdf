//! Scan lifecycle around an unreliable advertisement watcher.
//!
//! The scanner owns the watcher and the collected devices. When the watcher
//! stops without being asked to, the stopped notification is turned into a
//! paced restart loop that runs on the notifying thread until a start succeeds
//! or a stop/shutdown is requested. A watcher that dies while `start` is still
//! in flight is restarted the same way.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::ScanConfig;
use crate::device::{DeviceCollection, DeviceRecord, RetentionPolicy};
use crate::protocol::{ProtocolParser as _, ProximityPairingParser};
use crate::watcher::{Advertisement, Watcher, WatcherStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    /// A start attempt is in flight or a restart is waiting for its deadline.
    Starting,
    Running,
    Stopping,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub company_id: u16,
    pub retry_interval: Duration,
    pub destroy_timeout: Duration,
    pub retention: RetentionPolicy,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        ScannerOptions::from_config(&ScanConfig::default())
    }
}

impl ScannerOptions {
    pub fn from_config(config: &ScanConfig) -> Self {
        ScannerOptions {
            company_id: config.manufacturer.unwrap_or_default().company_id(),
            retry_interval: config.retry_interval(),
            destroy_timeout: config.destroy_timeout(),
            retention: config.retention.unwrap_or_default(),
        }
    }
}

pub type DeviceObserver = Arc<dyn Fn(&DeviceRecord) + Send + Sync>;

struct Inner {
    state: ScanState,
    last_start: Instant,
    /// Set when a stopped notification lands while a start is in flight.
    stopped_while_starting: bool,
    devices: DeviceCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOutcome {
    Started,
    Failed,
    /// The watcher started but died before the attempt completed.
    Lost,
}

struct Shared<W> {
    watcher: W,
    options: ScannerOptions,
    parser: ProximityPairingParser,
    inner: Mutex<Inner>,
    /// Signalled on `inner` once a shutdown's stop has been acknowledged.
    destroyed: Condvar,
    retry_gate: Mutex<()>,
    retry_signal: Condvar,
    observer: Mutex<Option<DeviceObserver>>,
}

pub struct Scanner<W: Watcher + 'static> {
    shared: Arc<Shared<W>>,
}

impl<W: Watcher + 'static> Scanner<W> {
    pub fn new(watcher: W, options: ScannerOptions) -> Self {
        let shared = Arc::new(Shared {
            watcher,
            inner: Mutex::new(Inner {
                state: ScanState::Idle,
                last_start: Instant::now(),
                stopped_while_starting: false,
                devices: DeviceCollection::new(options.retention),
            }),
            options,
            parser: ProximityPairingParser::new(),
            destroyed: Condvar::new(),
            retry_gate: Mutex::new(()),
            retry_signal: Condvar::new(),
            observer: Mutex::new(None),
        });

        let weak: Weak<Shared<W>> = Arc::downgrade(&shared);
        shared.watcher.on_advertisement(Box::new(move |advertisement| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_advertisement(advertisement);
            }
        }));

        let weak: Weak<Shared<W>> = Arc::downgrade(&shared);
        shared.watcher.on_stopped(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.handle_stopped();
            }
        }));

        Scanner { shared }
    }

    /// Starts the watcher. Returns `false` if the watcher refused to start or
    /// the scanner is shutting down; a failed start may simply be retried.
    ///
    /// If the watcher dies before the start completes, the scanner stays in
    /// `Starting` and restarts it on a background thread.
    pub fn start(&self) -> bool {
        match self.shared.attempt_start(false) {
            StartOutcome::Started => true,
            StartOutcome::Failed => {
                let mut inner = self.shared.inner.lock();
                if inner.state == ScanState::Starting {
                    inner.state = ScanState::Idle;
                }
                false
            }
            StartOutcome::Lost => {
                let shared = self.shared.clone();
                if let Err(err) = std::thread::Builder::new()
                    .name("scanner-restart".to_string())
                    .spawn(move || shared.restart_loop())
                {
                    error!("Error spawning restart thread: {:?}", err);
                    let mut inner = self.shared.inner.lock();
                    if inner.state == ScanState::Starting {
                        inner.state = ScanState::Idle;
                    }
                    return false;
                }
                true
            }
        }
    }

    /// Stops the watcher and cancels any pending restart. Stopping an idle
    /// scanner is a no-op.
    pub fn stop(&self) -> bool {
        self.shared.request_stop()
    }

    /// Stops the watcher and waits, bounded by the destroy timeout, for the
    /// watcher to acknowledge. The scanner cannot be started again afterwards.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn state(&self) -> ScanState {
        self.shared.inner.lock().state
    }

    pub fn is_scanning(&self) -> bool {
        let _inner = self.shared.inner.lock();
        self.shared.watcher.status() == WatcherStatus::Started
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.shared.inner.lock().devices.snapshot()
    }

    pub fn device_count(&self) -> usize {
        self.shared.inner.lock().devices.len()
    }

    pub fn clear_devices(&self) {
        self.shared.inner.lock().devices.clear();
    }

    /// Installs the observer called on the watcher's thread after each record
    /// is stored. Replaces any previous observer.
    pub fn register_observer<F>(&self, observer: F)
    where
        F: Fn(&DeviceRecord) + Send + Sync + 'static,
    {
        *self.shared.observer.lock() = Some(Arc::new(observer));
    }
}

impl<W: Watcher + 'static> Drop for Scanner<W> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<W: Watcher> Shared<W> {
    /// A restart only proceeds while the scanner is still waiting to restart,
    /// so a stop that lands between the wait and the attempt wins.
    ///
    /// A stopped notification consumed while the start was in flight is only
    /// acted on if the watcher is no longer started once the start returns.
    fn attempt_start(&self, restart: bool) -> StartOutcome {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ScanState::Destroying | ScanState::Destroyed => {
                    debug!("Ignoring start, scanner is shutting down");
                    return StartOutcome::Failed;
                }
                ScanState::Running => return StartOutcome::Started,
                ScanState::Starting => {}
                ScanState::Idle | ScanState::Stopping if !restart => {}
                ScanState::Idle | ScanState::Stopping => return StartOutcome::Failed,
            }
            inner.state = ScanState::Starting;
            inner.last_start = Instant::now();
            inner.stopped_while_starting = false;
        }

        let result = self.watcher.start();

        let mut inner = self.inner.lock();
        let stopped = std::mem::take(&mut inner.stopped_while_starting);
        match result {
            Ok(()) if inner.state == ScanState::Starting => {
                if stopped && self.watcher.status() != WatcherStatus::Started {
                    warn!("Advertisement watcher stopped while starting, restarting");
                    return StartOutcome::Lost;
                }
                inner.state = ScanState::Running;
                info!("Advertisement watcher started");
                StartOutcome::Started
            }
            Ok(()) => {
                drop(inner);
                info!("Stop requested while starting, stopping advertisement watcher");
                if let Err(err) = self.watcher.stop() {
                    error!("{}", err);
                }
                StartOutcome::Failed
            }
            Err(err) => {
                error!("{}", err);
                StartOutcome::Failed
            }
        }
    }

    fn request_stop(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ScanState::Idle | ScanState::Stopping | ScanState::Destroyed => return true,
                ScanState::Starting | ScanState::Running => inner.state = ScanState::Stopping,
                ScanState::Destroying => {}
            }
        }

        self.wake_retry();

        match self.watcher.stop() {
            Ok(()) => {
                info!("Advertisement watcher stop requested");
                true
            }
            Err(err) => {
                error!("{}", err);
                false
            }
        }
    }

    fn shutdown(&self) {
        let awaiting_ack = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ScanState::Destroying | ScanState::Destroyed) {
                return;
            }
            let awaiting_ack = inner.state == ScanState::Stopping
                || self.watcher.status() == WatcherStatus::Started;
            inner.state = ScanState::Destroying;
            awaiting_ack
        };

        // Nothing to stop unless the watcher is running or already stopping.
        if awaiting_ack {
            self.request_stop();
        } else {
            self.wake_retry();
        }

        let mut inner = self.inner.lock();
        if awaiting_ack {
            let deadline = Instant::now() + self.options.destroy_timeout;
            while inner.state != ScanState::Destroyed {
                if self.destroyed.wait_until(&mut inner, deadline).timed_out() {
                    warn!("Advertisement watcher did not acknowledge stop, shutting down anyway");
                    break;
                }
            }
        }
        inner.state = ScanState::Destroyed;
        debug!("Scanner shut down");
    }

    fn wake_retry(&self) {
        let _gate = self.retry_gate.lock();
        self.retry_signal.notify_all();
    }

    fn handle_advertisement(&self, advertisement: Advertisement) {
        let Advertisement {
            address,
            rssi,
            timestamp,
            manufacturer_data,
        } = advertisement;

        for entry in manufacturer_data
            .into_iter()
            .filter(|entry| entry.company_id == self.options.company_id)
        {
            let status = self.parser.parse(&entry.data);
            let record = DeviceRecord::new(address, rssi, timestamp, entry.data, status);

            match &record.status {
                Some(status) => info!(
                    "AirPods detected: {} ({}) - {}",
                    status.model_name(),
                    record.id,
                    status.battery_summary()
                ),
                None => debug!(
                    "Device {} without proximity pairing data: {}",
                    record.id,
                    record.payload_hex()
                ),
            }

            self.inner.lock().devices.push(record.clone());

            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                observer(&record);
            }
        }
    }

    fn handle_stopped(&self) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ScanState::Destroying => {
                    inner.state = ScanState::Destroyed;
                    self.destroyed.notify_all();
                    return;
                }
                ScanState::Stopping => {
                    inner.state = ScanState::Idle;
                    info!("Advertisement watcher stopped");
                    return;
                }
                ScanState::Starting => {
                    inner.stopped_while_starting = true;
                    debug!("Stopped notification while starting");
                    return;
                }
                ScanState::Destroyed | ScanState::Idle => {
                    debug!("Ignoring stopped notification in state {:?}", inner.state);
                    return;
                }
                ScanState::Running => {
                    if self.watcher.status() == WatcherStatus::Started {
                        debug!("Ignoring stale stopped notification");
                        return;
                    }
                    inner.state = ScanState::Starting;
                }
            }
        }

        warn!("Advertisement watcher stopped unexpectedly, restarting");
        self.restart_loop();
    }

    fn restart_loop(&self) {
        loop {
            {
                let mut gate = self.retry_gate.lock();
                loop {
                    let (state, deadline) = {
                        let inner = self.inner.lock();
                        (inner.state, inner.last_start + self.options.retry_interval)
                    };
                    if state != ScanState::Starting {
                        drop(gate);
                        self.cancel_restart();
                        return;
                    }
                    if Instant::now() >= deadline {
                        break;
                    }
                    self.retry_signal.wait_until(&mut gate, deadline);
                }
            }

            if self.attempt_start(true) == StartOutcome::Started {
                return;
            }
        }
    }

    fn cancel_restart(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ScanState::Stopping {
            inner.state = ScanState::Idle;
        }
        debug!("Restart cancelled in state {:?}", inner.state);
    }
}
