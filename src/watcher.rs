use chrono::{DateTime, Utc};
use thiserror::Error;

/// One (company id, bytes) pair from an advertisement. `data` never includes the
/// company id itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// A single advertisement as delivered by the platform watcher.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: u64,
    pub rssi: i16,
    pub timestamp: DateTime<Utc>,
    pub manufacturer_data: Vec<ManufacturerData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Created,
    Started,
    Stopping,
    Stopped,
    Aborted,
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("No Bluetooth adapter available")]
    Unavailable,

    #[error("Failed to start advertisement watcher: {0}")]
    Start(String),

    #[error("Failed to stop advertisement watcher: {0}")]
    Stop(String),
}

pub type AdvertisementHandler = Box<dyn Fn(Advertisement) + Send + Sync>;
pub type StoppedHandler = Box<dyn Fn() + Send + Sync>;

/// A passive advertisement scanner.
///
/// Handlers are invoked from the watcher's own threads, never from inside
/// `start` or `stop`. A stopped notification is delivered every time the
/// watcher leaves the started state, whether requested or not.
pub trait Watcher: Send + Sync {
    fn start(&self) -> Result<(), WatcherError>;

    fn stop(&self) -> Result<(), WatcherError>;

    fn status(&self) -> WatcherStatus;

    /// Replaces any previously installed handler.
    fn on_advertisement(&self, handler: AdvertisementHandler);

    /// Replaces any previously installed handler.
    fn on_stopped(&self, handler: StoppedHandler);
}
