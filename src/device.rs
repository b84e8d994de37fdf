use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::protocol::DecodedStatus;

/// An accessory observed in one qualifying advertisement.
///
/// Two records are equal when they share a radio address, regardless of what
/// their payloads decoded to.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: String,
    pub address: u64,
    pub rssi: i16,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub status: Option<DecodedStatus>,
}

impl DeviceRecord {
    pub fn new(
        address: u64,
        rssi: i16,
        timestamp: DateTime<Utc>,
        payload: Vec<u8>,
        status: Option<DecodedStatus>,
    ) -> Self {
        DeviceRecord {
            id: format!("{:012x}", address),
            address,
            rssi,
            payload,
            timestamp,
            status,
        }
    }

    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// The low 48 bits of the address as `AA:BB:CC:DD:EE:FF`.
    pub fn formatted_address(&self) -> String {
        let bytes = self.address.to_be_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);
        MacAddress::new(mac).to_string()
    }

    pub fn payload_hex(&self) -> String {
        self.payload.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DeviceRecord {}

impl Hash for DeviceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// What to do when an accessory that is already collected is seen again.
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every observation.
    #[default]
    AppendAll,
    /// Keep only the newest observation per address, in first-seen order.
    LatestPerAddress,
}

#[derive(Debug, Default)]
pub struct DeviceCollection {
    policy: RetentionPolicy,
    records: Vec<DeviceRecord>,
}

impl DeviceCollection {
    pub fn new(policy: RetentionPolicy) -> Self {
        DeviceCollection {
            policy,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DeviceRecord) {
        match self.policy {
            RetentionPolicy::AppendAll => self.records.push(record),
            RetentionPolicy::LatestPerAddress => {
                match self.records.iter_mut().find(|existing| **existing == record) {
                    Some(existing) => *existing = record,
                    None => self.records.push(record),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records.clone()
    }
}
