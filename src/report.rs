use chrono::{DateTime, Utc};
use serde_derive::Serialize;

use crate::device::DeviceRecord;
use crate::protocol::DecodedStatus;

const SCANNER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Error,
}

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub scanner_version: &'static str,
    pub scan_timestamp: DateTime<Utc>,
    pub total_devices: usize,
    pub devices: Vec<DeviceReport>,
    pub airpods_count: usize,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub address: String,
    pub rssi: i16,
    pub timestamp: DateTime<Utc>,
    pub manufacturer_data_hex: String,
    pub airpods_data: Option<AirPodsReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AirPodsReport {
    pub model: &'static str,
    pub model_id: String,
    pub left_battery: u8,
    pub right_battery: u8,
    pub case_battery: u8,
    pub left_charging: bool,
    pub right_charging: bool,
    pub case_charging: bool,
    pub left_in_ear: bool,
    pub right_in_ear: bool,
    pub both_in_case: bool,
    pub lid_open: bool,
    pub broadcasting_ear: &'static str,
}

impl From<&DecodedStatus> for AirPodsReport {
    fn from(status: &DecodedStatus) -> Self {
        AirPodsReport {
            model: status.model_name(),
            model_id: status.model_id(),
            left_battery: status.battery.left,
            right_battery: status.battery.right,
            case_battery: status.battery.case,
            left_charging: status.charging.left,
            right_charging: status.charging.right,
            case_charging: status.charging.case,
            left_in_ear: status.state.left_in_ear,
            right_in_ear: status.state.right_in_ear,
            both_in_case: status.state.both_in_case(),
            lid_open: status.state.lid_open,
            broadcasting_ear: status.broadcasting_ear.as_str(),
        }
    }
}

impl From<&DeviceRecord> for DeviceReport {
    fn from(record: &DeviceRecord) -> Self {
        DeviceReport {
            device_id: record.id.clone(),
            address: record.formatted_address(),
            rssi: record.rssi,
            timestamp: record.timestamp,
            manufacturer_data_hex: record.payload_hex(),
            airpods_data: record.status.as_ref().map(AirPodsReport::from),
        }
    }
}

impl ScanReport {
    pub fn success(records: &[DeviceRecord]) -> Self {
        let devices: Vec<DeviceReport> = records.iter().map(DeviceReport::from).collect();
        ScanReport {
            scanner_version: SCANNER_VERSION,
            scan_timestamp: Utc::now(),
            total_devices: devices.len(),
            airpods_count: devices.iter().filter(|d| d.airpods_data.is_some()).count(),
            devices,
            status: ReportStatus::Success,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ScanReport {
            scanner_version: SCANNER_VERSION,
            scan_timestamp: Utc::now(),
            total_devices: 0,
            devices: Vec::new(),
            airpods_count: 0,
            status: ReportStatus::Error,
            error: Some(message.into()),
        }
    }

    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}
