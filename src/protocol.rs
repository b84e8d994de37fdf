//! Decoder for the proximity pairing status that AirPods broadcast inside
//! Apple manufacturer data.
//!
//! Payload indices are relative to the manufacturer data with the company id
//! already stripped:
//!
//! ```text
//! 0     protocol type (0x07)
//! 1-2   ignored
//! 3-4   model id, low byte first
//! 5     case battery nibble + charging bits
//! 6     left / right battery nibbles
//! 7     lid + in-ear bits
//! ```

use std::fmt;

/// A decoder for one vendor sub-protocol.
pub trait ProtocolParser {
    type Output;

    fn parse(&self, data: &[u8]) -> Option<Self::Output>;

    fn can_parse(&self, data: &[u8]) -> bool;

    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;
}

const PROXIMITY_PAIRING_TYPE: u8 = 0x07;
const MIN_PAYLOAD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    AirPodsPro2,
    AirPodsPro,
    AirPods3,
    AirPods2,
    Unknown(u16),
}

impl Model {
    pub fn from_id(id: u16) -> Self {
        match id {
            0x2014 => Model::AirPodsPro2,
            0x200E => Model::AirPodsPro,
            0x2013 => Model::AirPods3,
            0x200F => Model::AirPods2,
            other => Model::Unknown(other),
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            Model::AirPodsPro2 => 0x2014,
            Model::AirPodsPro => 0x200E,
            Model::AirPods3 => 0x2013,
            Model::AirPods2 => 0x200F,
            Model::Unknown(id) => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Model::AirPodsPro2 => "AirPods Pro 2",
            Model::AirPodsPro => "AirPods Pro",
            Model::AirPods3 => "AirPods 3",
            Model::AirPods2 => "AirPods 2",
            Model::Unknown(_) => "Unknown AirPods",
        }
    }

    /// Uppercase, zero padded, e.g. `0x2014`.
    pub fn id_hex(&self) -> String {
        format!("0x{:04X}", self.id())
    }
}

/// Percentages in steps of 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatteryLevels {
    pub left: u8,
    pub right: u8,
    pub case: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChargingState {
    pub left: bool,
    pub right: bool,
    pub case: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub left_in_ear: bool,
    pub right_in_ear: bool,
    pub lid_open: bool,
}

impl DeviceState {
    pub fn both_in_case(&self) -> bool {
        !self.left_in_ear && !self.right_in_ear
    }
}

/// The payload carries no bit for this; the decoder always reports `Right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastingEar {
    Left,
    Right,
}

impl BroadcastingEar {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastingEar::Left => "left",
            BroadcastingEar::Right => "right",
        }
    }
}

impl fmt::Display for BroadcastingEar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStatus {
    pub model: Model,
    pub battery: BatteryLevels,
    pub charging: ChargingState,
    pub state: DeviceState,
    pub broadcasting_ear: BroadcastingEar,
}

impl DecodedStatus {
    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    pub fn model_id(&self) -> String {
        self.model.id_hex()
    }

    pub fn is_any_charging(&self) -> bool {
        self.charging.left || self.charging.right || self.charging.case
    }

    pub fn is_any_in_ear(&self) -> bool {
        self.state.left_in_ear || self.state.right_in_ear
    }

    pub fn lowest_battery(&self) -> u8 {
        self.battery
            .left
            .min(self.battery.right)
            .min(self.battery.case)
    }

    /// Short form used in logs, e.g. `L:70% R:80% C:50%`.
    pub fn battery_summary(&self) -> String {
        format!(
            "L:{}% R:{}% C:{}%",
            self.battery.left, self.battery.right, self.battery.case
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProximityPairingParser;

impl ProximityPairingParser {
    pub fn new() -> Self {
        ProximityPairingParser
    }
}

impl ProtocolParser for ProximityPairingParser {
    type Output = DecodedStatus;

    fn parse(&self, data: &[u8]) -> Option<DecodedStatus> {
        if !self.can_parse(data) {
            return None;
        }

        let model = Model::from_id(u16::from_le_bytes([data[3], data[4]]));
        let status = data[5];
        let battery = data[6];
        let lid = data[7];

        Some(DecodedStatus {
            model,
            battery: BatteryLevels {
                left: high_nibble(battery) * 10,
                right: low_nibble(battery) * 10,
                case: high_nibble(status) * 10,
            },
            charging: ChargingState {
                left: status & 0x02 != 0,
                right: status & 0x01 != 0,
                case: status & 0x04 != 0,
            },
            state: DeviceState {
                left_in_ear: lid & 0x02 != 0,
                right_in_ear: lid & 0x01 != 0,
                lid_open: lid & 0x04 != 0,
            },
            broadcasting_ear: BroadcastingEar::Right,
        })
    }

    fn can_parse(&self, data: &[u8]) -> bool {
        data.len() >= MIN_PAYLOAD_LEN && data[0] == PROXIMITY_PAIRING_TYPE
    }

    fn name(&self) -> &'static str {
        "Apple proximity pairing"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }
}

fn high_nibble(byte: u8) -> u8 {
    (byte >> 4) & 0x0F
}

fn low_nibble(byte: u8) -> u8 {
    byte & 0x0F
}
