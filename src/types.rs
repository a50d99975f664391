use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// A device to poll, as supplied by the inventory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub id: u64,
    pub ip: IpAddr,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Known vendor, skipping identification when set.
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Per-device community, overriding the configured default.
    #[serde(default)]
    pub community: Option<String>,
}

impl DeviceRef {
    pub fn new(id: u64, ip: IpAddr) -> Self {
        Self {
            id,
            ip,
            hostname: None,
            vendor: None,
            model: None,
            community: None,
        }
    }
}

/// Pipeline stage of one device within a cycle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Pending = 0,
    Probing = 1,
    Reachable = 2,
    Unreachable = 3,
    ResolvingOids = 4,
    ReadingValues = 5,
    Normalizing = 6,
    Done = 7,
}

impl DeviceState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceState::Probing,
            2 => DeviceState::Reachable,
            3 => DeviceState::Unreachable,
            4 => DeviceState::ResolvingOids,
            5 => DeviceState::ReadingValues,
            6 => DeviceState::Normalizing,
            7 => DeviceState::Done,
            _ => DeviceState::Pending,
        }
    }
}

/// A value that was read but may carry no usable measurement.
///
/// `Option<Measured<T>>` distinguishes "not read this cycle" (`None`) from
/// "read, but the device reports nothing meaningful" (`Some(Unknown)`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Measured<T> {
    Value(T),
    Unknown,
}

impl<T: Copy> Measured<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Measured::Value(v) => Some(*v),
            Measured::Unknown => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub sys_descr: Option<String>,
    pub sys_object_id: Option<String>,
    pub sys_name: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UptimeReading {
    /// Raw sysUpTime in hundredths of a second.
    pub ticks: u32,
    pub seconds: u64,
    /// `"{d} days, {h} hours"`.
    pub display: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
    Unknown,
}

/// DDM readings of one transceiver. Every field is `None` until read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OpticalReading {
    pub rx_dbm: Option<Measured<f64>>,
    pub tx_dbm: Option<Measured<f64>>,
    pub sfp_vendor: Option<Measured<String>>,
    pub part_number: Option<Measured<String>>,
    pub serial_number: Option<Measured<String>>,
    pub temperature_c: Option<Measured<f64>>,
    pub voltage_v: Option<Measured<f64>>,
    pub severity: Option<Severity>,
}

impl OpticalReading {
    pub fn is_empty(&self) -> bool {
        self.rx_dbm.is_none()
            && self.tx_dbm.is_none()
            && self.sfp_vendor.is_none()
            && self.part_number.is_none()
            && self.serial_number.is_none()
            && self.temperature_c.is_none()
            && self.voltage_v.is_none()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortReading {
    pub if_index: u32,
    pub name: String,
    pub description: Option<String>,
    pub alias: Option<String>,
    pub admin_up: Option<bool>,
    pub oper_up: Option<bool>,
    pub speed_mbps: Option<u64>,
    pub uplink: bool,
    pub optics: OpticalReading,
    pub read_at: String,
}

/// One failed field or stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_index: Option<u32>,
    pub detail: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            if_index: None,
            detail: detail.into(),
        }
    }

    pub fn on_port(mut self, if_index: u32) -> Self {
        self.if_index = Some(if_index);
        self
    }
}

/// Result of polling one device in one cycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub device_id: u64,
    pub ip: IpAddr,
    pub success: bool,
    /// `Done` once the pipeline has returned.
    pub state: DeviceState,
    pub alive: bool,
    pub icmp_alive: bool,
    pub snmp_alive: bool,
    pub latency_ms: Option<u64>,
    pub elapsed_ms: u64,
    pub identity: Option<Identity>,
    pub uptime: Option<UptimeReading>,
    pub ports: Vec<PortReading>,
    pub optical_supported: bool,
    pub errors: Vec<FieldError>,
    pub polled_at: String,
}

impl PollOutcome {
    /// An outcome with nothing learned yet.
    pub fn empty(device: &DeviceRef, polled_at: String) -> Self {
        Self {
            device_id: device.id,
            ip: device.ip,
            success: false,
            state: DeviceState::Pending,
            alive: false,
            icmp_alive: false,
            snmp_alive: false,
            latency_ms: None,
            elapsed_ms: 0,
            identity: None,
            uptime: None,
            ports: Vec::new(),
            optical_supported: false,
            errors: Vec::new(),
            polled_at,
        }
    }
}

/// Aggregate of one poll cycle.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    pub elapsed_ms: u64,
    pub batch_elapsed_ms: Vec<u64>,
    pub cancelled: bool,
    pub ports_warning: u64,
    pub ports_critical: u64,
    pub outcomes: Vec<PollOutcome>,
}
