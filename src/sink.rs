//! Where poll outcomes land.
//!
//! The core never creates devices: a sink is seeded from the inventory and
//! outcomes only update what is there. [`MemorySink`] is the in-process
//! reference implementation used by the CLI, the HTTP API and the tests.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::health::Thresholds;
use crate::types::{DeviceRef, OpticalReading, PollOutcome, PortReading, UptimeReading};

#[async_trait::async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Apply one outcome. Last write wins; calls for one device are
    /// serialized by the sink.
    async fn apply(&self, outcome: &PollOutcome) -> Result<()>;
}

/// Persisted state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: u64,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub sys_name: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    /// Last-known liveness; `None` until first polled.
    pub alive: Option<bool>,
    pub uptime: Option<UptimeReading>,
    pub last_poll: Option<String>,
    /// Keyed by ifIndex.
    pub ports: BTreeMap<u32, PortReading>,
}

impl DeviceRecord {
    pub fn new(device: &DeviceRef) -> Self {
        Self {
            id: device.id,
            ip: device.ip,
            hostname: device.hostname.clone(),
            sys_name: None,
            vendor: device.vendor.clone(),
            model: device.model.clone(),
            alive: None,
            uptime: None,
            last_poll: None,
            ports: BTreeMap::new(),
        }
    }

    /// Merge an outcome. SNMP-unreachable outcomes only touch liveness and
    /// the poll timestamp; optical fields are replaced only by values that
    /// were actually read, and severity is rated on the merged rx/tx.
    pub fn merge(&mut self, outcome: &PollOutcome, thresholds: &Thresholds) {
        self.alive = Some(outcome.alive);
        self.last_poll = Some(outcome.polled_at.clone());
        if !outcome.snmp_alive {
            return;
        }

        if let Some(identity) = &outcome.identity {
            if identity.vendor.is_some() {
                self.vendor = identity.vendor.clone();
            }
            if identity.model.is_some() {
                self.model = identity.model.clone();
            }
            if identity.sys_name.is_some() {
                self.sys_name = identity.sys_name.clone();
            }
        }
        if outcome.uptime.is_some() {
            self.uptime = outcome.uptime.clone();
        }

        for port in &outcome.ports {
            match self.ports.get_mut(&port.if_index) {
                Some(existing) => merge_port(existing, port, thresholds),
                None => {
                    self.ports.insert(port.if_index, port.clone());
                }
            }
        }
    }
}

fn merge_port(existing: &mut PortReading, new: &PortReading, thresholds: &Thresholds) {
    existing.name = new.name.clone();
    existing.description = new.description.clone().or(existing.description.take());
    existing.alias = new.alias.clone().or(existing.alias.take());
    existing.admin_up = new.admin_up.or(existing.admin_up);
    existing.oper_up = new.oper_up.or(existing.oper_up);
    existing.speed_mbps = new.speed_mbps.or(existing.speed_mbps);
    existing.uplink = new.uplink;
    if !new.optics.is_empty() {
        merge_optics(&mut existing.optics, &new.optics);
        let optics = &mut existing.optics;
        if optics.rx_dbm.is_some() || optics.tx_dbm.is_some() {
            optics.severity = Some(thresholds.classify(optics.rx_dbm, optics.tx_dbm));
        }
        existing.read_at = new.read_at.clone();
    }
}

fn merge_optics(existing: &mut OpticalReading, new: &OpticalReading) {
    fn keep<T: Clone>(slot: &mut Option<T>, new: &Option<T>) {
        if new.is_some() {
            *slot = new.clone();
        }
    }
    keep(&mut existing.rx_dbm, &new.rx_dbm);
    keep(&mut existing.tx_dbm, &new.tx_dbm);
    keep(&mut existing.sfp_vendor, &new.sfp_vendor);
    keep(&mut existing.part_number, &new.part_number);
    keep(&mut existing.serial_number, &new.serial_number);
    keep(&mut existing.temperature_c, &new.temperature_c);
    keep(&mut existing.voltage_v, &new.voltage_v);
}

/// In-memory sink with one lock per device.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    devices: Arc<RwLock<HashMap<u64, Arc<Mutex<DeviceRecord>>>>>,
    thresholds: Thresholds,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink rating merged optics with the poller's thresholds.
    pub fn with_thresholds(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    /// Register devices. Existing records are left untouched.
    pub async fn seed(&self, devices: &[DeviceRef]) {
        let mut map = self.devices.write().await;
        for d in devices {
            map.entry(d.id)
                .or_insert_with(|| Arc::new(Mutex::new(DeviceRecord::new(d))));
        }
    }

    pub async fn get(&self, id: u64) -> Option<DeviceRecord> {
        let slot = self.devices.read().await.get(&id).cloned()?;
        let rec = slot.lock().await;
        Some(rec.clone())
    }

    /// All records ordered by id.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        let slots: Vec<Arc<Mutex<DeviceRecord>>> = self.devices.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out.sort_by_key(|r| r.id);
        out
    }
}

#[async_trait::async_trait]
impl ResultSink for MemorySink {
    async fn apply(&self, outcome: &PollOutcome) -> Result<()> {
        let Some(slot) = self.devices.read().await.get(&outcome.device_id).cloned() else {
            bail!("device {} ({}) is not in the sink", outcome.device_id, outcome.ip);
        };
        let mut rec = slot.lock().await;
        rec.merge(outcome, &self.thresholds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identity, Measured, Severity};

    fn device() -> DeviceRef {
        DeviceRef::new(1, "10.0.0.1".parse().unwrap())
    }

    fn port(rx: Option<Measured<f64>>) -> PortReading {
        PortReading {
            if_index: 25,
            name: "te1/0/1".into(),
            description: None,
            alias: None,
            admin_up: Some(true),
            oper_up: Some(true),
            speed_mbps: Some(10_000),
            uplink: true,
            optics: OpticalReading {
                rx_dbm: rx,
                severity: rx.map(|_| Severity::Normal),
                ..Default::default()
            },
            read_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn reachable(rx: Option<Measured<f64>>) -> PollOutcome {
        let mut o = PollOutcome::empty(&device(), "2026-01-01T00:00:00Z".into());
        o.success = true;
        o.alive = true;
        o.icmp_alive = true;
        o.snmp_alive = true;
        o.identity = Some(Identity {
            vendor: Some("Eltex".into()),
            model: Some("MES2428".into()),
            ..Default::default()
        });
        o.ports = vec![port(rx)];
        o
    }

    #[tokio::test]
    async fn unreachable_keeps_optics_and_model() {
        let sink = MemorySink::new();
        sink.seed(&[device()]).await;
        sink.apply(&reachable(Some(Measured::Value(-7.5)))).await.unwrap();

        let mut down = PollOutcome::empty(&device(), "2026-01-01T00:05:00Z".into());
        down.icmp_alive = true;
        down.alive = true;
        sink.apply(&down).await.unwrap();

        let rec = sink.get(1).await.unwrap();
        assert_eq!(rec.alive, Some(true));
        assert_eq!(rec.last_poll.as_deref(), Some("2026-01-01T00:05:00Z"));
        assert_eq!(rec.model.as_deref(), Some("MES2428"));
        assert_eq!(rec.ports[&25].optics.rx_dbm, Some(Measured::Value(-7.5)));
    }

    #[tokio::test]
    async fn unread_fields_do_not_erase_known_values() {
        let sink = MemorySink::new();
        sink.seed(&[device()]).await;
        sink.apply(&reachable(Some(Measured::Value(-7.5)))).await.unwrap();
        sink.apply(&reachable(None)).await.unwrap();
        let rec = sink.get(1).await.unwrap();
        assert_eq!(rec.ports[&25].optics.rx_dbm, Some(Measured::Value(-7.5)));

        sink.apply(&reachable(Some(Measured::Unknown))).await.unwrap();
        let rec = sink.get(1).await.unwrap();
        assert_eq!(rec.ports[&25].optics.rx_dbm, Some(Measured::Unknown));
    }

    #[tokio::test]
    async fn severity_follows_merged_readings() {
        let sink = MemorySink::new();
        sink.seed(&[device()]).await;
        let mut first = reachable(Some(Measured::Value(-12.0)));
        first.ports[0].optics.tx_dbm = Some(Measured::Value(-2.0));
        first.ports[0].optics.severity = Some(Severity::Critical);
        sink.apply(&first).await.unwrap();

        // tx not read this time; the kept -2.0 dBm still rates critical.
        sink.apply(&reachable(Some(Measured::Value(-11.0)))).await.unwrap();
        let optics = sink.get(1).await.unwrap().ports[&25].optics.clone();
        assert_eq!(optics.rx_dbm, Some(Measured::Value(-11.0)));
        assert_eq!(optics.tx_dbm, Some(Measured::Value(-2.0)));
        assert_eq!(optics.severity, Some(Severity::Critical));
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let sink = MemorySink::new();
        assert!(sink.apply(&reachable(None)).await.is_err());
        assert!(sink.snapshot().await.is_empty());
    }
}
