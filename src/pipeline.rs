//! Per-device poll: probe, identify, resolve, read, normalize.
//!
//! `poll_device` never fails. Every problem is recorded as a [`FieldError`]
//! on the outcome and the pipeline moves on, or stops early at `Done` when
//! nothing further can be learned (SNMP unreachable).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use ::time::{format_description::well_known, OffsetDateTime};
use tokio::time::Instant;

use crate::config::PollerConfig;
use crate::error::ErrorKind;
use crate::interfaces::{self, InterfaceRecord};
use crate::normalize::{self, Liveness, NormalizedValue, PowerEncoding, ValueKind};
use crate::oid::{known, Oid};
use crate::probe::{self, ProbeMethod, ProbeOptions, ProbeResult, RawValue, SnmpTarget, Transport};
use crate::resolver::{ResolutionCache, ResolutionPlan};
use crate::types::{
    DeviceRef, DeviceState, FieldError, Identity, Measured, OpticalReading, PollOutcome, PortReading,
};
use crate::vendor::{Capability, IndexKind, ProfileTable};

/// IF-MIB columns walked for interface discovery.
fn interface_columns() -> [Oid; 8] {
    [
        known::if_descr(),
        known::if_type(),
        known::if_speed(),
        known::if_admin_status(),
        known::if_oper_status(),
        known::if_name(),
        known::if_high_speed(),
        known::if_alias(),
    ]
}

pub(crate) fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Shared, read-only inputs for every device task in a cycle.
#[derive(Clone)]
pub struct PollContext {
    pub transport: Arc<dyn Transport>,
    pub profiles: Arc<ProfileTable>,
    pub cache: Arc<ResolutionCache>,
    pub config: Arc<PollerConfig>,
}

/// Progress of one device, readable after its task is dropped on timeout.
#[derive(Debug, Clone, Default)]
pub struct StageTracker {
    stage: Arc<AtomicU8>,
    icmp_alive: Arc<AtomicBool>,
    snmp_alive: Arc<AtomicBool>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: DeviceState) {
        self.stage.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.stage.load(Ordering::Relaxed))
    }

    fn mark_alive(&self, icmp: bool, snmp: bool) {
        self.icmp_alive.store(icmp, Ordering::Relaxed);
        self.snmp_alive.store(snmp, Ordering::Relaxed);
    }

    /// Outcome for a device whose pipeline exceeded its deadline.
    pub fn timed_out(&self, device: &DeviceRef, elapsed_ms: u64) -> PollOutcome {
        let mut out = PollOutcome::empty(device, now_rfc3339());
        let reached = self.get();
        out.state = DeviceState::Done;
        out.icmp_alive = self.icmp_alive.load(Ordering::Relaxed);
        out.snmp_alive = self.snmp_alive.load(Ordering::Relaxed);
        out.alive = out.icmp_alive || out.snmp_alive;
        out.elapsed_ms = elapsed_ms;
        out.errors.push(FieldError::new(
            "device",
            ErrorKind::Timeout,
            format!("per-device timeout exceeded during {reached:?}"),
        ));
        out
    }
}

fn probe_error(field: &str, res: &ProbeResult) -> FieldError {
    FieldError::new(
        field,
        res.error.unwrap_or(ErrorKind::Unreachable),
        res.detail.clone().unwrap_or_else(|| "no response".to_string()),
    )
}

struct DeviceReader<'a> {
    transport: &'a Arc<dyn Transport>,
    target: SnmpTarget,
    opts: ProbeOptions,
}

impl DeviceReader<'_> {
    async fn get(&self, oid: &Oid) -> ProbeResult {
        probe::probe(self.transport, &self.target, &ProbeMethod::SnmpGet(oid.clone()), self.opts).await
    }

    async fn walk(&self, base: &Oid) -> ProbeResult {
        probe::probe(self.transport, &self.target, &ProbeMethod::SnmpWalk(base.clone()), self.opts).await
    }

    /// First non-absent value among `oids`. Transport errors are returned
    /// only when no candidate produced a value.
    async fn first_value(&self, oids: &[Oid]) -> Result<Option<RawValue>, FieldError> {
        let mut last_err = None;
        for oid in oids {
            let res = self.get(oid).await;
            match res.scalar() {
                Some(v) if !v.is_absent() => return Ok(Some(v.clone())),
                Some(_) => {}
                None => last_err = Some(probe_error("value", &res)),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Poll one device through every stage.
pub async fn poll_device(ctx: &PollContext, device: &DeviceRef, tracker: &StageTracker) -> PollOutcome {
    let start = Instant::now();
    let mut out = PollOutcome::empty(device, now_rfc3339());
    let cfg = &ctx.config;
    let reader = DeviceReader {
        transport: &ctx.transport,
        target: SnmpTarget::new(
            device.ip,
            cfg.snmp_port,
            device.community.clone().unwrap_or_else(|| cfg.community.clone()),
        ),
        opts: cfg.probe_options(),
    };

    tracker.set(DeviceState::Probing);
    out.state = DeviceState::Probing;
    let uptime_oid = known::sys_uptime();
    let (icmp, snmp) = tokio::join!(
        probe::probe(&ctx.transport, &reader.target, &ProbeMethod::Icmp, reader.opts),
        reader.get(&uptime_oid),
    );
    out.icmp_alive = icmp.reachable;
    out.snmp_alive = snmp.reachable && normalize::liveness(snmp.scalar()) == Liveness::Alive;
    out.alive = out.icmp_alive || out.snmp_alive;
    out.latency_ms = if icmp.reachable {
        Some(icmp.latency.as_millis() as u64)
    } else if snmp.reachable {
        Some(snmp.latency.as_millis() as u64)
    } else {
        None
    };
    tracker.mark_alive(out.icmp_alive, out.snmp_alive);
    if !icmp.reachable {
        out.errors.push(probe_error("icmp", &icmp));
    }

    if !out.snmp_alive {
        tracker.set(DeviceState::Unreachable);
        out.state = DeviceState::Unreachable;
        if snmp.reachable {
            out.errors.push(FieldError::new(
                "snmp",
                ErrorKind::MalformedResponse,
                "sysUpTime returned no value",
            ));
        } else {
            out.errors.push(probe_error("snmp", &snmp));
        }
        tracing::debug!(ip = %device.ip, device = device.id, icmp = out.icmp_alive, "SNMP unreachable");
        return finish(out, tracker, start);
    }
    tracker.set(DeviceState::Reachable);
    out.state = DeviceState::Reachable;

    if let Some(raw) = snmp.scalar() {
        match normalize::normalize(raw, ValueKind::Uptime, &[]) {
            Ok(NormalizedValue::Uptime(u)) => out.uptime = Some(u),
            Ok(_) => {}
            Err(e) => out.errors.push(FieldError::new(e.field.clone(), ErrorKind::NormalizeError, e.reason)),
        }
    }

    let identity = read_identity(&reader, ctx, device, &mut out.errors).await;
    out.identity = Some(identity.clone());

    tracker.set(DeviceState::ResolvingOids);
    out.state = DeviceState::ResolvingOids;
    let plan = ctx.cache.plan(identity.vendor.as_deref(), identity.model.as_deref());
    out.optical_supported = plan.has_optics();

    tracker.set(DeviceState::ReadingValues);
    out.state = DeviceState::ReadingValues;
    let ifaces = read_interfaces(&reader, &mut out.errors).await;
    let raw_optics = if out.optical_supported {
        read_optics(&reader, &plan, &ifaces, &mut out.errors).await
    } else {
        HashMap::new()
    };

    tracker.set(DeviceState::Normalizing);
    out.state = DeviceState::Normalizing;
    out.ports = build_ports(&plan, &ifaces, raw_optics, cfg, &out.polled_at, &mut out.errors);

    out.success = true;
    tracing::debug!(
        ip = %device.ip,
        device = device.id,
        vendor = identity.vendor.as_deref().unwrap_or("-"),
        model = identity.model.as_deref().unwrap_or("-"),
        ports = out.ports.len(),
        "device polled"
    );
    finish(out, tracker, start)
}

fn finish(mut out: PollOutcome, tracker: &StageTracker, start: Instant) -> PollOutcome {
    tracker.set(DeviceState::Done);
    out.state = DeviceState::Done;
    out.elapsed_ms = start.elapsed().as_millis() as u64;
    out
}

async fn read_identity(
    reader: &DeviceReader<'_>,
    ctx: &PollContext,
    device: &DeviceRef,
    errors: &mut Vec<FieldError>,
) -> Identity {
    let mut identity = Identity::default();
    let base = ctx.cache.plan(None, None);
    for oid in base.oids(Capability::Identity) {
        let res = reader.get(oid).await;
        let Some(value) = res.scalar().filter(|v| !v.is_absent()) else {
            if !res.reachable {
                errors.push(probe_error(&format!("identity {oid}"), &res));
            }
            continue;
        };
        if *oid == known::sys_object_id() {
            identity.sys_object_id = match value {
                RawValue::ObjectId(o) => Some(o.to_string()),
                other => other.as_text(),
            };
        } else if let Measured::Value(s) = normalize::text(value) {
            if *oid == known::sys_descr() {
                identity.sys_descr = Some(s);
            } else if *oid == known::sys_name() {
                identity.sys_name = Some(s);
            }
        }
    }

    let sys_oid = identity.sys_object_id.as_deref().and_then(|s| s.parse::<Oid>().ok());
    let found = ctx.profiles.identify(sys_oid.as_ref(), identity.sys_descr.as_deref());
    identity.vendor = device
        .vendor
        .clone()
        .or_else(|| found.as_ref().map(|f| f.vendor.clone()));
    identity.model = device.model.clone().or_else(|| {
        // A model pattern only applies to the vendor it belongs to.
        let vendor = identity.vendor.as_deref()?;
        let profile = ctx.profiles.get(vendor)?;
        identity.sys_descr.as_deref().and_then(|d| profile.extract_model(d))
    });
    identity
}

async fn read_interfaces(reader: &DeviceReader<'_>, errors: &mut Vec<FieldError>) -> Vec<InterfaceRecord> {
    let mut walks = Vec::new();
    for column in interface_columns() {
        let res = reader.walk(&column).await;
        if !res.reachable || res.error.is_some() {
            errors.push(probe_error(&format!("interfaces {column}"), &res));
        }
        walks.push((column, res.rows().to_vec()));
    }
    interfaces::build_interfaces(&walks)
}

/// Raw DDM values of one port.
#[derive(Debug, Default)]
struct PortRaw {
    values: Vec<(Capability, RawValue)>,
    /// ENTITY-SENSOR `(scale, precision)` of the port's sensor.
    sensor: Option<(i64, i64)>,
}

type RawOptics = HashMap<u32, PortRaw>;

async fn read_optics(
    reader: &DeviceReader<'_>,
    plan: &ResolutionPlan,
    ifaces: &[InterfaceRecord],
    errors: &mut Vec<FieldError>,
) -> RawOptics {
    let mut out: RawOptics = HashMap::new();

    if let Some(port) = plan.port {
        let raw = read_capabilities(reader, plan, None, port, errors).await;
        if !raw.values.is_empty() {
            out.insert(port, raw);
        }
        return out;
    }

    let profile = plan.profile.as_deref();
    let candidates = interfaces::optical_candidates(ifaces, profile);
    if candidates.is_empty() {
        return out;
    }
    let index_map = match plan.index {
        IndexKind::IfIndex => None,
        IndexKind::EntPhysicalIndex => {
            let map = entity_map(reader, ifaces).await;
            if map.is_empty() {
                errors.push(FieldError::new(
                    "optical",
                    ErrorKind::UnsupportedCapability,
                    "no ifIndex to entPhysicalIndex mapping",
                ));
                return out;
            }
            Some(map)
        }
    };

    for iface in candidates {
        let instance = match &index_map {
            None => iface.if_index,
            Some(map) => match map.get(&iface.if_index) {
                Some(ent) => *ent,
                None => continue,
            },
        };
        let raw = read_capabilities(reader, plan, Some(instance), iface.if_index, errors).await;
        if !raw.values.is_empty() {
            out.insert(iface.if_index, raw);
        }
    }
    out
}

/// Read every DDM capability for one port. `instance` is appended to the
/// column OIDs; `None` means the OIDs are already full instances.
async fn read_capabilities(
    reader: &DeviceReader<'_>,
    plan: &ResolutionPlan,
    instance: Option<u32>,
    if_index: u32,
    errors: &mut Vec<FieldError>,
) -> PortRaw {
    let mut raw = PortRaw::default();
    for cap in Capability::OPTICAL {
        let columns = plan.oids(cap);
        if columns.is_empty() {
            continue;
        }
        let oids: Vec<Oid> = match instance {
            Some(i) => columns.iter().map(|c| c.child(i)).collect(),
            None => columns.to_vec(),
        };
        match reader.first_value(&oids).await {
            Ok(Some(v)) => raw.values.push((cap, v)),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(ip = %reader.target.ip, if_index, capability = %cap, "read failed");
                errors.push(FieldError { field: cap.to_string(), ..e }.on_port(if_index));
            }
        }
    }

    if plan.encoding == PowerEncoding::EntitySensor {
        if let Some(i) = instance {
            let scale = reader.get(&known::ent_phy_sensor_scale().child(i)).await;
            let precision = reader.get(&known::ent_phy_sensor_precision().child(i)).await;
            raw.sensor = scale
                .scalar()
                .and_then(RawValue::as_i64)
                .zip(precision.scalar().and_then(RawValue::as_i64));
        }
    }
    raw
}

async fn entity_map(reader: &DeviceReader<'_>, ifaces: &[InterfaceRecord]) -> HashMap<u32, u32> {
    let alias = reader.walk(&known::ent_alias_mapping_identifier()).await;
    let map = interfaces::entity_map_from_alias(alias.rows());
    if !map.is_empty() {
        return map;
    }
    tracing::debug!(ip = %reader.target.ip, "entAliasMappingIdentifier empty, matching entity names");
    let names = reader.walk(&known::ent_physical_name()).await;
    let classes = reader.walk(&known::ent_physical_class()).await;
    interfaces::entity_map_by_name(ifaces, names.rows(), classes.rows())
}

fn build_ports(
    plan: &ResolutionPlan,
    ifaces: &[InterfaceRecord],
    mut raw: RawOptics,
    cfg: &PollerConfig,
    read_at: &str,
    errors: &mut Vec<FieldError>,
) -> Vec<PortReading> {
    let profile = plan.profile.as_deref();
    let mut ports: Vec<PortReading> = ifaces
        .iter()
        .filter(|i| !i.is_virtual(profile))
        .map(|i| PortReading {
            if_index: i.if_index,
            name: i.label().to_string(),
            description: i.descr.clone(),
            alias: i.alias.clone(),
            admin_up: i.admin_up,
            oper_up: i.oper_up,
            speed_mbps: i.speed_mbps,
            uplink: interfaces::is_uplink(profile, i),
            optics: OpticalReading::default(),
            read_at: read_at.to_string(),
        })
        .collect();

    // A fixed slot may be missing from the walked table.
    for if_index in raw.keys() {
        if !ports.iter().any(|p| p.if_index == *if_index) {
            ports.push(PortReading {
                if_index: *if_index,
                name: format!("port {if_index}"),
                description: None,
                alias: None,
                admin_up: None,
                oper_up: None,
                speed_mbps: None,
                uplink: false,
                optics: OpticalReading::default(),
                read_at: read_at.to_string(),
            });
        }
    }
    ports.sort_by_key(|p| p.if_index);

    for port in &mut ports {
        let Some(port_raw) = raw.remove(&port.if_index) else {
            continue;
        };
        port.optics = normalize_optics(plan, port_raw, port.if_index, errors);
        if port.optics.rx_dbm.is_some() || port.optics.tx_dbm.is_some() {
            port.optics.severity = Some(cfg.thresholds.classify(port.optics.rx_dbm, port.optics.tx_dbm));
        }
    }
    ports
}

fn normalize_optics(
    plan: &ResolutionPlan,
    port_raw: PortRaw,
    if_index: u32,
    errors: &mut Vec<FieldError>,
) -> OpticalReading {
    let mut optics = OpticalReading::default();
    let sentinels = plan.sentinels.as_slice();

    let sensor_factor = match port_raw.sensor {
        Some((s, p)) => match normalize::entity_sensor_factor(s, p) {
            Ok(f) => Some(f),
            Err(e) => {
                errors.push(FieldError::new(e.field.clone(), ErrorKind::NormalizeError, e.reason).on_port(if_index));
                None
            }
        },
        None => None,
    };

    for (cap, raw) in port_raw.values {
        let kind = match cap {
            Capability::OpticalRx | Capability::OpticalTx => ValueKind::OpticalPower(plan.encoding),
            Capability::SfpVendor | Capability::SfpPartNumber | Capability::SfpSerial => ValueKind::Text,
            Capability::Temperature => ValueKind::Scaled(plan.temperature_scale),
            Capability::Voltage => ValueKind::Scaled(plan.voltage_scale),
            Capability::Identity | Capability::Uptime => continue,
        };

        let normalized = match (kind, sensor_factor) {
            (ValueKind::OpticalPower(PowerEncoding::EntitySensor), Some(f)) => match raw.as_i64() {
                Some(v) => Ok(NormalizedValue::Dbm(normalize::entity_sensor_dbm(v, f, sentinels))),
                None => normalize::normalize(&raw, kind, sentinels),
            },
            _ => normalize::normalize(&raw, kind, sentinels),
        };
        let value = match normalized {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(if_index, field = %cap, reason = %e.reason, "normalize failed");
                errors.push(FieldError::new(cap.to_string(), ErrorKind::NormalizeError, e.reason).on_port(if_index));
                continue;
            }
        };
        match (cap, value) {
            (Capability::OpticalRx, NormalizedValue::Dbm(m)) => optics.rx_dbm = Some(m),
            (Capability::OpticalTx, NormalizedValue::Dbm(m)) => optics.tx_dbm = Some(m),
            (Capability::SfpVendor, NormalizedValue::Text(t)) => optics.sfp_vendor = Some(t),
            (Capability::SfpPartNumber, NormalizedValue::Text(t)) => optics.part_number = Some(t),
            (Capability::SfpSerial, NormalizedValue::Text(t)) => optics.serial_number = Some(t),
            (Capability::Temperature, NormalizedValue::Number(n)) => optics.temperature_c = Some(n),
            (Capability::Voltage, NormalizedValue::Number(n)) => optics.voltage_v = Some(n),
            _ => {}
        }
    }
    optics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_reports_last_stage_on_timeout() {
        let t = StageTracker::new();
        assert_eq!(t.get(), DeviceState::Pending);
        t.mark_alive(true, true);
        t.set(DeviceState::ReadingValues);
        let dev = DeviceRef::new(7, "192.0.2.7".parse().unwrap());
        let out = t.timed_out(&dev, 30_000);
        assert_eq!(out.state, DeviceState::Done);
        assert!(out.alive && out.snmp_alive);
        assert!(!out.success);
        assert_eq!(out.errors[0].kind, ErrorKind::Timeout);
        assert!(out.errors[0].detail.contains("ReadingValues"));
    }
}
