#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use optic_poll_rs::config::PollerConfig;
use optic_poll_rs::mib::MibRegistry;
use optic_poll_rs::normalize::PowerEncoding;
use optic_poll_rs::oid::{known, Oid};
use optic_poll_rs::probe::{RawValue, SnmpTarget, Transport, TransportError, VarBind};
use optic_poll_rs::resolver::OidResolver;
use optic_poll_rs::scheduler::Poller;
use optic_poll_rs::sink::MemorySink;
use optic_poll_rs::types::DeviceRef;
use optic_poll_rs::vendor::{Capability, OidSource, ProfileTable, VendorProfile};

pub const ACME_ENTERPRISE: &str = "1.3.6.1.4.1.99999";
pub const ACME_RX: &str = "1.3.6.1.4.1.99999.2.1.1";
pub const ACME_TX: &str = "1.3.6.1.4.1.99999.2.1.2";
pub const PLAIN_ENTERPRISE: &str = "1.3.6.1.4.1.88888";

#[derive(Clone)]
pub enum Behavior {
    /// Answers from a MIB table after `delay`.
    Agent {
        table: Arc<BTreeMap<Oid, RawValue>>,
        delay: Duration,
    },
    /// Every request times out immediately.
    Down,
    /// Never answers.
    Hang,
}

impl Behavior {
    pub fn agent(table: BTreeMap<Oid, RawValue>) -> Self {
        Behavior::Agent {
            table: Arc::new(table),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(table: BTreeMap<Oid, RawValue>, delay: Duration) -> Self {
        Behavior::Agent {
            table: Arc::new(table),
            delay,
        }
    }
}

/// Scripted network of SNMP agents keyed by IP.
pub struct MockNetwork {
    default: Behavior,
    overrides: RwLock<HashMap<IpAddr, Behavior>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockNetwork {
    pub fn new(default: Behavior) -> Arc<Self> {
        Arc::new(Self {
            default,
            overrides: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, ip: IpAddr, behavior: Behavior) {
        self.overrides.write().unwrap().insert(ip, behavior);
    }

    /// Highest number of SNMP requests seen in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn behavior(&self, ip: IpAddr) -> Behavior {
        self.overrides
            .read()
            .unwrap()
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    async fn answer<F>(&self, ip: IpAddr, lookup: F) -> Result<VarBind, TransportError>
    where
        F: FnOnce(&BTreeMap<Oid, RawValue>) -> VarBind,
    {
        match self.behavior(ip) {
            Behavior::Down => Err(TransportError::Timeout),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Timeout)
            }
            Behavior::Agent { table, delay } => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let vb = lookup(&table);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(vb)
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockNetwork {
    async fn icmp_echo(&self, ip: IpAddr, _timeout: Duration) -> Result<Duration, TransportError> {
        match self.behavior(ip) {
            Behavior::Agent { .. } => Ok(Duration::from_millis(1)),
            Behavior::Down => Err(TransportError::Timeout),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn snmp_get(&self, target: &SnmpTarget, oid: &Oid, _timeout: Duration) -> Result<VarBind, TransportError> {
        self.answer(target.ip, |table| {
            let value = table.get(oid).cloned().unwrap_or(RawValue::NoSuchObject);
            VarBind::new(oid.clone(), value)
        })
        .await
    }

    async fn snmp_get_next(&self, target: &SnmpTarget, oid: &Oid, _timeout: Duration) -> Result<VarBind, TransportError> {
        self.answer(target.ip, |table| {
            let next = table
                .range((std::ops::Bound::Excluded(oid.clone()), std::ops::Bound::Unbounded))
                .next();
            match next {
                Some((o, v)) => VarBind::new(o.clone(), v.clone()),
                None => VarBind::new(oid.clone(), RawValue::EndOfMibView),
            }
        })
        .await
    }
}

pub fn oid(s: &str) -> Oid {
    s.parse().unwrap()
}

fn text(s: &str) -> RawValue {
    RawValue::OctetString(s.as_bytes().to_vec())
}

/// Two-interface switch: one fibre uplink (ifIndex 1) and a VLAN interface.
/// Optical columns are in hundredths of a dBm.
pub fn switch_table(enterprise: &str, rx: i64, tx: i64) -> BTreeMap<Oid, RawValue> {
    let mut t = BTreeMap::new();
    t.insert(known::sys_descr(), text("Acme AS-100 Switch"));
    t.insert(known::sys_object_id(), RawValue::ObjectId(oid(&format!("{enterprise}.1"))));
    t.insert(known::sys_uptime(), RawValue::TimeTicks(8_640_000));
    t.insert(known::sys_name(), text("sw-core"));

    t.insert(known::if_descr().child(1), text("gi1/0/1"));
    t.insert(known::if_type().child(1), RawValue::Integer(6));
    t.insert(known::if_speed().child(1), RawValue::Unsigned(1_000_000_000));
    t.insert(known::if_admin_status().child(1), RawValue::Integer(1));
    t.insert(known::if_oper_status().child(1), RawValue::Integer(1));
    t.insert(known::if_name().child(1), text("gi1/0/1"));
    t.insert(known::if_high_speed().child(1), RawValue::Unsigned(1000));

    t.insert(known::if_descr().child(2), text("Vlan1"));
    t.insert(known::if_type().child(2), RawValue::Integer(53));
    t.insert(known::if_name().child(2), text("Vlan1"));

    t.insert(oid(ACME_RX).child(1), RawValue::Integer(rx));
    t.insert(oid(ACME_TX).child(1), RawValue::Integer(tx));
    t
}

/// Healthy optics: rx -12.50 dBm, tx -10.00 dBm.
pub fn healthy() -> Behavior {
    Behavior::agent(switch_table(ACME_ENTERPRISE, -1250, -1000))
}

pub fn profiles() -> ProfileTable {
    let mut acme = VendorProfile::new("Acme");
    acme.enterprise_prefixes = vec![oid(ACME_ENTERPRISE)];
    acme.power_encoding = PowerEncoding::CentiDbm;
    acme.capabilities
        .insert(Capability::OpticalRx, vec![OidSource::Static(oid(ACME_RX))]);
    acme.capabilities
        .insert(Capability::OpticalTx, vec![OidSource::Static(oid(ACME_TX))]);

    // Identified, but without any DDM table.
    let mut plain = VendorProfile::new("Plain");
    plain.enterprise_prefixes = vec![oid(PLAIN_ENTERPRISE)];

    ProfileTable::new(vec![acme, plain]).unwrap()
}

pub fn devices(n: u32) -> Vec<DeviceRef> {
    (0..n)
        .map(|i| DeviceRef::new(u64::from(i) + 1, IpAddr::V4(Ipv4Addr::from(0x0A00_0001 + i))))
        .collect()
}

/// Fast settings: no retries, short timeouts.
pub fn config() -> PollerConfig {
    PollerConfig {
        per_device_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(100),
        retries: 0,
        ..Default::default()
    }
}

pub fn poller(net: Arc<MockNetwork>, sink: &MemorySink) -> Poller {
    let resolver = OidResolver::new(Arc::new(profiles()), Arc::new(MibRegistry::with_core()));
    Poller::new(net, resolver, Arc::new(sink.clone()))
}
