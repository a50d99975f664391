//! Real network transport: ICMP echo via `surge-ping`, SNMP v2c via
//! `async-snmp` over one shared UDP socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use async_snmp::{Auth, Client as SnmpClient, SharedClient, SharedUdpTransport, Value};
use surge_ping::{Client as PingClient, Config, PingIdentifier, PingSequence, SurgeError, ICMP};
use tokio::time::{self, Instant};

use crate::oid::Oid;
use crate::probe::{RawValue, SnmpTarget, Transport, TransportError, VarBind};

pub struct NetTransport {
    snmp: SharedUdpTransport,
    icmp_v4: Option<PingClient>,
    icmp_v6: Option<PingClient>,
}

impl NetTransport {
    /// Bind the shared SNMP socket and open ICMP sockets. ICMP needs raw
    /// socket privileges; without them echo requests report `Unreachable`
    /// and liveness falls back to SNMP alone.
    pub async fn bind(snmp_bind: &str) -> Result<Self> {
        let snmp = SharedUdpTransport::bind(snmp_bind)
            .await
            .with_context(|| format!("failed to bind SNMP socket on {snmp_bind}"))?;
        let icmp_v4 = match PingClient::new(&Config::default()) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "ICMPv4 unavailable, liveness uses SNMP only");
                None
            }
        };
        let icmp_v6 = match PingClient::new(&Config::builder().kind(ICMP::V6).build()) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::debug!(error = %e, "ICMPv6 unavailable");
                None
            }
        };
        Ok(Self {
            snmp,
            icmp_v4,
            icmp_v6,
        })
    }

    fn client(&self, target: &SnmpTarget, timeout: Duration) -> Result<SharedClient, TransportError> {
        let addr = SocketAddr::new(target.ip, target.port);
        SnmpClient::builder(addr.to_string(), Auth::v2c(target.community.as_str()))
            .timeout(timeout)
            .retries(0)
            .build(self.snmp.handle(addr))
            .map_err(|e| TransportError::Unreachable(e.to_string()))
    }
}

fn to_snmp_oid(oid: &Oid) -> async_snmp::Oid {
    async_snmp::Oid::from_slice(oid.arcs())
}

fn from_snmp_oid(oid: &async_snmp::Oid) -> Result<Oid, TransportError> {
    oid.to_string()
        .parse()
        .map_err(|e| TransportError::Malformed(format!("response OID {oid}: {e}")))
}

fn raw_value(value: &Value) -> Result<RawValue, TransportError> {
    Ok(match value {
        Value::Integer(v) => RawValue::Integer(i64::from(*v)),
        Value::Counter32(v) | Value::Gauge32(v) => RawValue::Unsigned(u64::from(*v)),
        Value::Counter64(v) => RawValue::Unsigned(*v),
        Value::TimeTicks(v) => RawValue::TimeTicks(*v),
        Value::OctetString(b) => RawValue::OctetString(b.to_vec()),
        Value::ObjectIdentifier(o) => RawValue::ObjectId(from_snmp_oid(o)?),
        Value::IpAddress(a) => RawValue::IpAddress(*a),
        Value::Null => RawValue::Null,
        Value::NoSuchObject => RawValue::NoSuchObject,
        Value::NoSuchInstance => RawValue::NoSuchInstance,
        Value::EndOfMibView => RawValue::EndOfMibView,
        other => RawValue::OctetString(other.to_string().into_bytes()),
    })
}

fn snmp_error(e: async_snmp::Error) -> TransportError {
    match e {
        async_snmp::Error::Timeout { .. } => TransportError::Timeout,
        async_snmp::Error::Snmp { .. } => TransportError::Malformed(e.to_string()),
        other => TransportError::Unreachable(other.to_string()),
    }
}

fn convert(vb: async_snmp::VarBind) -> Result<VarBind, TransportError> {
    Ok(VarBind::new(from_snmp_oid(&vb.oid)?, raw_value(&vb.value)?))
}

#[async_trait::async_trait]
impl Transport for NetTransport {
    async fn icmp_echo(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, TransportError> {
        let client = match ip {
            IpAddr::V4(_) => self.icmp_v4.as_ref(),
            IpAddr::V6(_) => self.icmp_v6.as_ref(),
        }
        .ok_or_else(|| TransportError::Unreachable("ICMP socket unavailable".to_string()))?;

        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);
        let start = Instant::now();
        match time::timeout(timeout, pinger.ping(PingSequence(0), &[])).await {
            Ok(Ok((_, rtt))) => Ok(rtt),
            Ok(Err(SurgeError::Timeout { .. })) | Err(_) => {
                tracing::trace!(%ip, elapsed_ms = start.elapsed().as_millis() as u64, "echo timed out");
                Err(TransportError::Timeout)
            }
            Ok(Err(e)) => Err(TransportError::Unreachable(e.to_string())),
        }
    }

    async fn snmp_get(&self, target: &SnmpTarget, oid: &Oid, timeout: Duration) -> Result<VarBind, TransportError> {
        let client = self.client(target, timeout)?;
        let vb = client.get(&to_snmp_oid(oid)).await.map_err(snmp_error)?;
        convert(vb)
    }

    async fn snmp_get_next(&self, target: &SnmpTarget, oid: &Oid, timeout: Duration) -> Result<VarBind, TransportError> {
        let client = self.client(target, timeout)?;
        let vb = client.get_next(&to_snmp_oid(oid)).await.map_err(snmp_error)?;
        convert(vb)
    }
}
