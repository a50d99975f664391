//! Transport probe: one reachability check, SNMP GET or SNMP WALK against a
//! single device.
//!
//! Network failures never surface as `Err`: a probe that times out or cannot
//! reach the target returns a [`ProbeResult`] with `reachable == false`, and
//! the caller decides what that means for the device. Retries live here and
//! nowhere else.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{self, Instant};

use crate::error::ErrorKind;
use crate::oid::Oid;

/// Pause before retry `n` is `RETRY_BACKOFF * n`.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A decoded SNMP value, independent of the client library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum RawValue {
    Integer(i64),
    Unsigned(u64),
    TimeTicks(u32),
    OctetString(Vec<u8>),
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Null,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl RawValue {
    /// True for values that carry no data (`Null`, `noSuchObject`,
    /// `noSuchInstance`, `endOfMibView`).
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            RawValue::Null | RawValue::NoSuchObject | RawValue::NoSuchInstance | RawValue::EndOfMibView
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Integer(v) => Some(*v),
            RawValue::Unsigned(v) => i64::try_from(*v).ok(),
            RawValue::TimeTicks(v) => Some(i64::from(*v)),
            RawValue::OctetString(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::OctetString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            RawValue::Integer(v) => Some(v.to_string()),
            RawValue::Unsigned(v) => Some(v.to_string()),
            RawValue::TimeTicks(v) => Some(v.to_string()),
            RawValue::ObjectId(oid) => Some(oid.to_string()),
            RawValue::IpAddress(a) => Some(IpAddr::from(*a).to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => f.write_str("null"),
            RawValue::NoSuchObject => f.write_str("noSuchObject"),
            RawValue::NoSuchInstance => f.write_str("noSuchInstance"),
            RawValue::EndOfMibView => f.write_str("endOfMibView"),
            other => f.write_str(&other.as_text().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarBind {
    pub oid: Oid,
    pub value: RawValue,
}

impl VarBind {
    pub fn new(oid: Oid, value: RawValue) -> Self {
        Self { oid, value }
    }
}

/// SNMPv2c addressing for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub community: String,
}

impl SnmpTarget {
    pub fn new(ip: IpAddr, port: u16, community: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            community: community.into(),
        }
    }
}

/// Failure of a single network request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("target unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::Unreachable(_) => ErrorKind::Unreachable,
            TransportError::Malformed(_) => ErrorKind::MalformedResponse,
        }
    }
}

/// Single-shot network primitives. Implementations perform exactly one
/// attempt per call; retry policy belongs to [`probe`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// ICMP echo; returns the round-trip time.
    async fn icmp_echo(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, TransportError>;

    async fn snmp_get(
        &self,
        target: &SnmpTarget,
        oid: &Oid,
        timeout: Duration,
    ) -> Result<VarBind, TransportError>;

    async fn snmp_get_next(
        &self,
        target: &SnmpTarget,
        oid: &Oid,
        timeout: Duration,
    ) -> Result<VarBind, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeMethod {
    Icmp,
    SnmpGet(Oid),
    SnmpWalk(Oid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeValue {
    Scalar(VarBind),
    Table(Vec<VarBind>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub latency: Duration,
    pub raw_value: Option<ProbeValue>,
    pub error: Option<ErrorKind>,
    pub detail: Option<String>,
}

impl ProbeResult {
    fn failed(latency: Duration, err: &TransportError) -> Self {
        Self {
            reachable: false,
            latency,
            raw_value: None,
            error: Some(err.kind()),
            detail: Some(err.to_string()),
        }
    }

    /// The scalar value of a GET probe, if any.
    pub fn scalar(&self) -> Option<&RawValue> {
        match &self.raw_value {
            Some(ProbeValue::Scalar(vb)) => Some(&vb.value),
            _ => None,
        }
    }

    /// Rows of a WALK probe; empty for anything else.
    pub fn rows(&self) -> &[VarBind] {
        match &self.raw_value {
            Some(ProbeValue::Table(rows)) => rows,
            _ => &[],
        }
    }
}

/// Per-call probe settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub retries: u8,
    /// Upper bound on rows collected by a walk.
    pub max_rows: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retries: 1,
            max_rows: 10_000,
        }
    }
}

async fn with_retries<T, F, Fut>(retries: u8, mut attempt: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>>,
{
    let mut last = TransportError::Timeout;
    for n in 0..=u32::from(retries) {
        if n > 0 {
            time::sleep(RETRY_BACKOFF * n).await;
        }
        match attempt().await {
            Ok(v) => return Ok(v),
            // A malformed reply will not improve on resend.
            Err(e @ TransportError::Malformed(_)) => return Err(e),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Run one probe against `target`.
pub async fn probe(
    transport: &Arc<dyn Transport>,
    target: &SnmpTarget,
    method: &ProbeMethod,
    opts: ProbeOptions,
) -> ProbeResult {
    let start = Instant::now();
    match method {
        ProbeMethod::Icmp => {
            match with_retries(opts.retries, || transport.icmp_echo(target.ip, opts.timeout)).await {
                Ok(rtt) => ProbeResult {
                    reachable: true,
                    latency: rtt,
                    raw_value: None,
                    error: None,
                    detail: None,
                },
                Err(e) => ProbeResult::failed(start.elapsed(), &e),
            }
        }
        ProbeMethod::SnmpGet(oid) => {
            match with_retries(opts.retries, || transport.snmp_get(target, oid, opts.timeout)).await {
                Ok(vb) => ProbeResult {
                    reachable: true,
                    latency: start.elapsed(),
                    raw_value: Some(ProbeValue::Scalar(vb)),
                    error: None,
                    detail: None,
                },
                Err(e) => ProbeResult::failed(start.elapsed(), &e),
            }
        }
        ProbeMethod::SnmpWalk(base) => walk(transport, target, base, opts, start).await,
    }
}

/// GETNEXT walk of the subtree under `base`. Stops at the end of the
/// subtree, at `endOfMibView`, on a non-increasing OID, or at `max_rows`.
/// A failure after the first row keeps the rows collected so far.
async fn walk(
    transport: &Arc<dyn Transport>,
    target: &SnmpTarget,
    base: &Oid,
    opts: ProbeOptions,
    start: Instant,
) -> ProbeResult {
    let mut rows: Vec<VarBind> = Vec::new();
    let mut cursor = base.clone();
    let mut error = None;
    let mut detail = None;

    loop {
        if rows.len() >= opts.max_rows {
            tracing::debug!(ip = %target.ip, base = %base, rows = rows.len(), "walk row limit reached");
            break;
        }
        let next = with_retries(opts.retries, || {
            transport.snmp_get_next(target, &cursor, opts.timeout)
        })
        .await;
        let vb = match next {
            Ok(vb) => vb,
            Err(e) if rows.is_empty() => return ProbeResult::failed(start.elapsed(), &e),
            Err(e) => {
                tracing::debug!(ip = %target.ip, base = %base, error = %e, "walk interrupted");
                error = Some(e.kind());
                detail = Some(e.to_string());
                break;
            }
        };
        if vb.value.is_absent() || !vb.oid.starts_with(base) || vb.oid <= cursor {
            break;
        }
        cursor = vb.oid.clone();
        rows.push(vb);
    }

    ProbeResult {
        reachable: true,
        latency: start.elapsed(),
        raw_value: Some(ProbeValue::Table(rows)),
        error,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Table-backed agent that fails the first `fail_first` requests.
    struct ScriptedAgent {
        table: BTreeMap<Oid, RawValue>,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl ScriptedAgent {
        fn new(rows: &[(&str, RawValue)], fail_first: u32) -> Self {
            let table = rows
                .iter()
                .map(|(o, v)| (o.parse().unwrap(), v.clone()))
                .collect();
            Self {
                table,
                fail_first,
                calls: AtomicU32::new(0),
            }
        }

        fn gate(&self) -> Result<(), TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(TransportError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedAgent {
        async fn icmp_echo(&self, _ip: IpAddr, _t: Duration) -> Result<Duration, TransportError> {
            self.gate()?;
            Ok(Duration::from_millis(3))
        }

        async fn snmp_get(&self, _t: &SnmpTarget, oid: &Oid, _d: Duration) -> Result<VarBind, TransportError> {
            self.gate()?;
            let value = self.table.get(oid).cloned().unwrap_or(RawValue::NoSuchInstance);
            Ok(VarBind::new(oid.clone(), value))
        }

        async fn snmp_get_next(&self, _t: &SnmpTarget, oid: &Oid, _d: Duration) -> Result<VarBind, TransportError> {
            self.gate()?;
            let next = self
                .table
                .range((std::ops::Bound::Excluded(oid.clone()), std::ops::Bound::Unbounded))
                .next();
            Ok(match next {
                Some((o, v)) => VarBind::new(o.clone(), v.clone()),
                None => VarBind::new(oid.clone(), RawValue::EndOfMibView),
            })
        }
    }

    fn target() -> SnmpTarget {
        SnmpTarget::new("192.0.2.1".parse().unwrap(), 161, "public")
    }

    fn opts(retries: u8) -> ProbeOptions {
        ProbeOptions {
            timeout: Duration::from_millis(100),
            retries,
            max_rows: 100,
        }
    }

    #[tokio::test]
    async fn get_retries_then_succeeds() {
        let agent: Arc<dyn Transport> = Arc::new(ScriptedAgent::new(
            &[("1.3.6.1.2.1.1.3.0", RawValue::TimeTicks(500))],
            1,
        ));
        let res = probe(&agent, &target(), &ProbeMethod::SnmpGet("1.3.6.1.2.1.1.3.0".parse().unwrap()), opts(1)).await;
        assert!(res.reachable);
        assert_eq!(res.scalar(), Some(&RawValue::TimeTicks(500)));
    }

    #[tokio::test]
    async fn exhausted_retries_report_timeout_without_error_return() {
        let agent: Arc<dyn Transport> = Arc::new(ScriptedAgent::new(&[], 10));
        let res = probe(&agent, &target(), &ProbeMethod::Icmp, opts(2)).await;
        assert!(!res.reachable);
        assert_eq!(res.error, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn walk_stays_inside_subtree() {
        let agent: Arc<dyn Transport> = Arc::new(ScriptedAgent::new(
            &[
                ("1.3.6.1.2.1.2.2.1.2.1", RawValue::OctetString(b"ge1".to_vec())),
                ("1.3.6.1.2.1.2.2.1.2.2", RawValue::OctetString(b"ge2".to_vec())),
                ("1.3.6.1.2.1.2.2.1.3.1", RawValue::Integer(6)),
            ],
            0,
        ));
        let base: Oid = "1.3.6.1.2.1.2.2.1.2".parse().unwrap();
        let res = probe(&agent, &target(), &ProbeMethod::SnmpWalk(base), opts(0)).await;
        assert!(res.reachable);
        assert_eq!(res.rows().len(), 2);
        assert_eq!(res.rows()[1].value, RawValue::OctetString(b"ge2".to_vec()));
    }

    #[tokio::test]
    async fn walk_honours_row_limit() {
        let rows: Vec<(String, RawValue)> = (1..=20)
            .map(|i| (format!("1.3.6.1.2.1.2.2.1.2.{i}"), RawValue::Integer(i)))
            .collect();
        let borrowed: Vec<(&str, RawValue)> = rows.iter().map(|(o, v)| (o.as_str(), v.clone())).collect();
        let agent: Arc<dyn Transport> = Arc::new(ScriptedAgent::new(&borrowed, 0));
        let mut o = opts(0);
        o.max_rows = 5;
        let res = probe(&agent, &target(), &ProbeMethod::SnmpWalk("1.3.6.1.2.1.2.2.1.2".parse().unwrap()), o).await;
        assert_eq!(res.rows().len(), 5);
    }

    #[test]
    fn absent_values() {
        assert!(RawValue::NoSuchObject.is_absent());
        assert!(RawValue::Null.is_absent());
        assert!(!RawValue::Integer(0).is_absent());
        assert_eq!(RawValue::OctetString(b" -1250 ".to_vec()).as_i64(), Some(-1250));
    }
}
