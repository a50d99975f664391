mod common;

use std::time::Duration;

use optic_poll_rs::error::{ConfigError, CycleError, ErrorKind};
use optic_poll_rs::sink::MemorySink;
use optic_poll_rs::types::{DeviceState, Identity, Measured, OpticalReading, Report, Severity, UptimeReading};
use tokio_util::sync::CancellationToken;

use common::{Behavior, MockNetwork};

async fn run(net: std::sync::Arc<MockNetwork>, n: u32, cfg: &optic_poll_rs::config::PollerConfig) -> (Report, MemorySink) {
    let devices = common::devices(n);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net, &sink);
    let report = poller
        .run_cycle(&devices, cfg, CancellationToken::new(), None)
        .await
        .expect("cycle runs");
    (report, sink)
}

#[tokio::test]
async fn hundred_twenty_devices_run_in_three_batches() {
    let net = MockNetwork::new(common::healthy());
    let mut cfg = common::config();
    cfg.batch_size = 50;
    cfg.max_concurrency = 20;

    let (report, _) = run(net, 120, &cfg).await;
    assert_eq!(report.total, 120);
    assert_eq!(report.batches, 3);
    assert_eq!(report.batch_elapsed_ms.len(), 3);
    assert_eq!(report.succeeded + report.failed, 120);
    assert_eq!(report.succeeded, 120);
    assert!(!report.cancelled);
    let ids: Vec<u64> = report.outcomes.iter().map(|o| o.device_id).collect();
    assert_eq!(ids, (1..=120).collect::<Vec<u64>>());
}

#[tokio::test]
async fn healthy_device_reports_normalized_optics() {
    let net = MockNetwork::new(common::healthy());
    let (report, sink) = run(net, 1, &common::config()).await;

    let o = &report.outcomes[0];
    assert!(o.success && o.alive && o.icmp_alive && o.snmp_alive);
    assert_eq!(o.state, DeviceState::Done);
    assert!(o.optical_supported);
    assert!(o.errors.is_empty(), "unexpected errors: {:?}", o.errors);
    let identity = o.identity.as_ref().unwrap();
    assert_eq!(identity.vendor.as_deref(), Some("Acme"));
    assert_eq!(identity.sys_name.as_deref(), Some("sw-core"));
    assert_eq!(o.uptime.as_ref().unwrap().display, "1 days, 0 hours");

    // The VLAN interface is filtered out.
    assert_eq!(o.ports.len(), 1);
    let port = &o.ports[0];
    assert_eq!(port.if_index, 1);
    assert_eq!(port.optics.rx_dbm, Some(Measured::Value(-12.5)));
    assert_eq!(port.optics.tx_dbm, Some(Measured::Value(-10.0)));
    assert_eq!(port.optics.severity, Some(Severity::Normal));

    let rec = sink.get(1).await.unwrap();
    assert_eq!(rec.alive, Some(true));
    assert_eq!(rec.ports[&1].optics.rx_dbm, Some(Measured::Value(-12.5)));
}

#[tokio::test]
async fn hung_devices_do_not_affect_siblings() {
    let net = MockNetwork::new(common::healthy());
    let devices = common::devices(30);
    for d in devices.iter().filter(|d| d.id % 10 == 0) {
        net.set(d.ip, Behavior::Hang);
    }
    let mut cfg = common::config();
    cfg.batch_size = 10;
    cfg.max_concurrency = 5;
    cfg.per_device_timeout = Duration::from_millis(300);

    let (report, _) = run(net, 30, &cfg).await;
    assert_eq!(report.succeeded, 27);
    assert_eq!(report.failed, 3);
    for o in &report.outcomes {
        if o.device_id % 10 == 0 {
            assert!(!o.success);
            assert_eq!(o.state, DeviceState::Done);
            assert_eq!(o.errors[0].kind, ErrorKind::Timeout);
        } else {
            assert!(o.success, "device {} failed: {:?}", o.device_id, o.errors);
        }
    }
}

type Normalized = Vec<(u64, bool, Option<Identity>, Option<UptimeReading>, Vec<(u32, OpticalReading)>)>;

fn normalized(report: &Report) -> Normalized {
    report
        .outcomes
        .iter()
        .map(|o| {
            (
                o.device_id,
                o.success,
                o.identity.clone(),
                o.uptime.clone(),
                o.ports.iter().map(|p| (p.if_index, p.optics.clone())).collect(),
            )
        })
        .collect()
}

#[tokio::test]
async fn repeated_cycles_give_identical_output() {
    let net = MockNetwork::new(common::healthy());
    let devices = common::devices(12);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net, &sink);
    let mut cfg = common::config();
    cfg.batch_size = 5;

    let first = poller.run_cycle(&devices, &cfg, CancellationToken::new(), None).await.unwrap();
    let after_first = sink.snapshot().await;
    let second = poller.run_cycle(&devices, &cfg, CancellationToken::new(), None).await.unwrap();
    let after_second = sink.snapshot().await;

    assert_eq!(first.succeeded, 12);
    assert!(first.outcomes.iter().all(|o| o.snmp_alive && !o.ports.is_empty()));
    assert_eq!(normalized(&first), normalized(&second));
    let ports = |recs: &[optic_poll_rs::sink::DeviceRecord]| {
        recs.iter()
            .map(|r| r.ports.values().map(|p| p.optics.clone()).collect::<Vec<_>>())
            .collect::<Vec<_>>()
    };
    assert_eq!(ports(&after_first), ports(&after_second));
}

#[tokio::test]
async fn unreachable_device_keeps_last_known_optics() {
    let net = MockNetwork::new(common::healthy());
    let devices = common::devices(1);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net.clone(), &sink);
    let cfg = common::config();

    poller.run_cycle(&devices, &cfg, CancellationToken::new(), None).await.unwrap();
    let before = sink.get(1).await.unwrap();

    net.set(devices[0].ip, Behavior::Down);
    let report = poller.run_cycle(&devices, &cfg, CancellationToken::new(), None).await.unwrap();
    let o = &report.outcomes[0];
    assert!(!o.success && !o.alive && !o.snmp_alive);
    assert_eq!(o.state, DeviceState::Done);
    assert!(o.errors.iter().any(|e| e.kind == ErrorKind::Timeout));

    let after = sink.get(1).await.unwrap();
    assert_eq!(after.alive, Some(false));
    assert_eq!(after.vendor, before.vendor);
    assert_eq!(after.uptime, before.uptime);
    assert_eq!(after.ports, before.ports);
    assert_eq!(after.ports[&1].optics.rx_dbm, Some(Measured::Value(-12.5)));
}

#[tokio::test]
async fn profile_without_optics_omits_fields_without_error() {
    let net = MockNetwork::new(Behavior::agent(common::switch_table(common::PLAIN_ENTERPRISE, -1250, -1000)));
    let (report, _) = run(net, 1, &common::config()).await;

    let o = &report.outcomes[0];
    assert!(o.success);
    assert_eq!(o.identity.as_ref().unwrap().vendor.as_deref(), Some("Plain"));
    assert!(!o.optical_supported);
    assert!(o.errors.is_empty(), "unexpected errors: {:?}", o.errors);
    assert!(o.ports.iter().all(|p| p.optics.is_empty() && p.optics.severity.is_none()));
}

#[tokio::test]
async fn no_module_sentinel_reads_unknown_not_zero() {
    let net = MockNetwork::new(Behavior::agent(common::switch_table(common::ACME_ENTERPRISE, -40_000, -1000)));
    let (report, _) = run(net, 1, &common::config()).await;

    let port = &report.outcomes[0].ports[0];
    assert_eq!(port.optics.rx_dbm, Some(Measured::Unknown));
    assert_eq!(port.optics.tx_dbm, Some(Measured::Value(-10.0)));
    assert_eq!(port.optics.severity, Some(Severity::Normal));
}

#[tokio::test]
async fn concurrency_stays_within_limit() {
    let net = MockNetwork::new(Behavior::slow(
        common::switch_table(common::ACME_ENTERPRISE, -1250, -1000),
        Duration::from_millis(2),
    ));
    let mut cfg = common::config();
    cfg.batch_size = 20;
    cfg.max_concurrency = 4;

    let (report, _) = run(net.clone(), 20, &cfg).await;
    assert_eq!(report.succeeded, 20);
    assert!(net.max_in_flight() <= 4, "saw {} in flight", net.max_in_flight());
}

#[tokio::test]
async fn invalid_config_aborts_the_cycle() {
    let net = MockNetwork::new(common::healthy());
    let sink = MemorySink::new();
    let poller = common::poller(net, &sink);
    let mut cfg = common::config();
    cfg.batch_size = 0;

    let err = poller
        .run_cycle(&common::devices(3), &cfg, CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CycleError::InvalidConfig(ConfigError::Zero { field: "batch_size" })
    ));
}

#[tokio::test]
async fn cancelled_cycle_dispatches_nothing() {
    let net = MockNetwork::new(common::healthy());
    let devices = common::devices(10);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net, &sink);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = poller.run_cycle(&devices, &common::config(), cancel, None).await.unwrap();
    assert!(report.cancelled);
    assert!(report.outcomes.is_empty());
    assert_eq!(report.total, 10);
    assert!(sink.snapshot().await.iter().all(|r| r.last_poll.is_none()));
}

#[tokio::test]
async fn partial_read_keeps_unread_optics() {
    let net = MockNetwork::new(common::healthy());
    let devices = common::devices(1);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net.clone(), &sink);
    let cfg = common::config();

    poller.run_cycle(&devices, &cfg, CancellationToken::new(), None).await.unwrap();

    let mut table = common::switch_table(common::ACME_ENTERPRISE, -1400, -1000);
    table.remove(&common::oid(common::ACME_TX).child(1));
    net.set(devices[0].ip, Behavior::agent(table));
    let report = poller.run_cycle(&devices, &cfg, CancellationToken::new(), None).await.unwrap();

    let port = &report.outcomes[0].ports[0];
    assert!(report.outcomes[0].success);
    assert_eq!(port.optics.rx_dbm, Some(Measured::Value(-14.0)));
    assert_eq!(port.optics.tx_dbm, None);

    let rec = sink.get(1).await.unwrap();
    assert_eq!(rec.ports[&1].optics.rx_dbm, Some(Measured::Value(-14.0)));
    assert_eq!(rec.ports[&1].optics.tx_dbm, Some(Measured::Value(-10.0)));
    assert_eq!(rec.ports[&1].optics.severity, Some(Severity::Normal));
}

#[tokio::test]
async fn overlapping_cycles_run_side_by_side() {
    let net = MockNetwork::new(Behavior::slow(
        common::switch_table(common::ACME_ENTERPRISE, -1250, -1000),
        Duration::from_millis(5),
    ));
    let devices = common::devices(25);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net, &sink);
    let cfg = common::config();

    // Disjoint sets.
    let (a, b) = tokio::join!(
        poller.run_cycle(&devices[..10], &cfg, CancellationToken::new(), None),
        poller.run_cycle(&devices[10..20], &cfg, CancellationToken::new(), None),
    );
    let (a, b) = (a.expect("first cycle runs"), b.expect("second cycle runs"));
    assert_eq!((a.succeeded, b.succeeded), (10, 10));

    // Shared devices 15..20; the sink keeps one record each.
    let (c, d) = tokio::join!(
        poller.run_cycle(&devices[5..20], &cfg, CancellationToken::new(), None),
        poller.run_cycle(&devices[15..], &cfg, CancellationToken::new(), None),
    );
    let (c, d) = (c.expect("third cycle runs"), d.expect("fourth cycle runs"));
    assert_eq!((c.succeeded, d.succeeded), (15, 10));

    let records = sink.snapshot().await;
    assert_eq!(records.len(), 25);
    for rec in &records {
        assert_eq!(rec.alive, Some(true), "device {}", rec.id);
        assert_eq!(rec.ports[&1].optics.rx_dbm, Some(Measured::Value(-12.5)));
    }
}
