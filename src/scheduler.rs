//! Batch scheduler: fixed-size batches run one after another, devices inside
//! a batch run concurrently behind a semaphore.
//!
//! Each device pipeline runs in its own task under `per_device_timeout`, so a
//! hung agent or a panic only ever costs that one device. Outcomes are handed
//! to the [`ResultSink`] as they complete and collected into a [`Report`].
//! Cycles may overlap, over disjoint or shared device sets; the sink orders
//! writes per device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::PollerConfig;
use crate::error::{CycleError, ErrorKind};
use crate::pipeline::{now_rfc3339, poll_device, PollContext, StageTracker};
use crate::probe::Transport;
use crate::resolver::OidResolver;
use crate::sink::ResultSink;
use crate::types::{DeviceRef, DeviceState, FieldError, PollOutcome, Report, Severity};

/// Upper bound on the semaphore regardless of configuration.
const MAX_IN_FLIGHT: usize = 5_000;

/// Live counters of the running cycle, shared with the HTTP status endpoint.
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub done: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    /// 1-based number of the batch in flight.
    pub batch: Arc<AtomicU64>,
    pub batches: Arc<AtomicU64>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub done: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batch: u64,
    pub batches: u64,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&self, total: u64, batches: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.batches.store(batches, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.batch.store(0, Ordering::Relaxed);
    }

    fn record(&self, outcome: &PollOutcome) {
        if outcome.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batch: self.batch.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Runs poll cycles. Cheap to clone; clones share transport, resolver and sink.
#[derive(Clone)]
pub struct Poller {
    transport: Arc<dyn Transport>,
    resolver: Arc<OidResolver>,
    sink: Arc<dyn ResultSink>,
}

impl Poller {
    pub fn new(transport: Arc<dyn Transport>, resolver: OidResolver, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            transport,
            resolver: Arc::new(resolver),
            sink,
        }
    }

    /// Poll every device once.
    ///
    /// Fails only when the configuration is invalid; per-device problems
    /// are reported in the outcomes. On
    /// cancellation, devices not yet dispatched are left out of the report
    /// and `cancelled` is set.
    pub async fn run_cycle(
        &self,
        devices: &[DeviceRef],
        config: &PollerConfig,
        cancel: CancellationToken,
        progress: Option<SharedProgress>,
    ) -> Result<Report, CycleError> {
        config.validate()?;

        let progress = progress.unwrap_or_default();
        let batch_count = devices.len().div_ceil(config.batch_size);
        progress.reset(devices.len() as u64, batch_count as u64);

        let ctx = PollContext {
            transport: self.transport.clone(),
            profiles: self.resolver.profiles().clone(),
            cache: Arc::new(self.resolver.build_cache()),
            config: Arc::new(config.clone()),
        };
        let sem = Arc::new(Semaphore::new(config.max_concurrency.clamp(1, MAX_IN_FLIGHT)));
        let start = Instant::now();
        let mut report = Report {
            total: devices.len() as u64,
            ..Default::default()
        };

        tracing::info!(
            devices = devices.len(),
            batches = batch_count,
            batch_size = config.batch_size,
            concurrency = config.max_concurrency,
            "poll cycle started"
        );

        for (n, batch) in devices.chunks(config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if n > 0 && !config.inter_batch_pause.is_zero() {
                tokio::select! {
                    _ = time::sleep(config.inter_batch_pause) => {}
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                }
            }

            progress.batch.store(n as u64 + 1, Ordering::Relaxed);
            let batch_start = Instant::now();
            let (outcomes, stopped) = self.run_batch(&ctx, batch, &sem, &cancel, &progress).await;
            let batch_ms = batch_start.elapsed().as_millis() as u64;

            let ok = outcomes.iter().filter(|o| o.success).count();
            tracing::info!(
                batch = n + 1,
                devices = outcomes.len(),
                succeeded = ok,
                failed = outcomes.len() - ok,
                elapsed_ms = batch_ms,
                "batch finished"
            );
            report.batches += 1;
            report.batch_elapsed_ms.push(batch_ms);
            report.outcomes.extend(outcomes);
            if stopped {
                report.cancelled = true;
                break;
            }
        }

        finalize(&mut report, start);
        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "poll cycle finished"
        );
        Ok(report)
    }

    /// Run one batch to completion. Returns the outcomes and whether
    /// dispatch stopped early on cancellation.
    async fn run_batch(
        &self,
        ctx: &PollContext,
        batch: &[DeviceRef],
        sem: &Arc<Semaphore>,
        cancel: &CancellationToken,
        progress: &SharedProgress,
    ) -> (Vec<PollOutcome>, bool) {
        let mut set = JoinSet::new();
        let mut pending: HashMap<u64, DeviceRef> = HashMap::new();
        let mut stopped = false;

        for device in batch {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped = true;
                    break;
                }
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        stopped = true;
                        break;
                    }
                },
            };
            pending.insert(device.id, device.clone());

            let ctx = ctx.clone();
            let device = device.clone();
            let sink = self.sink.clone();
            let progress = progress.clone();
            set.spawn(async move {
                let _permit = permit;
                let outcome = poll_isolated(ctx, device).await;
                if let Err(e) = sink.apply(&outcome).await {
                    tracing::warn!(ip = %outcome.ip, device = outcome.device_id, error = %e, "sink rejected outcome");
                }
                progress.record(&outcome);
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(res) = set.join_next().await {
            match res {
                Ok(outcome) => {
                    pending.remove(&outcome.device_id);
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!(error = %e, "device task failed"),
            }
        }

        // Tasks that died outside the pipeline still count as failed devices.
        for device in pending.into_values() {
            let outcome = failed_outcome(&device, "device task ended without an outcome".to_string());
            if let Err(e) = self.sink.apply(&outcome).await {
                tracing::warn!(ip = %device.ip, device = device.id, error = %e, "sink rejected outcome");
            }
            progress.record(&outcome);
            outcomes.push(outcome);
        }
        (outcomes, stopped)
    }
}

/// Run one device pipeline in its own task, bounded by the per-device
/// timeout. Panics and timeouts become failed outcomes.
async fn poll_isolated(ctx: PollContext, device: DeviceRef) -> PollOutcome {
    let deadline = ctx.config.per_device_timeout;
    let tracker = StageTracker::new();
    let start = Instant::now();

    let task = {
        let tracker = tracker.clone();
        let device = device.clone();
        tokio::spawn(async move { poll_device(&ctx, &device, &tracker).await })
    };
    let abort = task.abort_handle();

    match time::timeout(deadline, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!(ip = %device.ip, device = device.id, error = %e, "device pipeline panicked");
            failed_outcome(&device, format!("pipeline aborted: {e}"))
        }
        Err(_) => {
            abort.abort();
            let elapsed_ms = start.elapsed().as_millis() as u64;
            tracing::warn!(
                ip = %device.ip,
                device = device.id,
                stage = ?tracker.get(),
                elapsed_ms,
                "per-device timeout"
            );
            tracker.timed_out(&device, elapsed_ms)
        }
    }
}

fn failed_outcome(device: &DeviceRef, detail: String) -> PollOutcome {
    let mut out = PollOutcome::empty(device, now_rfc3339());
    out.state = DeviceState::Done;
    out.errors.push(FieldError::new("device", ErrorKind::MalformedResponse, detail));
    out
}

fn finalize(report: &mut Report, start: Instant) {
    report.outcomes.sort_by_key(|o| o.device_id);
    report.succeeded = report.outcomes.iter().filter(|o| o.success).count() as u64;
    report.failed = report.outcomes.len() as u64 - report.succeeded;
    for port in report.outcomes.iter().flat_map(|o| &o.ports) {
        match port.optics.severity {
            Some(Severity::Warning) => report.ports_warning += 1,
            Some(Severity::Critical) => report.ports_critical += 1,
            _ => {}
        }
    }
    report.elapsed_ms = start.elapsed().as_millis() as u64;
}
