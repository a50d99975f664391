use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{
    config::PollerConfig,
    error::CycleError,
    scheduler::{Poller, SharedProgress},
    sink::MemorySink,
    types::{DeviceRef, Report},
};

/// Shared between the HTTP handlers and the CLI poll loop, so both see the
/// same progress counters and last report.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
    running: Arc<AtomicBool>,
    poller: Poller,
    sink: MemorySink,
    devices: Arc<Vec<DeviceRef>>,
    config: Arc<PollerConfig>,
    progress: SharedProgress,
    shutdown: CancellationToken,
}

#[derive(Debug, Default)]
struct ServerState {
    report: Option<Report>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Status {
    pub state: String, // "idle" | "running" | "done"
    pub total: u64,
    pub done: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batch: u64,
    pub batches: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Clears the running flag when the cycle ends, however it ends.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

impl AppState {
    pub fn new(
        poller: Poller,
        sink: MemorySink,
        devices: Vec<DeviceRef>,
        config: PollerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            running: Arc::new(AtomicBool::new(false)),
            poller,
            sink,
            devices: Arc::new(devices),
            config: Arc::new(config),
            progress: SharedProgress::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run one cycle and keep its report. Rejected while another cycle
    /// started through this state is still running.
    pub async fn poll_once(&self) -> Result<Report, CycleError> {
        let guard = RunGuard::acquire(&self.running).ok_or(CycleError::AlreadyRunning)?;
        self.run_guarded(guard).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a cycle while holding the running flag.
    async fn run_guarded(&self, _guard: RunGuard) -> Result<Report, CycleError> {
        let res = self
            .poller
            .run_cycle(
                &self.devices,
                &self.config,
                self.shutdown.child_token(),
                Some(self.progress.clone()),
            )
            .await;
        let mut s = self.inner.write().await;
        match &res {
            Ok(report) => {
                s.report = Some(report.clone());
                s.last_error = None;
            }
            Err(e) => s.last_error = Some(e.to_string()),
        }
        res
    }

    pub async fn last_report(&self) -> Option<Report> {
        self.inner.read().await.report.clone()
    }

    pub async fn status(&self) -> Status {
        let s = self.inner.read().await;
        let p = self.progress.snapshot();
        let state = if self.is_running() {
            "running"
        } else if s.report.is_some() {
            "done"
        } else {
            "idle"
        };
        Status {
            state: state.into(),
            total: p.total,
            done: p.done,
            succeeded: p.succeeded,
            failed: p.failed,
            batch: p.batch,
            batches: p.batches,
            last_error: s.last_error.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/poll", post(post_poll))
        .route("/report", get(get_report))
        .route("/devices", get(get_devices))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until the state's shutdown token is cancelled.
pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "serving API on http://{bind}/api");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.status().await))
}

async fn get_report(State(app): State<AppState>) -> impl IntoResponse {
    match app.last_report().await {
        Some(report) => (StatusCode::OK, Json(report)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_devices(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.sink.snapshot().await))
}

async fn post_poll(State(app): State<AppState>) -> impl IntoResponse {
    let Some(guard) = RunGuard::acquire(&app.running) else {
        let body = ApiError {
            error: CycleError::AlreadyRunning.to_string(),
        };
        return (StatusCode::CONFLICT, Json(body)).into_response();
    };

    let app2 = app.clone();
    tokio::spawn(async move {
        if let Err(e) = app2.run_guarded(guard).await {
            tracing::error!(error = %e, "poll cycle rejected");
        }
    });

    let mut status = app.status().await;
    status.state = "running".into();
    (StatusCode::ACCEPTED, Json(status)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_guard_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let g = RunGuard::acquire(&flag).unwrap();
        assert!(RunGuard::acquire(&flag).is_none());
        drop(g);
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn panicking_cycle_task_releases_the_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = RunGuard::acquire(&flag).unwrap();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("cycle task died");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert!(!flag.load(Ordering::Acquire));
        assert!(RunGuard::acquire(&flag).is_some());
    }
}
