use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;

use leasekeep_core::config::LeaseConfig;
use leasekeep_core::{LeaseError, LeaseManager, StoreError};

use crate::handlers::*;
use crate::ServeOptions;

pub type AppState = Arc<LeaseManager>;

pub async fn run(opts: &ServeOptions) -> std::io::Result<()> {
    let manager = create_manager(&opts.storage, opts.lease_config())
        .map_err(std::io::Error::other)?;
    let state: AppState = Arc::new(manager);

    for name in &opts.resources {
        if state.provision(name).map_err(std::io::Error::other)? {
            tracing::info!(resource = %name, "Provisioned resource");
        }
    }

    let recovered = state.recover_schedules().map_err(std::io::Error::other)?;
    if recovered > 0 {
        tracing::info!(leases = recovered, "Re-armed reclaims for held leases");
    }

    let worker = spawn_reclaim_worker(state.clone(), Duration::from_millis(opts.reclaim_poll_ms));
    let app = app(state, opts.max_in_flight);

    let addr = format!("{}:{}", opts.host, opts.port);
    tracing::info!(
        key_source = %opts.key_source,
        "🔒 leasekeep server starting on http://{}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    worker.abort();
    tracing::info!("Server stopped");
    Ok(())
}

pub fn app(state: AppState, max_in_flight: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/resources", get(list_resources))
        .route("/api/resources/{name}", patch(resource_action))
        .route("/reclaims/dead", get(dead_reclaims))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// JSON snapshot of a storage backend, for the `status` command.
pub fn status(storage: &str) -> Result<String, String> {
    let manager = create_manager(storage, LeaseConfig::default())?;
    let report = build_status(&manager).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&report).map_err(|e| e.to_string())
}

fn build_status(manager: &LeaseManager) -> Result<StatusReport, LeaseError> {
    Ok(StatusReport {
        resources: manager.resources()?.iter().map(ResourceInfo::from).collect(),
        pending_reclaims: manager.pending_reclaims()?,
        dead_reclaims: manager
            .dead_reclaims()?
            .iter()
            .map(DeadReclaimInfo::from)
            .collect(),
    })
}

// ─── Background Work ────────────────────────────────────────────────────────

fn spawn_reclaim_worker(state: AppState, poll: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let manager = state.clone();
            match tokio::task::spawn_blocking(move || manager.reclaim_due()).await {
                Ok(Ok(report)) if !report.is_empty() => {
                    tracing::debug!(?report, "Reclaim sweep finished");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Reclaim sweep failed"),
                Err(e) => tracing::error!(error = %e, "Reclaim worker task panicked"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Run a manager call on the blocking pool. Acquire may sleep for the
/// contention wait and store calls may touch disk.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, LeaseError>
where
    T: Send + 'static,
    F: FnOnce(&LeaseManager) -> Result<T, LeaseError> + Send + 'static,
{
    let manager = state.clone();
    match tokio::task::spawn_blocking(move || f(&manager)).await {
        Ok(result) => result,
        Err(e) => Err(LeaseError::Internal(StoreError::Unavailable(format!(
            "blocking task failed: {}",
            e
        )))),
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    let result = run_blocking(&state, |m| {
        Ok(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            resources: m.resources()?.len(),
            pending_reclaims: m.pending_reclaims()?,
            dead_reclaims: m.dead_reclaims()?.len(),
        })
    })
    .await;

    match result {
        Ok(health) => Json(ApiResponse::ok(health)).into_response(),
        Err(e) => lease_error(e),
    }
}

async fn list_resources(State(state): State<AppState>) -> Response {
    let result = run_blocking(&state, |m| {
        Ok(m.resources()?
            .iter()
            .map(ResourceInfo::from)
            .collect::<Vec<_>>())
    })
    .await;

    match result {
        Ok(resources) => Json(ApiResponse::ok(resources)).into_response(),
        Err(e) => lease_error(e),
    }
}

async fn dead_reclaims(State(state): State<AppState>) -> Response {
    let result = run_blocking(&state, |m| {
        Ok(m.dead_reclaims()?
            .iter()
            .map(DeadReclaimInfo::from)
            .collect::<Vec<_>>())
    })
    .await;

    match result {
        Ok(dead) => Json(ApiResponse::ok(dead)).into_response(),
        Err(e) => lease_error(e),
    }
}

async fn resource_action(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    // An empty body is a request with every field missing
    let req: ResourceActionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResourceActionRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::<()>::err(format!("Malformed JSON body: {}", e))),
                )
                    .into_response();
            }
        }
    };

    match req.action() {
        Ok(Action::Acquire) => acquire(state, name, req).await,
        Ok(Action::Release) => release(state, name, req).await,
        Err(errors) => invalid(errors),
    }
}

async fn acquire(state: AppState, name: String, req: ResourceActionRequest) -> Response {
    let config = state.config();
    let params = match req.validate_acquire(config.key_source, config.key_length) {
        Ok(params) => params,
        Err(errors) => return invalid(errors),
    };

    let result = run_blocking(&state, move |m| {
        m.acquire(&name, params.period_ms, params.key.as_deref())
    })
    .await;

    match result {
        Ok(grant) => Json(ApiResponse::ok(LeaseResponse::from(grant))).into_response(),
        Err(e) => lease_error(e),
    }
}

async fn release(state: AppState, name: String, req: ResourceActionRequest) -> Response {
    let key = match req.validate_release() {
        Ok(key) => key,
        Err(errors) => return invalid(errors),
    };

    // A key that guards nothing fails validation before the resource is looked up
    let result = run_blocking(&state, move |m| {
        if m.holder_of(&key)?.is_none() {
            return Ok(false);
        }
        m.release(&name, &key)?;
        Ok(true)
    })
    .await;

    match result {
        Ok(true) => Json(ApiResponse::ok("Resource released successfully")).into_response(),
        Ok(false) => invalid(unknown_key()),
        Err(e) => lease_error(e),
    }
}

fn invalid(errors: FieldErrors) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ApiResponse::<()>::invalid(errors)),
    )
        .into_response()
}

fn lease_error(err: LeaseError) -> Response {
    (status_for(&err), Json(error_body(&err))).into_response()
}

// ─── Storage Backend Factory ────────────────────────────────────────────────

fn create_manager(storage: &str, config: LeaseConfig) -> Result<LeaseManager, String> {
    if storage == "memory" {
        tracing::info!("💾 Storage backend: in-memory (leases will not persist)");
        Ok(LeaseManager::in_memory(config))
    } else if let Some(path) = storage.strip_prefix("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            tracing::info!("💾 Storage backend: SQLite ({})", path);
            LeaseManager::with_sqlite(path, config)
                .map_err(|e| format!("Failed to open SQLite database at '{}': {}", path, e))
        }
        #[cfg(not(feature = "sqlite"))]
        {
            let _ = (path, config);
            Err("SQLite storage requested but the `sqlite` feature is not enabled. \
                 Rebuild with: cargo build --features sqlite"
                .to_string())
        }
    } else {
        Err(format!(
            "Unknown storage backend: '{}'. Use 'memory' or 'sqlite:<path>'",
            storage
        ))
    }
}
