// Status RPC: the only core-owned HTTP surface (spec §7: "Status endpoints
// report the item's current state"). Ingest itself is out of scope (spec
// §1) and lives in its own collaborator service; this module exposes
// nothing but read-only status and operability endpoints, grounded in the
// teacher's `DaemonRpcServer` (`rpc::mod`) shape: one `actix-web`
// `HttpServer`, a Prometheus exporter mounted at `/metrics`, and a handle
// kept around so the caller can shut it down cooperatively (spec §5).

use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::core::storage::StateStore;
use bundler_common::data_item::{DataItemInfo, DataItemState};

struct AppState {
    store: Arc<dyn StateStore>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum StatusResponse {
    New,
    Planned { bundle_id: Option<String> },
    Permanent { bundle_id: Option<String> },
    Failed,
    NotFound,
}

impl From<DataItemInfo> for StatusResponse {
    fn from(info: DataItemInfo) -> Self {
        match info {
            DataItemInfo::Found {
                status: DataItemState::New,
                ..
            } => StatusResponse::New,
            DataItemInfo::Found {
                status: DataItemState::Planned,
                bundle_id,
                ..
            } => StatusResponse::Planned { bundle_id },
            DataItemInfo::Found {
                status: DataItemState::Permanent,
                bundle_id,
                ..
            } => StatusResponse::Permanent { bundle_id },
            DataItemInfo::Found {
                status: DataItemState::Failed,
                ..
            } => StatusResponse::Failed,
            DataItemInfo::NotFound => StatusResponse::NotFound,
        }
    }
}

#[get("/status/{id}")]
async fn get_status(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    match state.store.get_data_item_info(&id).await {
        Ok(info) => {
            let response = StatusResponse::from(info);
            let status_code = if matches!(response, StatusResponse::NotFound) {
                actix_web::http::StatusCode::NOT_FOUND
            } else {
                actix_web::http::StatusCode::OK
            };
            HttpResponse::build(status_code).json(response)
        }
        Err(e) => {
            error!("status rpc: store lookup failed: {e}");
            HttpResponse::ServiceUnavailable().finish()
        }
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().finish()
}

async fn prometheus_metrics(handle: web::Data<PrometheusHandle>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

/// Owns the bound HTTP server and its Prometheus recorder. Dropping this
/// does not stop the server; call [`StatusServer::shutdown`] for
/// cooperative shutdown (spec §5).
pub struct StatusServer {
    handle: Mutex<Option<ServerHandle>>,
}

impl StatusServer {
    /// Binds and spawns the status server, installing a process-global
    /// Prometheus recorder. Returns once the listener is bound; the server
    /// itself runs on a background task.
    pub async fn start(bind_address: &str, store: Arc<dyn StateStore>) -> anyhow::Result<Arc<Self>> {
        let prometheus_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install prometheus recorder")?;

        let state = web::Data::new(AppState { store });
        let metrics_handle = web::Data::new(prometheus_handle);

        let http_server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .app_data(metrics_handle.clone())
                .service(get_status)
                .service(health)
                .route("/metrics", web::get().to(prometheus_metrics))
        })
        .disable_signals()
        .bind(bind_address)
        .with_context(|| format!("failed to bind status rpc to {bind_address}"))?
        .run();

        let handle = http_server.handle();
        tokio::spawn(http_server);

        info!("status rpc: listening on {bind_address}");
        Ok(Arc::new(Self {
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Cooperative shutdown (spec §5): stop accepting new connections and
    /// let in-flight requests drain before returning.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(true).await;
        }
    }
}
