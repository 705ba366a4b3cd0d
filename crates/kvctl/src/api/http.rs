//! HTTP management API
//!
//! Thin RESTful layer over the topology service and both task controllers

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind};
use crate::failover::{FailOverTask, FailoverType};
use crate::metadata::{Cluster, ClusterSpec, Namespace};
use crate::migration::{MigrateRequest, MigrateTask};
use crate::task::TaskQueryType;
use crate::Controller;

/// Header that skips probing nodes on cluster creation
pub const HEADER_DONT_DETECT_HOST: &str = "X-Dont-Detect-Host";

/// Longest a watch request may block
const MAX_WATCH_WAIT_MS: u64 = 60_000;

/// HTTP API service
pub struct HttpApi {
    controller: Arc<Controller>,
}

impl HttpApi {
    /// Create HTTP API
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Create router
    pub fn router(self) -> Router {
        let controller = self.controller;

        Router::new()
            .route("/api/v1/controller", get(get_controller))
            // Namespaces
            .route("/api/v1/namespaces", get(list_namespaces).post(create_namespace))
            .route("/api/v1/namespaces/:ns", axum::routing::delete(remove_namespace))
            // Clusters
            .route(
                "/api/v1/namespaces/:ns/clusters",
                get(list_clusters).post(create_cluster),
            )
            .route(
                "/api/v1/namespaces/:ns/clusters/:cluster",
                get(get_cluster).delete(remove_cluster),
            )
            .route("/api/v1/namespaces/:ns/clusters/:cluster/watch", get(watch_cluster))
            // Failover
            .route("/api/v1/namespaces/:ns/clusters/:cluster/failover", post(failover_shard))
            .route(
                "/api/v1/namespaces/:ns/clusters/:cluster/failover/tasks/:type",
                get(get_failover_tasks),
            )
            // Migration
            .route("/api/v1/namespaces/:ns/clusters/:cluster/migrate", post(migrate_slots))
            .route(
                "/api/v1/namespaces/:ns/clusters/:cluster/migrate/tasks/:type",
                get(get_migrate_tasks),
            )
            .with_state(controller)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

/// Status code for an error kind
fn status_of(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::StoreTimeout | ErrorKind::StoreUnavailable | ErrorKind::ProbeFailure => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `status` with the data on success, the mapped error otherwise
fn reply<T: Serialize>(status: StatusCode, result: crate::Result<T>) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => {
            let code = status_of(&e);
            if code.is_server_error() {
                warn!("Request failed: {}", e);
            }
            (code, ApiResponse::<T>::err(e.to_string())).into_response()
        }
    }
}

fn no_content(result: crate::Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => reply::<()>(StatusCode::OK, Err(e)),
    }
}

#[derive(Serialize)]
struct ControllerStatus {
    id: String,
    leader: bool,
}

#[derive(Serialize)]
struct NamespacesData {
    namespaces: Vec<String>,
}

#[derive(Serialize)]
struct ClustersData {
    clusters: Vec<String>,
}

#[derive(Serialize)]
struct ClusterData {
    cluster: Cluster,
}

#[derive(Serialize)]
struct WatchData {
    changed: bool,
    revision: u64,
    cluster: Option<Cluster>,
}

#[derive(Serialize)]
struct TasksData<T> {
    tasks: Vec<T>,
}

// ==================== Request types ====================

#[derive(Deserialize)]
struct CreateNamespaceRequest {
    name: String,
}

#[derive(Deserialize)]
struct FailoverRequest {
    shard_index: usize,
    node_id: String,
}

#[derive(Deserialize)]
struct WatchQuery {
    #[serde(default)]
    revision: u64,
    timeout_ms: Option<u64>,
}

// ==================== Handlers ====================

async fn get_controller(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    ApiResponse::ok(ControllerStatus {
        id: controller.id().to_string(),
        leader: controller.is_leader(),
    })
}

// Namespaces
async fn list_namespaces(State(controller): State<Arc<Controller>>) -> Response {
    let result = controller.topology().list_namespaces().await;
    reply(StatusCode::OK, result.map(|namespaces| NamespacesData { namespaces }))
}

async fn create_namespace(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<CreateNamespaceRequest>,
) -> Response {
    let result: crate::Result<Namespace> = controller.topology().create_namespace(&req.name).await;
    reply(StatusCode::CREATED, result)
}

async fn remove_namespace(
    State(controller): State<Arc<Controller>>,
    Path(ns): Path<String>,
) -> Response {
    no_content(controller.topology().remove_namespace(&ns).await)
}

// Clusters
async fn list_clusters(
    State(controller): State<Arc<Controller>>,
    Path(ns): Path<String>,
) -> Response {
    let result = controller.topology().list_clusters(&ns).await;
    reply(StatusCode::OK, result.map(|clusters| ClustersData { clusters }))
}

async fn create_cluster(
    State(controller): State<Arc<Controller>>,
    Path(ns): Path<String>,
    headers: HeaderMap,
    Json(spec): Json<ClusterSpec>,
) -> Response {
    let probe = headers
        .get(HEADER_DONT_DETECT_HOST)
        .and_then(|v| v.to_str().ok())
        .map_or(true, |v| !v.eq_ignore_ascii_case("true"));
    info!(
        "Creating cluster {}/{}: {} nodes, replicas={}, probe={}",
        ns,
        spec.name,
        spec.nodes.len(),
        spec.replicas,
        probe
    );
    let result = controller.topology().create_cluster(&ns, &spec, probe).await;
    reply(StatusCode::CREATED, result.map(|cluster| ClusterData { cluster }))
}

async fn get_cluster(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
) -> Response {
    let result = controller.topology().load_cluster(&ns, &cluster).await;
    reply(StatusCode::OK, result.map(|c| ClusterData { cluster: c.value }))
}

async fn remove_cluster(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
) -> Response {
    no_content(controller.topology().remove_cluster(&ns, &cluster).await)
}

async fn watch_cluster(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
    Query(query): Query<WatchQuery>,
) -> Response {
    let wait = Duration::from_millis(query.timeout_ms.unwrap_or(30_000).min(MAX_WATCH_WAIT_MS));
    let result = controller
        .topology()
        .watch_cluster(&ns, &cluster, query.revision, wait)
        .await
        .map(|changed| match changed {
            Some(c) => WatchData {
                changed: true,
                revision: c.revision,
                cluster: Some(c.value),
            },
            None => WatchData {
                changed: false,
                revision: query.revision,
                cluster: None,
            },
        });
    reply(StatusCode::OK, result)
}

// Failover
async fn failover_shard(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
    Json(req): Json<FailoverRequest>,
) -> Response {
    let result: crate::Result<FailOverTask> = controller
        .failover()
        .add_task(&ns, &cluster, req.shard_index, &req.node_id, FailoverType::Manual)
        .await;
    reply(StatusCode::CREATED, result)
}

async fn get_failover_tasks(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, typ)): Path<(String, String, String)>,
) -> Response {
    let result = match typ.parse::<TaskQueryType>() {
        Ok(query) => controller.failover().get_tasks(&ns, &cluster, query).await,
        Err(e) => Err(e),
    };
    reply(StatusCode::OK, result.map(|tasks| TasksData { tasks }))
}

// Migration
async fn migrate_slots(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
    Json(req): Json<MigrateRequest>,
) -> Response {
    let result: crate::Result<MigrateTask> = controller.migration().submit(&ns, &cluster, req).await;
    reply(StatusCode::CREATED, result)
}

async fn get_migrate_tasks(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, typ)): Path<(String, String, String)>,
) -> Response {
    let result = match typ.parse::<TaskQueryType>() {
        Ok(query) => controller.migration().get_tasks(&ns, &cluster, query).await,
        Err(e) => Err(e),
    };
    reply(StatusCode::OK, result.map(|tasks| TasksData { tasks }))
}
