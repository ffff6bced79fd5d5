use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use gatesync_core::access::{ScanRequest, ScanResponse};
use gatesync_core::models::{AccessLog, NewAccessLog, NewUser, SyncConflict, SyncStatusRow, User, UserPatch};
use gatesync_core::sync::{
    ConflictResolution, HttpTransport, ImportSummary, NodeInfo, PeerSyncReport, PullRequest, PullResponse,
    PushRequest, PushResponse, SyncEngine,
};
use gatesync_core::GateNode;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::AppError;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub node: GateNode,
    pub engine: Arc<SyncEngine<HttpTransport>>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine<HttpTransport>>) -> Self {
        Self {
            node: engine.node().clone(),
            engine,
        }
    }

    /// Run a store call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&GateNode) -> gatesync_core::Result<T> + Send + 'static,
    {
        let node = self.node.clone();
        tokio::task::spawn_blocking(move || f(&node))
            .await
            .map_err(|error| AppError::internal(format!("store task failed: {error}")))?
            .map_err(AppError::from)
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/node", get(node_info))
        .route("/sync/changes", get(pull_changes).post(push_changes))
        .route("/sync/status", get(sync_status))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/sync/trigger", post(trigger_sync))
        .route("/users", get(list_users).post(create_user))
        .route("/users/import", post(import_users))
        .route(
            "/users/{id}",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/logs", get(list_logs).post(append_log))
        .route("/scan", post(scan));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    ordinal: u32,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        ordinal: state.node.config().ordinal,
    })
}

async fn node_info(State(state): State<AppState>) -> Json<NodeInfo> {
    Json(state.node.node_info())
}

async fn pull_changes(
    State(state): State<AppState>,
    Query(request): Query<PullRequest>,
) -> Result<Json<PullResponse>, AppError> {
    let response = state.blocking(move |node| node.serve_pull(&request)).await?;
    Ok(Json(response))
}

async fn push_changes(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    let origin = request.origin;
    let table = request.table;
    let response = state.blocking(move |node| node.serve_push(&request)).await?;
    if response.applied + response.conflicts > 0 {
        tracing::info!(
            origin,
            table = %table,
            applied = response.applied,
            conflicts = response.conflicts,
            rejected = response.rejected,
            "Applied pushed changes"
        );
    }
    Ok(Json(response))
}

async fn sync_status(State(state): State<AppState>) -> Result<Json<Vec<SyncStatusRow>>, AppError> {
    let rows = state.blocking(|node| node.metadata().list_status()).await?;
    Ok(Json(rows))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConflictQuery {
    unresolved: bool,
    limit: Option<usize>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<Vec<SyncConflict>>, AppError> {
    let limit = page_limit(query.limit);
    let conflicts = state
        .blocking(move |node| node.resolver().list_conflicts(query.unresolved, limit))
        .await?;
    Ok(Json(conflicts))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    resolution: ConflictResolution,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<SyncConflict>, AppError> {
    let conflict = state
        .blocking(move |node| node.resolver().resolve_conflict(id, body.resolution))
        .await?;
    tracing::info!(conflict_id = id, resolution = ?body.resolution, "Conflict resolved by operator");
    Ok(Json(conflict))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerQuery {
    peer: Option<u32>,
}

async fn trigger_sync(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<Vec<PeerSyncReport>>, AppError> {
    let reports = state.engine.trigger(query.peer).await?;
    Ok(Json(reports))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PageQuery {
    limit: Option<usize>,
    offset: usize,
}

async fn list_users(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<User>>, AppError> {
    let limit = page_limit(page.limit);
    let users = state
        .blocking(move |node| node.users(limit, page.offset))
        .await?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<AppState>,
    Json(new_user): Json<NewUser>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let user = state
        .blocking(move |node| node.recorder().create_user(new_user))
        .await?;
    tracing::info!(user_id = user.id, "User enrolled");
    Ok((StatusCode::CREATED, Json(user)))
}

/// Bulk enrolment; the body is CSV with a `rfid_tag,name,nic,user_type` header.
async fn import_users(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ImportSummary>, AppError> {
    let summary = state
        .blocking(move |node| node.recorder().import_users(body.as_bytes()))
        .await?;
    Ok(Json(summary))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<User>, AppError> {
    state
        .blocking(move |node| node.user(id))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("user {id}")))
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<UserPatch>,
) -> Result<Json<User>, AppError> {
    let user = state
        .blocking(move |node| node.recorder().update_user(id, &patch))
        .await?;
    Ok(Json(user))
}

async fn delete_user(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<User>, AppError> {
    let user = state
        .blocking(move |node| node.recorder().delete_user(id))
        .await?;
    Ok(Json(user))
}

async fn list_logs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<AccessLog>>, AppError> {
    let limit = page_limit(page.limit);
    let logs = state
        .blocking(move |node| node.logs(limit, page.offset))
        .await?;
    Ok(Json(logs))
}

async fn append_log(
    State(state): State<AppState>,
    Json(new_log): Json<NewAccessLog>,
) -> Result<(StatusCode, Json<AccessLog>), AppError> {
    let log = state
        .blocking(move |node| node.recorder().append_log(new_log))
        .await?;
    Ok((StatusCode::CREATED, Json(log)))
}

async fn scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let Some(access) = state.node.access() else {
        return Err(AppError::bad_request("this node is not mounted at a gate"));
    };
    let response = state
        .blocking(move |_| access.process_scan(&request))
        .await?;
    Ok(Json(response))
}

fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gatesync_core::config::{GateConfig, SyncTable};
    use gatesync_core::models::{AccessResult, GateKind, UserStatus};
    use gatesync_core::NodeConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    fn state(gate: Option<GateConfig>) -> AppState {
        let mut config = NodeConfig::new(1, 2).unwrap();
        config.gate = gate;
        let node = GateNode::open_in_memory(config).unwrap();
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        AppState::new(Arc::new(SyncEngine::new(node, transport)))
    }

    #[test]
    fn router_builds() {
        let _router = app_router(state(None));
    }

    #[tokio::test]
    async fn enrol_fetch_and_patch_user() {
        let state = state(None);
        let (status, Json(user)) = create_user(State(state.clone()), Json(NewUser::new("TAG-1")))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(user.id, 1);

        let Json(fetched) = get_user(State(state.clone()), Path(user.id)).await.unwrap();
        assert_eq!(fetched, user);

        let Json(patched) = update_user(
            State(state.clone()),
            Path(user.id),
            Json(UserPatch::status(UserStatus::Banned)),
        )
        .await
        .unwrap();
        assert_eq!(patched.version, 2);

        let err = create_user(State(state), Json(NewUser::new("TAG-1")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn csv_import_reports_counts() {
        let state = state(None);
        create_user(State(state.clone()), Json(NewUser::new("TAG-1")))
            .await
            .unwrap();

        let body = "rfid_tag,name,nic,user_type\nTAG-1,,,\nTAG-2,Ada,,Backstage\n".to_string();
        let Json(summary) = import_users(State(state.clone()), body).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                inserted: 1,
                duplicates: 1,
                invalid: 0,
            }
        );
        assert_eq!(state.node.user_by_tag("TAG-2").unwrap().unwrap().id, 3);

        let err = import_users(State(state), "name\nAda\n".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let err = get_user(State(state(None)), Path(42)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pull_endpoint_serves_recorded_changes() {
        let state = state(None);
        create_user(State(state.clone()), Json(NewUser::new("TAG-1")))
            .await
            .unwrap();

        let Json(response) = pull_changes(
            State(state),
            Query(PullRequest {
                table: SyncTable::Users,
                since: 0,
                requester: 2,
                limit: 10,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.origin, 1);
        assert_eq!(response.entries.len(), 1);
    }

    #[tokio::test]
    async fn push_from_unknown_node_is_bad_request() {
        let err = push_changes(
            State(state(None)),
            Json(PushRequest {
                origin: 2,
                table: SyncTable::Users,
                pull_cursor: 0,
                entries: Vec::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scan_needs_a_gate() {
        let request = ScanRequest {
            rfid_tag: "TAG-1".to_string(),
            gate_id: None,
            booth_id: 1,
            device_id: None,
        };
        let err = scan(State(state(None)), Json(request.clone())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let state = state(Some(GateConfig {
            gate_id: 4,
            kind: GateKind::CommonIn,
        }));
        create_user(State(state.clone()), Json(NewUser::new("TAG-1")))
            .await
            .unwrap();
        let Json(response) = scan(State(state), Json(request)).await.unwrap();
        assert_eq!(response.result, AccessResult::Pass);
    }

    #[tokio::test]
    async fn trigger_for_unknown_peer_is_not_found() {
        let err = trigger_sync(State(state(None)), Query(TriggerQuery { peer: Some(2) }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resolving_missing_conflict_is_not_found() {
        let err = resolve_conflict(
            State(state(None)),
            Path(5),
            Json(ResolveBody {
                resolution: ConflictResolution::KeepLocal,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
