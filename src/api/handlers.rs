use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::BranchError;
use crate::logic::BranchService;
use crate::model::{Branch, BranchState, Timepoint};
use crate::store::traits::BranchStore;

pub type AppState<S> = Arc<BranchService<S>>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Branch timespan as exposed over the wire, with the derived state
/// attached when the lookup computed one.
#[derive(Debug, Serialize)]
pub struct BranchResponse {
    pub path: String,
    pub base: Timepoint,
    pub head: Timepoint,
    pub start: Timepoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Timepoint>,
    pub locked: bool,
    pub contains_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_promotion: Option<Timepoint>,
    pub versions_replaced: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<BranchState>,
}

impl From<Branch> for BranchResponse {
    fn from(branch: Branch) -> Self {
        Self {
            path: branch.path,
            base: branch.base,
            head: branch.head,
            start: branch.start,
            end: branch.end,
            locked: branch.locked,
            contains_content: branch.contains_content,
            last_promotion: branch.last_promotion,
            versions_replaced: branch.versions_replaced.into_iter().collect(),
            state: branch.state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub path: String,
    /// Materialize missing ancestors as well.
    pub recursive: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChildrenQuery {
    /// Restrict to children exactly one level below the path.
    pub direct: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

fn map_error(err: anyhow::Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err.downcast_ref::<BranchError>() {
        Some(BranchError::NotFound(_)) | Some(BranchError::NotFoundAtTimepoint { .. }) => {
            StatusCode::NOT_FOUND
        }
        Some(BranchError::AlreadyExists(_)) | Some(BranchError::Locked(_)) => StatusCode::CONFLICT,
        Some(BranchError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(&format!("{:#}", err))))
}

/// POST /branches
pub async fn create_branch<S: BranchStore>(
    State(service): State<AppState<S>>,
    RequestJson(request): RequestJson<CreateBranchRequest>,
) -> Result<Json<BranchResponse>, (StatusCode, Json<ErrorResponse>)> {
    let result = if request.recursive.unwrap_or(false) {
        service.recursive_create(&request.path).await
    } else {
        service.create(&request.path).await
    };
    match result {
        Ok(branch) => Ok(Json(branch.into())),
        Err(err) => Err(map_error(err)),
    }
}

/// GET /branches
pub async fn list_branches<S: BranchStore>(
    State(service): State<AppState<S>>,
) -> Result<Json<ListResponse<BranchResponse>>, (StatusCode, Json<ErrorResponse>)> {
    match service.find_all().await {
        Ok(branches) => {
            let items: Vec<BranchResponse> = branches.into_iter().map(Into::into).collect();
            let total = items.len();
            Ok(Json(ListResponse { items, total }))
        }
        Err(err) => Err(map_error(err)),
    }
}

/// GET /branches/{path}
pub async fn get_branch<S: BranchStore>(
    Path(path): Path<String>,
    State(service): State<AppState<S>>,
) -> Result<Json<BranchResponse>, (StatusCode, Json<ErrorResponse>)> {
    match service.find_latest(&path).await {
        Ok(Some(branch)) => Ok(Json(branch.into())),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!(
                "Branch '{}' does not exist.",
                path
            ))),
        )),
        Err(err) => Err(map_error(err)),
    }
}

/// GET /exists/{path}
pub async fn branch_exists<S: BranchStore>(
    Path(path): Path<String>,
    State(service): State<AppState<S>>,
) -> Result<Json<ExistsResponse>, (StatusCode, Json<ErrorResponse>)> {
    match service.exists(&path).await {
        Ok(exists) => Ok(Json(ExistsResponse { exists })),
        Err(err) => Err(map_error(err)),
    }
}

/// GET /children/{path}
pub async fn find_children<S: BranchStore>(
    Path(path): Path<String>,
    Query(query): Query<ChildrenQuery>,
    State(service): State<AppState<S>>,
) -> Result<Json<ListResponse<BranchResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let result = if query.direct.unwrap_or(false) {
        service.find_direct_children(&path).await
    } else {
        service.find_children(&path).await
    };
    match result {
        Ok(branches) => {
            let items: Vec<BranchResponse> = branches.into_iter().map(Into::into).collect();
            let total = items.len();
            Ok(Json(ListResponse { items, total }))
        }
        Err(err) => Err(map_error(err)),
    }
}

/// POST /unlock/{path}
pub async fn unlock_branch<S: BranchStore>(
    Path(path): Path<String>,
    State(service): State<AppState<S>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match service.unlock(&path).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "success": true,
            "message": format!("Branch '{}' unlocked", path)
        }))),
        Err(err) => Err(map_error(err)),
    }
}

/// DELETE /branches
pub async fn delete_all_branches<S: BranchStore>(
    State(service): State<AppState<S>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match service.delete_all().await {
        Ok(()) => Ok(Json(serde_json::json!({ "success": true }))),
        Err(err) => Err(map_error(err)),
    }
}
