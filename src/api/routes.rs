use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::traits::BranchStore;

pub fn create_router<S: BranchStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Branch lifecycle
        .route("/branches", get(handlers::list_branches::<S>))
        .route("/branches", post(handlers::create_branch::<S>))
        .route("/branches", delete(handlers::delete_all_branches::<S>))
        .route("/branches/*path", get(handlers::get_branch::<S>))
        .route("/exists/*path", get(handlers::branch_exists::<S>))
        .route("/children/*path", get(handlers::find_children::<S>))
        // Lock recovery
        .route("/unlock/*path", post(handlers::unlock_branch::<S>))
}
