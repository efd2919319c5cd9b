//! HTTP surface: router assembly and endpoint wiring.

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;

use harvest_core::storage::Storage;

use crate::scheduler::Flusher;

pub mod handlers;
pub mod middleware;

pub use middleware::MiddlewareState;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub flusher: Arc<Flusher>,
}

/// Build the router.
///
/// Mutating endpoints get the full stack (admission → decryption → HMAC →
/// gzip → logging, outer to inner); read endpoints get gzip and logging only.
pub fn router(state: AppState, mw: MiddlewareState) -> Router {
    let mutating = Router::new()
        .route("/update/", post(handlers::update_json))
        .route("/updates/", post(handlers::update_batch))
        .route("/update/:kind/:name/:value", post(handlers::update_plain))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(mw.clone(), middleware::admission))
                .layer(from_fn_with_state(mw.clone(), middleware::decryption))
                .layer(from_fn_with_state(mw.clone(), middleware::hmac_exchange))
                .layer(from_fn(middleware::gzip_transcode))
                .layer(from_fn(middleware::logging)),
        );

    let reads = Router::new()
        .route("/", get(handlers::list_html))
        .route("/ping", get(handlers::ping))
        .route("/value/", post(handlers::value_json))
        .route("/value/:kind/:name", get(handlers::value_plain))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(middleware::gzip_transcode))
                .layer(from_fn(middleware::logging)),
        );

    mutating.merge(reads).with_state(state)
}
