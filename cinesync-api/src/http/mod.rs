pub mod stream;
pub mod tus;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Combined HTTP surface: the range streamer, plus the TUS endpoint
/// when the upload service is available.
pub fn router(state: AppState) -> Router {
    let mut router = stream::router();
    if state.uploads.is_some() {
        router = router.merge(tus::router());
    }
    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
