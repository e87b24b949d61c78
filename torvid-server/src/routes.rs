use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hls_handlers::{
    master_playlist_handler, mp4_fallback_handler, stream_file_handler, subtitle_handler,
    thumbnail_handler,
};
use crate::media_handlers::{
    delete_media_handler, get_media_handler, health_handler, list_media_handler,
    live_status_handler, request_download_handler, stream_entry_handler,
};
use crate::state::AppState;

/// Build the full router. Static path segments win over captures, so
/// `master.m3u8`, `fallback.mp4`, and the `thumbnails`/`subs` prefixes are
/// matched before the `{file}` dispatch handler sees anything.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/media", get(list_media_handler))
        .route(
            "/media/{id}",
            get(get_media_handler).delete(delete_media_handler),
        )
        .route("/media/{id}/download", post(request_download_handler))
        .route("/media/{id}/status", get(live_status_handler))
        .route("/media/{id}/stream", get(stream_entry_handler))
        .route("/health", get(health_handler));

    let stream = Router::new()
        .route("/{id}/master.m3u8", get(master_playlist_handler))
        .route("/{id}/fallback.mp4", get(mp4_fallback_handler))
        .route("/{id}/thumbnails/{name}", get(thumbnail_handler))
        .route("/{id}/subs/{name}", get(subtitle_handler))
        .route("/{id}/{file}", get(stream_file_handler));

    Router::new()
        .nest("/api/v1", api)
        .nest("/stream", stream)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
