//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the radio, scanner and cast
//! subsystems for business logic.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::api::stream::stream_audio;
use crate::api::AppState;
use crate::error::{DabcastError, DabcastResult};

/// Fallback album art served via redirect for songs with no cached image.
const FALLBACK_SONG_IMAGE: &str = "https://www.musicpd.org/logo.png";

/// Builds the application router.
pub fn create_router(state: AppState) -> Router {
    let webui = ServeFile::new(state.web_root.join("webui/index.html"));
    let cast_receiver = ServeDir::new(state.web_root.join("cast_receiver"));

    Router::new()
        .route_service("/", webui)
        .nest_service("/cast_receiver", cast_receiver)
        .route("/DAB.m3u8", get(get_scanner_playlist))
        .route("/get_scanner_details", get(get_scanner_details))
        .route("/start_scan", post(start_scan))
        .route("/stop_scan", post(stop_scan))
        .route("/stream/{channel}/{service}", get(stream_audio))
        .route("/label/current/{channel}/{service}", get(get_current_label))
        .route("/label/next/{channel}/{service}", get(get_next_label))
        .route("/image/current/{channel}/{service}", get(get_current_image))
        .route("/image/next/{channel}/{service}", get(get_next_image))
        .route("/mpd_image/{*song_path}", get(get_song_image))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Validates the channel path segment against the DAB channel naming scheme
/// (one or two digits followed by one uppercase letter, e.g. `5C`, `11D`).
pub(super) fn channel_is_valid(channel: &str) -> bool {
    let bytes = channel.as_bytes();
    let Some((&letter, digits)) = bytes.split_last() else {
        return false;
    };
    (1..=2).contains(&digits.len())
        && digits.iter().all(u8::is_ascii_digit)
        && letter.is_ascii_uppercase()
}

async fn get_scanner_playlist(State(state): State<AppState>) -> DabcastResult<Response> {
    let playlist = state.scanner()?.playlist(&state.network.url_builder());
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "audio/x-mpegurl")
        .body(Body::from(playlist))
        .map_err(|e| DabcastError::Internal(e.to_string()))?)
}

async fn get_scanner_details(State(state): State<AppState>) -> DabcastResult<Response> {
    Ok(Json(state.scanner()?.status()).into_response())
}

async fn start_scan(State(state): State<AppState>) -> DabcastResult<Response> {
    state.scanner()?.start_scan();
    Ok(Json(json!({})).into_response())
}

async fn stop_scan(State(state): State<AppState>) -> DabcastResult<Response> {
    state.scanner()?.stop_scan();
    Ok(Json(json!({})).into_response())
}

/// Response headers shared by the metadata endpoints: values are moments in
/// time, never cacheable, and the connection is not reused.
fn metadata_response(content_type: &str, body: Body) -> DabcastResult<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "Close")
        .body(body)
        .map_err(|e| DabcastError::Internal(e.to_string()))
}

async fn get_current_label(
    Path((channel, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> DabcastResult<Response> {
    log::debug!(
        "[Web] get_current_label: channel: {} service: {}",
        channel,
        service
    );
    let controller = lookup_controller(&state, &channel, &service).await?;
    metadata_response("text/plain; charset=utf-8", Body::from(controller.current_label()))
}

async fn get_next_label(
    Path((channel, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> DabcastResult<Response> {
    log::debug!(
        "[Web] get_next_label: channel: {} service: {}",
        channel,
        service
    );
    let controller = lookup_controller(&state, &channel, &service).await?;
    let label = controller
        .await_label()
        .await
        .map_err(|_| DabcastError::SubscriptionLost)?;
    metadata_response("text/plain; charset=utf-8", Body::from(label))
}

async fn get_current_image(
    Path((channel, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> DabcastResult<Response> {
    log::debug!(
        "[Web] get_current_image: channel: {} service: {}",
        channel,
        service
    );
    let controller = lookup_controller(&state, &channel, &service).await?;
    let image = controller
        .current_picture()
        .filter(|image| !image.data.is_empty())
        .ok_or_else(|| DabcastError::NotFound("no image received yet".into()))?;
    metadata_response(&image.mime_type, Body::from(image.data))
}

async fn get_next_image(
    Path((channel, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> DabcastResult<Response> {
    log::debug!(
        "[Web] get_next_image: channel: {} service: {}",
        channel,
        service
    );
    let controller = lookup_controller(&state, &channel, &service).await?;
    let image = controller
        .await_picture()
        .await
        .map_err(|_| DabcastError::SubscriptionLost)?;
    metadata_response(&image.mime_type, Body::from(image.data))
}

/// Resolves the fan-out controller of a currently subscribed service; 404
/// when the channel is malformed or the service is not subscribed.
async fn lookup_controller(
    state: &AppState,
    channel: &str,
    service: &str,
) -> DabcastResult<std::sync::Arc<crate::radio::ServiceController>> {
    if !channel_is_valid(channel) {
        return Err(DabcastError::NotFound(format!(
            "invalid channel {channel}"
        )));
    }
    state
        .radio()?
        .service_controller(service)
        .await
        .ok_or_else(|| DabcastError::NotFound(format!("service {service} is not subscribed")))
}

/// Serves album art cached by the cast bridge; unknown songs are redirected
/// to a generic fallback image.
async fn get_song_image(
    Path(song_path): Path<String>,
    State(state): State<AppState>,
) -> DabcastResult<Response> {
    let cache = state.image_cache()?;
    match cache.get(&song_path) {
        Some(image) => metadata_response(&image.mime_type, Body::from(image.data)),
        None => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, FALLBACK_SONG_IMAGE)
            .body(Body::empty())
            .map_err(|e| DabcastError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_validation_follows_the_naming_scheme() {
        assert!(channel_is_valid("5C"));
        assert!(channel_is_valid("11D"));
        assert!(!channel_is_valid("11d"));
        assert!(!channel_is_valid("D11"));
        assert!(!channel_is_valid("111D"));
        assert!(!channel_is_valid("C"));
        assert!(!channel_is_valid(""));
    }
}
