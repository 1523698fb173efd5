//! Audio streaming handler.
//!
//! Separated from the REST handlers due to its distinct concerns: the
//! channel-switch retry, subscription lifetime tied to the response body,
//! and WAV header generation.
//!
//! The WAV header is written together with the first audio chunk rather
//! than up front: the driver only reports the sample rate alongside the
//! first decoded frame.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
};
use bytes::{Bytes, BytesMut};

use crate::api::http::channel_is_valid;
use crate::api::AppState;
use crate::error::{DabcastError, DabcastResult};
use crate::radio::RadioController;
use crate::stream::{create_wav_header, AudioCodec};

/// Wait before the second (and last) subscribe attempt when the tuner is on
/// another channel: a service switch may deliver the new subscribe before
/// the old client's unsubscribe has been processed.
const CHANNEL_SWITCH_RETRY: Duration = Duration::from_millis(500);

pub(super) async fn stream_audio(
    Path((channel, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> DabcastResult<Response> {
    if state.is_shutting_down() {
        return Err(DabcastError::Unavailable("shutting down".into()));
    }
    let radio = Arc::clone(state.radio()?);
    if !channel_is_valid(&channel) {
        return Err(DabcastError::NotFound(format!(
            "invalid channel {channel}"
        )));
    }
    if service.starts_with("cover.") {
        return Err(DabcastError::NotFound(service));
    }
    log::info!("[Web] new audio request for {}", service);

    if !radio.can_accept(&channel).await {
        log::debug!(
            "[Web] channel {} busy, retrying once in {:?}",
            channel,
            CHANNEL_SWITCH_RETRY
        );
        tokio::time::sleep(CHANNEL_SWITCH_RETRY).await;
    }

    let controller = radio
        .subscribe(&channel, &service)
        .await
        .map_err(|e| DabcastError::Unavailable(e.to_string()))?;

    // From here on the device delivers the audio stream; forward it until
    // the client disconnects or the subscription is torn down. The guard
    // unsubscribes when the body is dropped, whichever way it ends.
    let guard = SubscriptionGuard {
        radio,
        service: service.clone(),
    };
    let codec = state.codec;
    let body = stream! {
        let _guard = guard;
        let first = controller.await_audio(0).await;
        let Ok((mut cursor, audio)) = first else {
            return;
        };
        if codec == AudioCodec::Pcm {
            let header = create_wav_header(false, 2, 16, controller.current_sample_rate());
            let mut chunk = BytesMut::with_capacity(header.len() + audio.len());
            chunk.extend_from_slice(&header);
            chunk.extend_from_slice(&audio);
            yield Ok::<Bytes, std::io::Error>(chunk.freeze());
        } else {
            yield Ok(audio);
        }
        loop {
            match controller.await_audio(cursor).await {
                Ok((next, audio)) => {
                    cursor = next;
                    yield Ok(audio);
                }
                Err(_) => break,
            }
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, codec.mime_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "Close")
        .body(Body::from_stream(body))
        .map_err(|e| DabcastError::Internal(e.to_string()))
}

/// Unsubscribes when the response body is dropped.
///
/// Covers both endings of a stream: client disconnect (body dropped
/// mid-flight) and subscription teardown (stream completes). In the latter
/// case the subscription entry is already gone and the unsubscribe is a
/// no-op, so the release happens exactly once either way.
struct SubscriptionGuard {
    radio: Arc<RadioController>,
    service: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let radio = Arc::clone(&self.radio);
        let service = std::mem::take(&mut self.service);
        tokio::spawn(async move {
            log::info!("[Web] audio stream for {} ended", service);
            radio.unsubscribe(&service).await;
        });
    }
}
