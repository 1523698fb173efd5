//! HTTP API layer.
//!
//! This module contains thin handlers that delegate to the radio, scanner
//! and cast subsystems. It provides the router construction and server
//! startup functionality.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::cast::ImageCache;
use crate::context::NetworkContext;
use crate::error::DabcastError;
use crate::radio::{DabScanner, RadioController};
use crate::stream::AudioCodec;

pub mod http;
mod stream;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind or serve on the configured port.
    #[error("Failed to run HTTP server: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// Either subsystem may be absent: a missing radio controller means the DAB
/// side is disabled (no driver or `--disable-dabserver`) and its routes
/// answer 503; a missing image cache means the cast side is disabled and
/// `/mpd_image` answers 404.
#[derive(Clone)]
pub struct AppState {
    radio: Option<Arc<RadioController>>,
    scanner: Option<Arc<DabScanner>>,
    image_cache: Option<Arc<ImageCache>>,
    pub network: NetworkContext,
    pub codec: AudioCodec,
    pub web_root: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        radio: Option<Arc<RadioController>>,
        scanner: Option<Arc<DabScanner>>,
        image_cache: Option<Arc<ImageCache>>,
        network: NetworkContext,
        codec: AudioCodec,
        web_root: PathBuf,
    ) -> Self {
        Self {
            radio,
            scanner,
            image_cache,
            network,
            codec,
            web_root,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the process as shutting down; audio requests are rejected from
    /// here on.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn radio(&self) -> Result<&Arc<RadioController>, DabcastError> {
        self.radio
            .as_ref()
            .ok_or_else(|| DabcastError::Unavailable("DAB subsystem is disabled".into()))
    }

    pub(crate) fn scanner(&self) -> Result<&Arc<DabScanner>, DabcastError> {
        self.scanner
            .as_ref()
            .ok_or_else(|| DabcastError::Unavailable("DAB subsystem is disabled".into()))
    }

    pub(crate) fn image_cache(&self) -> Result<&Arc<ImageCache>, DabcastError> {
        self.image_cache
            .as_ref()
            .ok_or_else(|| DabcastError::NotFound("cast subsystem is disabled".into()))
    }
}

/// A server that has successfully bound its port but is not serving yet.
///
/// Binding is separated from serving so that a bind failure can be treated
/// as fatal at bootstrap while the serve loop runs detached.
pub struct BoundServer {
    listener: tokio::net::TcpListener,
    state: AppState,
}

impl BoundServer {
    pub async fn serve(self) -> Result<(), ServerError> {
        let app = http::create_router(self.state);
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

/// Binds the HTTP server on the configured port.
pub async fn bind_server(state: AppState) -> Result<BoundServer, ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.network.port()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://0.0.0.0:{}", state.network.port());
    Ok(BoundServer { listener, state })
}

/// Binds and serves in one step.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    bind_server(state).await?.serve().await
}
