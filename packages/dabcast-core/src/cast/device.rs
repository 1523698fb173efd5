//! Cast session over the Google Cast wire protocol.
//!
//! The `rust_cast` socket is synchronous, so the session runs split across
//! two worlds: commands are issued through `spawn_blocking`, and a dedicated
//! OS thread drains incoming messages, answering heartbeats and forwarding
//! everything of interest into a tokio channel as [`CastEvent`]s. No cast
//! state is touched off the tokio scheduler.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_cast::channels::connection::ConnectionResponse;
use rust_cast::channels::heartbeat::HeartbeatResponse;
use rust_cast::channels::media::{
    Image, Media, MediaResponse, Metadata, MusicTrackMediaMetadata, StreamType,
};
use rust_cast::channels::receiver::CastDeviceApp;
use rust_cast::{CastDevice, ChannelMessage};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::cast::caster::{CastConnector, MediaTarget};
use crate::cast::CastData;

/// App id of the local media player receiver app.
pub const APP_LOCAL_MEDIA_PLAYER: &str = "D29D8DD1";

/// Default destination for the initial virtual connection.
const DEFAULT_DESTINATION_ID: &str = "receiver-0";

/// Public redirect service the receiver app loads its page through, to
/// avoid CORS violations on the cast device.
const RECEIVER_REDIRECTOR_URL: &str = "https://lamarqe.pythonanywhere.com/storeforwardurl";

/// How long to wait for a media session id after a load request.
const MEDIA_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Network address of a discovered cast device.
#[derive(Debug, Clone)]
pub struct CastAddr {
    pub host: String,
    pub port: u16,
    pub friendly_name: String,
}

/// Session-level events forwarded to the mirror loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastEvent {
    /// A media status update carried a session id.
    MediaSession(i32),
    /// The receiver rejected a load request.
    LoadFailed,
    /// The device closed the connection or the socket died.
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum CastError {
    #[error("Failed to connect to cast device: {0}")]
    Connect(String),
    #[error("Cast protocol error: {0}")]
    Protocol(String),
    #[error("No media session established within {0:?}")]
    SessionTimeout(Duration),
    #[error("No app launched")]
    NotLaunched,
}

impl From<rust_cast::errors::Error> for CastError {
    fn from(err: rust_cast::errors::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Running app the session launched on the device.
#[derive(Clone)]
struct AppHandle {
    transport_id: String,
    session_id: String,
    content_url: String,
    content_type: String,
}

struct MediaSessionWatch {
    id: Mutex<Option<i32>>,
    notify: Notify,
}

/// An established connection to one cast device.
pub struct CastSession {
    device: Arc<CastDevice<'static>>,
    receiver_page_url: String,
    app: Mutex<Option<AppHandle>>,
    media_session: Arc<MediaSessionWatch>,
}

impl CastSession {
    /// Connects to the device, quits whatever app is running, and starts the
    /// message-receive thread.
    pub async fn connect(
        addr: &CastAddr,
        receiver_page_url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CastEvent>), CastError> {
        let host = addr.host.clone();
        let port = addr.port;
        let device = tokio::task::spawn_blocking(move || {
            let device = CastDevice::connect_without_host_verification(host, port)
                .map_err(|e| CastError::Connect(e.to_string()))?;
            device.connection.connect(DEFAULT_DESTINATION_ID)?;
            // Quit a foreign app so our receiver can take over cleanly.
            let status = device.receiver.get_status()?;
            for app in status.applications {
                log::info!("[Cast] quitting running app {}", app.app_id);
                device.receiver.stop_app(app.session_id.as_str())?;
            }
            Ok::<_, CastError>(device)
        })
        .await
        .map_err(|e| CastError::Connect(e.to_string()))??;

        let device = Arc::new(device);
        let media_session = Arc::new(MediaSessionWatch {
            id: Mutex::new(None),
            notify: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let device = Arc::clone(&device);
            let watch = Arc::clone(&media_session);
            std::thread::spawn(move || Self::receive_loop(device, watch, tx));
        }

        Ok((
            Arc::new(Self {
                device,
                receiver_page_url: receiver_page_url.to_string(),
                app: Mutex::new(None),
                media_session,
            }),
            rx,
        ))
    }

    /// Runs on a dedicated OS thread; the only place that reads the socket.
    fn receive_loop(
        device: Arc<CastDevice<'static>>,
        watch: Arc<MediaSessionWatch>,
        tx: mpsc::UnboundedSender<CastEvent>,
    ) {
        loop {
            match device.receive() {
                Ok(ChannelMessage::Heartbeat(response)) => {
                    if matches!(response, HeartbeatResponse::Ping) {
                        if let Err(e) = device.heartbeat.pong() {
                            log::warn!("[Cast] failed to answer ping: {}", e);
                        }
                    }
                }
                Ok(ChannelMessage::Connection(ConnectionResponse::Close)) => {
                    log::info!("[Cast] device closed the connection");
                    let _ = tx.send(CastEvent::ConnectionLost);
                    break;
                }
                Ok(ChannelMessage::Media(MediaResponse::Status(status))) => {
                    for entry in status.entries {
                        *watch.id.lock() = Some(entry.media_session_id);
                        watch.notify.notify_waiters();
                        let _ = tx.send(CastEvent::MediaSession(entry.media_session_id));
                    }
                }
                Ok(ChannelMessage::Media(MediaResponse::LoadFailed(_))) => {
                    let _ = tx.send(CastEvent::LoadFailed);
                }
                Ok(_) => {}
                Err(e) => {
                    log::info!("[Cast] receive failed, connection gone: {}", e);
                    let _ = tx.send(CastEvent::ConnectionLost);
                    break;
                }
            }
        }
    }

    /// Re-registers the local receiver page with the public redirector.
    /// Best-effort: the receiver may still have the URL from a previous run.
    async fn register_receiver_page(&self) {
        let client = reqwest::Client::new();
        let result = client
            .post(RECEIVER_REDIRECTOR_URL)
            .form(&[("localForwardURL", self.receiver_page_url.as_str())])
            .timeout(Duration::from_secs(30))
            .send()
            .await;
        match result {
            Ok(response) => log::info!("[Cast] receiver page registered: {}", response.status()),
            Err(e) => log::warn!("[Cast] receiver page registration failed: {}", e),
        }
    }

    /// Waits until a media status update carries a session id.
    async fn wait_for_media_session(&self) -> Result<i32, CastError> {
        let deadline = tokio::time::Instant::now() + MEDIA_SESSION_TIMEOUT;
        loop {
            let notified = self.media_session.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(id) = *self.media_session.id.lock() {
                return Ok(id);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CastError::SessionTimeout(MEDIA_SESSION_TIMEOUT));
                }
            }
        }
    }
}

#[async_trait]
impl MediaTarget for CastSession {
    async fn start_stream(&self, stream_url: &str, content_type: &str) -> Result<(), CastError> {
        self.register_receiver_page().await;
        *self.media_session.id.lock() = None;

        let device = Arc::clone(&self.device);
        let app_id = CastDeviceApp::from_str(APP_LOCAL_MEDIA_PLAYER)
            .unwrap_or(CastDeviceApp::Custom(APP_LOCAL_MEDIA_PLAYER.to_string()));
        let launched = tokio::task::spawn_blocking(move || {
            let app = device.receiver.launch_app(&app_id)?;
            device.connection.connect(app.transport_id.as_str())?;
            Ok::<_, CastError>(app)
        })
        .await
        .map_err(|e| CastError::Protocol(e.to_string()))??;

        let handle = AppHandle {
            transport_id: launched.transport_id,
            session_id: launched.session_id,
            content_url: stream_url.to_string(),
            content_type: content_type.to_string(),
        };
        *self.app.lock() = Some(handle.clone());

        let this_device = Arc::clone(&self.device);
        let load_handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            let media = Media {
                content_id: load_handle.content_url.clone(),
                stream_type: StreamType::Live,
                content_type: load_handle.content_type.clone(),
                metadata: Some(Metadata::MusicTrack(MusicTrackMediaMetadata {
                    title: Some("Streaming MPD".to_string()),
                    ..MusicTrackMediaMetadata::default()
                })),
                duration: None,
            };
            this_device.media.load(
                load_handle.transport_id.as_str(),
                load_handle.session_id.as_str(),
                &media,
            )?;
            Ok::<_, CastError>(())
        })
        .await
        .map_err(|e| CastError::Protocol(e.to_string()))??;

        let session_id = self.wait_for_media_session().await?;
        log::info!("[Cast] media session {} established", session_id);
        Ok(())
    }

    async fn update_metadata(&self, data: &CastData) -> Result<(), CastError> {
        let app = self.app.lock().clone().ok_or(CastError::NotLaunched)?;
        let metadata = MusicTrackMediaMetadata {
            title: Some(data.title.clone()),
            artist: Some(data.artist.clone()),
            images: vec![Image {
                url: data.image_url.clone(),
                dimensions: None,
            }],
            ..MusicTrackMediaMetadata::default()
        };
        // The stock media channel has no metadata-only request; metadata
        // rides along with a load. Callers only invoke this when the
        // metadata actually changed.
        let this = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            let media = Media {
                content_id: app.content_url.clone(),
                stream_type: StreamType::Live,
                content_type: app.content_type.clone(),
                metadata: Some(Metadata::MusicTrack(metadata)),
                duration: None,
            };
            this.media
                .load(app.transport_id.as_str(), app.session_id.as_str(), &media)?;
            Ok::<_, CastError>(())
        })
        .await
        .map_err(|e| CastError::Protocol(e.to_string()))??;
        Ok(())
    }

    async fn quit_if_ours(&self) -> Result<(), CastError> {
        *self.app.lock() = None;
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            let status = device.receiver.get_status()?;
            for app in status.applications {
                if app.app_id == APP_LOCAL_MEDIA_PLAYER {
                    log::info!("[Cast] quitting our receiver app");
                    device.receiver.stop_app(app.session_id.as_str())?;
                }
            }
            Ok::<_, CastError>(())
        })
        .await
        .map_err(|e| CastError::Protocol(e.to_string()))??;
        Ok(())
    }
}

/// Production connector: dials the discovered device with [`CastSession`].
pub struct CastSessionConnector {
    receiver_page_url: String,
}

impl CastSessionConnector {
    pub fn new(receiver_page_url: String) -> Self {
        Self { receiver_page_url }
    }
}

#[async_trait]
impl CastConnector for CastSessionConnector {
    async fn connect(
        &self,
        addr: &CastAddr,
    ) -> Result<(Arc<dyn MediaTarget>, mpsc::UnboundedReceiver<CastEvent>), CastError> {
        let (session, events) = CastSession::connect(addr, &self.receiver_page_url).await?;
        Ok((session as Arc<dyn MediaTarget>, events))
    }
}
