//! MPD → cast device mirror.
//!
//! Runs two nested loops: the outer one discovers the configured device and
//! (re)connects to it, the inner one observes MPD through its idle protocol
//! and keeps the device in sync: the cast starts when MPD starts playing
//! its httpd output, stops when MPD stops, and track metadata is
//! re-dispatched whenever the current song (or its live metadata) changes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cast::device::{CastAddr, CastError, CastEvent};
use crate::cast::{CastData, DabStation, ImageCache, MpdClient, MpdConfig, SongInfo, TvheadendChannel};
use crate::context::NetworkContext;

/// Album art used when a song brings none of its own.
const DEFAULT_SONG_IMAGE: &str = "https://www.musicpd.org/logo.png";

/// Content type the MPD httpd output streams.
const MPD_STREAM_CONTENT_TYPE: &str = "audio/mpga";

/// Pause before retrying after a failed device or MPD connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Extra delay after an EPG show's stop time before refreshing, so the next
/// show is already the current one.
const SHOW_CHANGE_SLACK: Duration = Duration::from_secs(10);

/// Finds the configured cast device on the network.
#[async_trait]
pub trait DeviceFinder: Send + Sync {
    async fn find_device(&self) -> Option<CastAddr>;
}

/// Command surface of a connected cast session.
#[async_trait]
pub trait MediaTarget: Send + Sync {
    /// Tells the device to play `stream_url` and waits for the media
    /// session to establish.
    async fn start_stream(&self, stream_url: &str, content_type: &str) -> Result<(), CastError>;
    /// Pushes per-track metadata to the receiver.
    async fn update_metadata(&self, data: &CastData) -> Result<(), CastError>;
    /// Quits the receiver app if it is still ours.
    async fn quit_if_ours(&self) -> Result<(), CastError>;
}

/// Opens a session to a discovered device.
#[async_trait]
pub trait CastConnector: Send + Sync {
    async fn connect(
        &self,
        addr: &CastAddr,
    ) -> Result<(Arc<dyn MediaTarget>, mpsc::UnboundedReceiver<CastEvent>), CastError>;
}

/// Metadata refresh tasks attached to the currently mirrored track.
///
/// A fresh (non-dynamic) track dispatch cancels the previous trio; a dynamic
/// re-dispatch fired by one of the trio's own loops must not, or the loops
/// would cancel themselves.
#[derive(Default)]
struct UpdateTasks {
    tvh_show: Option<JoinHandle<()>>,
    dab_label: Option<JoinHandle<()>>,
    dab_image: Option<JoinHandle<()>>,
}

impl UpdateTasks {
    fn cancel_all(&mut self) {
        for task in [
            self.tvh_show.take(),
            self.dab_label.take(),
            self.dab_image.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Mirrors the local MPD player onto a cast device.
pub struct MpdCaster {
    config: MpdConfig,
    network: NetworkContext,
    image_cache: Arc<ImageCache>,
    finder: Arc<dyn DeviceFinder>,
    connector: Arc<dyn CastConnector>,
    updater: Mutex<UpdateTasks>,
    dab_station: Mutex<Option<Arc<DabStation>>>,
    // Last metadata pushed to the receiver. The update tasks re-dispatch on
    // every watcher wakeup; pushing unchanged metadata would make the cast
    // session reload the live stream for nothing.
    last_dispatch: Mutex<Option<CastData>>,
    main_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    weak_self: Weak<Self>,
}

impl MpdCaster {
    pub fn new(
        config: MpdConfig,
        network: NetworkContext,
        image_cache: Arc<ImageCache>,
        finder: Arc<dyn DeviceFinder>,
        connector: Arc<dyn CastConnector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            network,
            image_cache,
            finder,
            connector,
            updater: Mutex::new(UpdateTasks::default()),
            dab_station: Mutex::new(None),
            last_dispatch: Mutex::new(None),
            main_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// A `&self` can only exist while an `Arc` is alive.
    fn strong(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("caster is alive")
    }

    /// Starts the mirror in the background.
    pub fn start(&self) {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.strong().run(token.clone()));
        *self.main_task.lock() = Some((token, task));
    }

    /// Winds the bridge down: cancels the mirror loop, then stops the
    /// update tasks.
    pub async fn stop(&self) {
        let running = self.main_task.lock().take();
        if let Some((token, task)) = running {
            token.cancel();
            let _ = task.await;
        }
        self.stop_update_tasks();
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let addr = tokio::select! {
                _ = cancel.cancelled() => return,
                addr = self.finder.find_device() => addr,
            };
            let Some(addr) = addr else {
                if cancellable_sleep(&cancel, RECONNECT_DELAY).await {
                    return;
                }
                continue;
            };
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                connected = self.connector.connect(&addr) => connected,
            };
            let (target, events) = match connected {
                Ok(connected) => connected,
                Err(e) => {
                    log::warn!("[Caster] could not open cast session: {}", e);
                    if cancellable_sleep(&cancel, RECONNECT_DELAY).await {
                        return;
                    }
                    continue;
                }
            };
            log::info!("[Caster] mirroring to '{}'", addr.friendly_name);

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_update_tasks();
                    if let Err(e) = target.quit_if_ours().await {
                        log::warn!("[Caster] failed to quit receiver app: {}", e);
                    }
                    return;
                }
                _ = self.cast_until_connection_lost(Arc::clone(&target), events) => {
                    // device or MPD vanished; rediscover
                }
            }
        }
    }

    /// Inner mirror loop; returns when the cast device or MPD disconnects.
    async fn cast_until_connection_lost(
        &self,
        target: Arc<dyn MediaTarget>,
        mut events: mpsc::UnboundedReceiver<CastEvent>,
    ) {
        let mut client = match MpdClient::connect("localhost", self.config.port).await {
            Ok(client) => client,
            Err(e) => {
                log::error!("[Caster] cannot reach MPD: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                return;
            }
        };

        let initial_status = client.status().await.unwrap_or_default();
        // avoid spontaneous playback when the cast device becomes available,
        // e.g. after a nightly reboot
        let mut ignore_current_playback =
            initial_status.get("state").map(String::as_str) == Some("play");
        let mut cast_is_active = false;
        let mut processed_song: Option<SongInfo> = None;

        loop {
            // Wait out one idle round. An in-flight `idle` must never be
            // abandoned for a non-fatal cast event, so the idle future is
            // polled to completion across those.
            let changed = {
                let mut idle = std::pin::pin!(client.idle());
                loop {
                    tokio::select! {
                        event = events.recv() => {
                            match event {
                                None | Some(CastEvent::ConnectionLost) => {
                                    log::info!("[Caster] cast device connection lost");
                                    if cast_is_active {
                                        self.handle_stop_play(target.as_ref()).await;
                                    }
                                    return;
                                }
                                Some(CastEvent::LoadFailed) => {
                                    log::warn!("[Caster] receiver rejected the media load");
                                }
                                Some(CastEvent::MediaSession(_)) => {}
                            }
                        }
                        changed = &mut idle => break changed,
                    }
                }
            };
            if changed.is_err() {
                log::info!("[Caster] connection to MPD lost");
                self.handle_stop_play(target.as_ref()).await;
                return;
            }

            let Ok(status) = client.status().await else {
                self.handle_stop_play(target.as_ref()).await;
                return;
            };
            let is_playing = status.get("state").map(String::as_str) == Some("play");

            // keep ignoring until MPD stops for the first time
            ignore_current_playback = ignore_current_playback && is_playing;
            if ignore_current_playback {
                continue;
            }

            if !cast_is_active && is_playing {
                match self.handle_start_play(target.as_ref()).await {
                    Ok(()) => cast_is_active = true,
                    Err(e) => {
                        log::error!("[Caster] failed to start cast: {}", e);
                        continue;
                    }
                }
            } else if cast_is_active && !is_playing {
                self.handle_stop_play(target.as_ref()).await;
                processed_song = None;
                cast_is_active = false;
            }

            let current_song = client.current_song().await.unwrap_or(None);
            if cast_is_active {
                if let Some(song) = current_song {
                    if processed_song.as_ref() != Some(&song) {
                        log::info!("[Caster] current song: {:?}", song.file());
                        self.handle_new_song(&target, &song, Some(&mut client), false)
                            .await;
                        processed_song = Some(song);
                    }
                }
            }
        }
    }

    async fn handle_start_play(&self, target: &dyn MediaTarget) -> Result<(), CastError> {
        let stream_url = self
            .network
            .url_builder()
            .mpd_stream_url(self.config.streaming_port);
        log::info!("[Caster] starting cast of {}", stream_url);
        // fresh receiver session: whatever metadata it had is gone
        *self.last_dispatch.lock() = None;
        target
            .start_stream(&stream_url, MPD_STREAM_CONTENT_TYPE)
            .await
    }

    async fn handle_stop_play(&self, target: &dyn MediaTarget) {
        self.stop_update_tasks();
        *self.last_dispatch.lock() = None;
        if let Err(e) = target.quit_if_ours().await {
            log::warn!("[Caster] failed to quit receiver app: {}", e);
        }
    }

    fn stop_update_tasks(&self) {
        self.updater.lock().cancel_all();
        *self.dab_station.lock() = None;
    }

    /// Re-dispatch entry point for the update-task loops; boxed to break the
    /// future type cycle with `handle_new_song`.
    fn dispatch_song(
        &self,
        target: &Arc<dyn MediaTarget>,
        song: SongInfo,
        dynamic: bool,
    ) -> BoxFuture<'static, ()> {
        let this = self.strong();
        let target = Arc::clone(target);
        Box::pin(async move {
            this.handle_new_song(&target, &song, None, dynamic).await;
        })
    }

    /// Resolves and pushes metadata for the current song.
    ///
    /// `dynamic` marks a re-dispatch fired by one of the update tasks; only
    /// a fresh track change cancels the previous task trio.
    async fn handle_new_song(
        &self,
        target: &Arc<dyn MediaTarget>,
        song: &SongInfo,
        client: Option<&mut MpdClient>,
        dynamic: bool,
    ) {
        if !dynamic {
            self.stop_update_tasks();
        }
        let Some(file) = song.file().map(str::to_string) else {
            return;
        };
        let mut cast_data = CastData {
            image_url: DEFAULT_SONG_IMAGE.to_string(),
            ..CastData::default()
        };

        if file.starts_with("http") {
            self.resolve_stream_metadata(target, song, &file, &mut cast_data)
                .await;
        } else {
            self.fill_local_cast_data(&mut cast_data, song, &file, client)
                .await;
        }

        // The watcher wakeups outnumber the actual changes (repeated labels,
        // EPG re-checks); only changed metadata goes to the device.
        if self.last_dispatch.lock().as_ref() == Some(&cast_data) {
            log::debug!("[Caster] metadata unchanged, skipping update");
            return;
        }

        log::info!(
            "[Caster] update details: title: {} artist: {} image_url: {}",
            cast_data.title,
            cast_data.artist,
            cast_data.image_url
        );
        match target.update_metadata(&cast_data).await {
            Ok(()) => *self.last_dispatch.lock() = Some(cast_data),
            Err(e) => log::warn!("[Caster] metadata update failed: {}", e),
        }
    }

    /// Metadata for http items: an already-watched DAB station, a TVHeadend
    /// channel, or a new DAB station (in that order).
    async fn resolve_stream_metadata(
        &self,
        target: &Arc<dyn MediaTarget>,
        song: &SongInfo,
        file: &str,
        cast_data: &mut CastData,
    ) {
        let active_station = self.dab_station.lock().clone();
        if let Some(station) = active_station {
            // label or image update of the active DAB station
            station.fill_cast_data(cast_data);
            return;
        }

        if let Some(mut tvh) = TvheadendChannel::new(file) {
            if tvh.initialize().await {
                tvh.fill_cast_data(cast_data).await;
                if let Some(remaining) = tvh.remaining_show_time() {
                    let delay =
                        Duration::from_secs(remaining.max(0) as u64) + SHOW_CHANGE_SLACK;
                    let this = self.strong();
                    let target = Arc::clone(target);
                    let song = song.clone();
                    self.updater.lock().tvh_show = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        this.dispatch_song(&target, song, true).await;
                    }));
                }
                return;
            }
        }

        if let Some(station) = DabStation::new(file) {
            if station.initialize().await {
                log::info!("[Caster] new DAB station");
                let station = Arc::new(station);
                station.fill_cast_data(cast_data);
                *self.dab_station.lock() = Some(Arc::clone(&station));

                let mut updater = self.updater.lock();
                updater.dab_label = Some(tokio::spawn({
                    let this = self.strong();
                    let target = Arc::clone(target);
                    let station = Arc::clone(&station);
                    let song = song.clone();
                    async move {
                        loop {
                            station.new_label().await;
                            this.dispatch_song(&target, song.clone(), true).await;
                        }
                    }
                }));
                updater.dab_image = Some(tokio::spawn({
                    let this = self.strong();
                    let target = Arc::clone(target);
                    let song = song.clone();
                    async move {
                        loop {
                            station.new_image().await;
                            this.dispatch_song(&target, song.clone(), true).await;
                        }
                    }
                }));
            }
        }
    }

    /// Metadata for local files: tags from the song record, picture via
    /// MPD's readpicture, served from the in-memory image cache.
    async fn fill_local_cast_data(
        &self,
        cast_data: &mut CastData,
        song: &SongInfo,
        file: &str,
        client: Option<&mut MpdClient>,
    ) {
        cast_data.title = song
            .title()
            .or_else(|| song.name())
            .unwrap_or_default()
            .to_string();
        let Some(artist) = song.artist() else {
            return;
        };
        cast_data.artist = artist.to_string();
        let Some(client) = client else {
            return;
        };
        match client.read_picture(file).await {
            Ok(Some(picture)) => {
                cast_data.image_url =
                    self.image_cache
                        .store(file, picture.mime_type, picture.data.into());
            }
            Ok(None) => {}
            // best-effort: keep the default image and carry on
            Err(e) => log::warn!("[Caster] readpicture failed: {}", e),
        }
    }

    #[cfg(test)]
    fn set_tvh_task_for_test(&self, task: JoinHandle<()>) {
        self.updater.lock().tvh_show = Some(task);
    }

    #[cfg(test)]
    fn has_update_tasks(&self) -> bool {
        let updater = self.updater.lock();
        updater.tvh_show.is_some() || updater.dab_label.is_some() || updater.dab_image.is_some()
    }
}

/// Sleeps unless cancelled first; true means cancelled.
async fn cancellable_sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
