//! Per-service fan-out: receives driver frames for one subscribed service
//! and distributes them to any number of HTTP readers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::device::ServiceEvents;

/// Returned by the `await_*` calls when the subscription was torn down while
/// (or before) waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribed;

impl std::fmt::Display for Unsubscribed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "service subscription released")
    }
}

impl std::error::Error for Unsubscribed {}

/// A MOT slideshow image as delivered by the driver.
#[derive(Debug, Clone)]
pub struct MotImage {
    pub data: Bytes,
    pub mime_type: String,
    pub name: String,
}

/// Capacity of the recent-audio ring buffer.
pub const AUDIO_BUFFER_FRAMES: usize = 10;

#[derive(Debug)]
struct AudioRing {
    frames: Vec<Bytes>,
    next: usize,
}

impl AudioRing {
    fn new() -> Self {
        Self {
            frames: vec![Bytes::new(); AUDIO_BUFFER_FRAMES],
            next: 0,
        }
    }

    /// Concatenates all frames in `[start, next)` modulo capacity, in
    /// producer order.
    fn concat_from(&self, start: usize) -> Bytes {
        let mut out = BytesMut::new();
        let mut cursor = start;
        while cursor != self.next {
            out.extend_from_slice(&self.frames[cursor]);
            cursor = (cursor + 1) % AUDIO_BUFFER_FRAMES;
        }
        out.freeze()
    }
}

/// Fan-out controller for one subscribed service.
///
/// The driver feeds it through the [`ServiceEvents`] implementation; HTTP
/// readers consume through the `await_*`/`current_*` methods. Audio, label
/// and image each have their own wake primitive so they never interleave.
///
/// Wakes are level-triggered: `notify_waiters` only reaches waiters that are
/// already registered, and every waiter registers (`Notified::enable`)
/// *before* re-checking state, so a frame arriving between the check and the
/// block still wakes it.
#[derive(Debug)]
pub struct ServiceController {
    ring: Mutex<AudioRing>,
    label: RwLock<String>,
    picture: RwLock<Option<MotImage>>,
    sample_rate: AtomicU32,
    audio_mode: RwLock<String>,
    audio_notify: Notify,
    label_notify: Notify,
    picture_notify: Notify,
    shutting_down: AtomicBool,
}

impl ServiceController {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(AudioRing::new()),
            label: RwLock::new(String::new()),
            picture: RwLock::new(None),
            sample_rate: AtomicU32::new(0),
            audio_mode: RwLock::new(String::new()),
            audio_notify: Notify::new(),
            label_notify: Notify::new(),
            picture_notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Returns all unread audio from `start_cursor` up to the write cursor,
    /// blocking first if the reader is fully caught up.
    ///
    /// The returned cursor is the position to pass into the next call. Slow
    /// readers observe frame loss but never out-of-order audio.
    pub async fn await_audio(&self, start_cursor: usize) -> Result<(usize, Bytes), Unsubscribed> {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Unsubscribed);
            }
            // Register before checking the ring so a frame that lands between
            // the check and the await still wakes us.
            let notified = self.audio_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let ring = self.ring.lock();
                if start_cursor != ring.next {
                    return Ok((ring.next, ring.concat_from(start_cursor)));
                }
            }
            notified.await;
        }
    }

    /// Blocks until the driver delivers the next MOT image.
    pub async fn await_picture(&self) -> Result<MotImage, Unsubscribed> {
        log::debug!("[Service] waiting for new picture");
        self.await_change(&self.picture_notify).await?;
        // The wake is only ever issued after the picture was stored.
        self.picture.read().clone().ok_or(Unsubscribed)
    }

    /// Blocks until the next dynamic-label change.
    pub async fn await_label(&self) -> Result<String, Unsubscribed> {
        log::debug!("[Service] waiting for new label");
        self.await_change(&self.label_notify).await?;
        Ok(self.label.read().clone())
    }

    async fn await_change(&self, notify: &Notify) -> Result<(), Unsubscribed> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Unsubscribed);
        }
        notify.notified().await;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Unsubscribed);
        }
        Ok(())
    }

    /// The most recent dynamic label, empty until one was received.
    pub fn current_label(&self) -> String {
        self.label.read().clone()
    }

    /// The most recent MOT image, if any was received yet.
    pub fn current_picture(&self) -> Option<MotImage> {
        self.picture.read().clone()
    }

    /// Sample rate reported with the most recent audio frame, 0 before the
    /// first frame.
    pub fn current_sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    /// Audio mode reported with the most recent frame.
    pub fn current_audio_mode(&self) -> String {
        self.audio_mode.read().clone()
    }

    /// Begins teardown: all three wait primitives are woken once and every
    /// subsequent wait fails fast with [`Unsubscribed`].
    pub fn release_waiters(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.audio_notify.notify_waiters();
        self.label_notify.notify_waiters();
        self.picture_notify.notify_waiters();
    }
}

impl Default for ServiceController {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceEvents for ServiceController {
    fn on_audio(&self, data: Bytes, sample_rate: u32, mode: &str) {
        self.sample_rate.store(sample_rate, Ordering::Release);
        {
            let mut current_mode = self.audio_mode.write();
            if *current_mode != mode {
                *current_mode = mode.to_string();
            }
        }
        {
            let mut ring = self.ring.lock();
            let slot = ring.next;
            ring.frames[slot] = data;
            ring.next = (slot + 1) % AUDIO_BUFFER_FRAMES;
        }
        if !self.shutting_down.load(Ordering::Acquire) {
            self.audio_notify.notify_waiters();
        }
    }

    fn on_dynamic_label(&self, label: &str) {
        *self.label.write() = label.to_string();
        if !self.shutting_down.load(Ordering::Acquire) {
            self.label_notify.notify_waiters();
        }
    }

    fn on_mot(&self, data: Bytes, mime_type: &str, name: &str) {
        *self.picture.write() = Some(MotImage {
            data,
            mime_type: mime_type.to_string(),
            name: name.to_string(),
        });
        if !self.shutting_down.load(Ordering::Acquire) {
            self.picture_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 4])
    }

    #[tokio::test]
    async fn caught_up_reader_returns_unread_frames_in_order() {
        let ctrl = ServiceController::new();
        ctrl.on_audio(Bytes::from_static(b"aa"), 48000, "DAB+");
        ctrl.on_audio(Bytes::from_static(b"bb"), 48000, "DAB+");
        ctrl.on_audio(Bytes::from_static(b"cc"), 48000, "DAB+");

        let (cursor, audio) = ctrl.await_audio(0).await.unwrap();
        assert_eq!(cursor, 3);
        assert_eq!(&audio[..], b"aabbcc");
        assert_eq!(ctrl.current_sample_rate(), 48000);
        assert_eq!(ctrl.current_audio_mode(), "DAB+");
    }

    #[tokio::test]
    async fn cursor_wraps_around_the_ring() {
        let ctrl = ServiceController::new();
        for i in 0..AUDIO_BUFFER_FRAMES + 2 {
            ctrl.on_audio(frame(i as u8), 48000, "DAB+");
        }
        // Reader last saw cursor 8; frames 8..11 span the wrap point.
        let (cursor, audio) = ctrl.await_audio(8).await.unwrap();
        assert_eq!(cursor, 2);
        assert_eq!(audio.len(), 4 * 4);
        assert_eq!(audio[0], 8);
        assert_eq!(audio[4], 9);
        assert_eq!(audio[8], 10);
        assert_eq!(audio[12], 11);
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_new_frame() {
        let ctrl = Arc::new(ServiceController::new());
        let waiter = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.await_audio(0).await })
        };
        tokio::task::yield_now().await;
        ctrl.on_audio(Bytes::from_static(b"live"), 48000, "DAB+");

        let (cursor, audio) = waiter.await.unwrap().unwrap();
        assert_eq!(cursor, 1);
        assert_eq!(&audio[..], b"live");
    }

    #[tokio::test]
    async fn release_waiters_fails_all_waits() {
        let ctrl = Arc::new(ServiceController::new());
        let audio = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.await_audio(0).await })
        };
        let label = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.await_label().await })
        };
        let picture = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.await_picture().await })
        };
        tokio::task::yield_now().await;

        ctrl.release_waiters();
        assert_eq!(audio.await.unwrap(), Err(Unsubscribed));
        assert_eq!(label.await.unwrap().unwrap_err(), Unsubscribed);
        assert!(picture.await.unwrap().is_err());

        // Subsequent waits fail fast instead of hanging.
        assert_eq!(ctrl.await_audio(0).await, Err(Unsubscribed));
        assert!(ctrl.await_label().await.is_err());
    }

    #[tokio::test]
    async fn label_wait_only_returns_on_change() {
        let ctrl = Arc::new(ServiceController::new());
        ctrl.on_dynamic_label("old title");

        let waiter = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.await_label().await })
        };
        // The waiter must not complete off the already-stored label.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ctrl.on_dynamic_label("new title");
        assert_eq!(waiter.await.unwrap().unwrap(), "new title");
        assert_eq!(ctrl.current_label(), "new title");
    }

    #[tokio::test(start_paused = true)]
    async fn picture_wait_returns_next_image() {
        let ctrl = Arc::new(ServiceController::new());
        let waiter = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.await_picture().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        ctrl.on_mot(Bytes::from_static(b"jpeg-bytes"), "image/jpeg", "slide");
        let image = waiter.await.unwrap().unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(&image.data[..], b"jpeg-bytes");
        assert_eq!(image.name, "slide");
    }
}
