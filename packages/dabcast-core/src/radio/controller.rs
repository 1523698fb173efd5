//! Tuner arbitration.
//!
//! At most one channel is tuned at a time. Subscriptions to services within
//! the tuned channel are ref-counted and share one [`ServiceController`] per
//! service id. When the last subscriber leaves, the channel is not released
//! immediately: a drain timer keeps it tuned for a grace window so UI churn
//! (unsubscribe immediately followed by a subscribe) does not retune.
//!
//! The arbitration lock is held only across bookkeeping and fast driver
//! calls; the multi-second service-discovery poll runs unlocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::device::{ChannelEvents, LeaseOwner, ServiceEvents, TunerDevice};
use crate::error::{DabcastError, DabcastResult};
use crate::radio::service_controller::ServiceController;

/// Total time a subscribe waits for the requested service to appear in the
/// tuned channel.
pub const SERVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval within the discovery window.
pub const SERVICE_DISCOVERY_POLL: Duration = Duration::from_millis(500);

/// Grace window between the last unsubscribe and the tuner release.
pub const CHANNEL_RELEASE_GRACE: Duration = Duration::from_secs(5);

struct Subscription {
    controller: Arc<ServiceController>,
    subscribers: usize,
}

struct DrainTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// State guarded by the arbitration lock.
///
/// The tuner state machine is implicit in these fields: `current_channel`
/// `None` is Idle, `Some` with no drain is Tuned, `Some` with a pending
/// drain is Draining.
#[derive(Default)]
struct TunerState {
    current_channel: Option<String>,
    subscriptions: HashMap<u32, Subscription>,
    drain: Option<DrainTimer>,
    drain_generation: u64,
}

/// Mediates all access to the single tuner for live listeners.
pub struct RadioController {
    device: Arc<dyn TunerDevice>,
    state: Mutex<TunerState>,
    // Touched by driver callbacks; kept outside the arbitration lock.
    discovered: SyncMutex<HashMap<u32, Option<String>>>,
    ensemble_label: SyncMutex<Option<String>>,
    last_datetime: AtomicI64,
    weak_self: Weak<Self>,
}

impl RadioController {
    pub fn new(device: Arc<dyn TunerDevice>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            device,
            state: Mutex::new(TunerState::default()),
            discovered: SyncMutex::new(HashMap::new()),
            ensemble_label: SyncMutex::new(None),
            last_datetime: AtomicI64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// A `&self` can only exist while an `Arc` is alive.
    fn strong(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("controller is alive")
    }

    /// Whether an audio request for `channel` can currently proceed:
    /// the tuner is idle, already on `channel`, or draining (a drain can be
    /// cancelled or fired early).
    pub async fn can_accept(&self, channel: &str) -> bool {
        let st = self.state.lock().await;
        match st.current_channel.as_deref() {
            None => true,
            Some(current) => current == channel || st.drain.is_some(),
        }
    }

    /// The currently tuned channel, if any.
    pub async fn current_channel(&self) -> Option<String> {
        self.state.lock().await.current_channel.clone()
    }

    /// The ensemble label of the tuned channel, once the driver reported it.
    pub fn ensemble_label(&self) -> Option<String> {
        self.ensemble_label.lock().clone()
    }

    /// Last UTC timestamp received from the FIC, unix seconds.
    pub fn last_datetime(&self) -> Option<i64> {
        match self.last_datetime.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// The fan-out controller of a currently subscribed service, by display
    /// name. `None` when the service is not subscribed right now.
    pub async fn service_controller(&self, service_name: &str) -> Option<Arc<ServiceController>> {
        let service_id = self.lookup_service_id(service_name)?;
        let st = self.state.lock().await;
        st.subscriptions
            .get(&service_id)
            .map(|sub| Arc::clone(&sub.controller))
    }

    /// Subscribes to `service_name` within `channel`.
    ///
    /// Atomically resolves channel readiness (tuning if idle, cancelling or
    /// early-firing a pending drain), waits for the service to be discovered,
    /// then attaches to the shared [`ServiceController`], creating it and the
    /// driver subscription on first use.
    pub async fn subscribe(
        &self,
        channel: &str,
        service_name: &str,
    ) -> DabcastResult<Arc<ServiceController>> {
        {
            let mut st = self.state.lock().await;
            match st.current_channel.as_deref() {
                Some(current) if current != channel => {
                    if st.drain.is_some() {
                        // Fire the pending release early so we can retune.
                        log::info!(
                            "[Radio] firing drain of {} early for subscribe to {}",
                            current,
                            channel
                        );
                        self.cancel_drain(&mut st);
                        self.reset_tuner(&mut st);
                    } else {
                        log::error!("[Radio] there is another channel active: {}", current);
                        return Err(DabcastError::TunerBusy(format!(
                            "channel {current} is active"
                        )));
                    }
                }
                Some(_) => self.cancel_drain(&mut st),
                None => {}
            }

            if st.current_channel.is_none() {
                let handler = self.strong() as Arc<dyn ChannelEvents>;
                if !self
                    .device
                    .lease()
                    .try_acquire(LeaseOwner::RadioController, handler)
                {
                    log::error!("[Radio] DAB device is locked. No playback possible.");
                    return Err(DabcastError::TunerBusy(
                        "DAB device is locked. No playback possible.".into(),
                    ));
                }
                if !self.device.set_channel(channel, false) {
                    self.device.lease().release(LeaseOwner::RadioController);
                    return Err(DabcastError::Unavailable(format!(
                        "could not tune channel {channel}"
                    )));
                }
                st.current_channel = Some(channel.to_string());
            }
        }

        // The subscriber may abandon the request mid-discovery; the guard
        // schedules a deferred release so the tuner cannot stay tuned with
        // nobody attached.
        let mut guard = DiscoveryGuard::new(self.strong(), channel);
        let service_id = self.wait_for_service(service_name).await;
        let mut st = self.state.lock().await;
        guard.defuse();

        let Some(service_id) = service_id else {
            log::error!(
                "[Radio] service {} is not part of channel {}",
                service_name,
                channel
            );
            if st.subscriptions.is_empty() && st.current_channel.as_deref() == Some(channel) {
                self.schedule_drain(&mut st);
            }
            return Err(DabcastError::NotFound(format!(
                "service {service_name} not found in channel {channel}"
            )));
        };

        if st.current_channel.as_deref() != Some(channel) {
            // The channel was released or retuned while we polled.
            return Err(DabcastError::TunerBusy(
                "channel changed during service discovery".into(),
            ));
        }
        self.cancel_drain(&mut st);

        if let Some(sub) = st.subscriptions.get_mut(&service_id) {
            sub.subscribers += 1;
            log::debug!("[Radio] subscribers: {}", sub.subscribers);
            return Ok(Arc::clone(&sub.controller));
        }

        let controller = Arc::new(ServiceController::new());
        let handler = Arc::clone(&controller) as Arc<dyn ServiceEvents>;
        if !self.device.subscribe_service(handler, service_id) {
            log::error!("[Radio] subscription to service {} failed", service_name);
            if st.subscriptions.is_empty() {
                self.schedule_drain(&mut st);
            }
            return Err(DabcastError::Unavailable(format!(
                "subscription to {service_name} failed"
            )));
        }
        st.subscriptions.insert(
            service_id,
            Subscription {
                controller: Arc::clone(&controller),
                subscribers: 1,
            },
        );
        log::debug!("[Radio] subscribers: 1");
        Ok(controller)
    }

    /// Symmetric decrement; tears down the service on last unsubscribe and
    /// schedules the deferred channel release when no subscription remains.
    pub async fn unsubscribe(&self, service_name: &str) {
        let Some(service_id) = self.lookup_service_id(service_name) else {
            return;
        };
        let mut st = self.state.lock().await;
        let Some(sub) = st.subscriptions.get_mut(&service_id) else {
            return;
        };
        sub.subscribers -= 1;
        log::debug!("[Radio] subscribers: {}", sub.subscribers);
        if sub.subscribers > 0 {
            return;
        }
        self.device.unsubscribe_service(service_id);
        if let Some(sub) = st.subscriptions.remove(&service_id) {
            sub.controller.release_waiters();
        }
        if st.subscriptions.is_empty() {
            self.schedule_drain(&mut st);
        }
    }

    /// Aggressive teardown: unsubscribes every service, cancels any pending
    /// drain and reverts the tuner to idle. Idempotent.
    pub async fn stop(&self) {
        let mut st = self.state.lock().await;
        for (service_id, sub) in st.subscriptions.drain() {
            self.device.unsubscribe_service(service_id);
            sub.controller.release_waiters();
        }
        self.cancel_drain(&mut st);
        if st.current_channel.is_some() {
            self.reset_tuner(&mut st);
        }
    }

    /// Polls the discovered-services map until the requested name shows up,
    /// for up to [`SERVICE_DISCOVERY_TIMEOUT`]. Runs without the arbitration
    /// lock.
    async fn wait_for_service(&self, service_name: &str) -> Option<u32> {
        if let Some(service_id) = self.lookup_service_id(service_name) {
            return Some(service_id);
        }
        let polls = SERVICE_DISCOVERY_TIMEOUT.as_millis() / SERVICE_DISCOVERY_POLL.as_millis();
        for _ in 0..polls {
            tokio::time::sleep(SERVICE_DISCOVERY_POLL).await;
            if let Some(service_id) = self.lookup_service_id(service_name) {
                return Some(service_id);
            }
        }
        None
    }

    /// Scans known service ids for the given display name, lazily filling
    /// the name cache from the driver (trailing whitespace stripped).
    fn lookup_service_id(&self, service_name: &str) -> Option<u32> {
        let mut discovered = self.discovered.lock();
        for (service_id, cached) in discovered.iter_mut() {
            if cached.as_deref().map_or(true, str::is_empty) {
                if let Some(name) = self.device.service_name(*service_id) {
                    let name = name.trim_end().to_string();
                    if !name.is_empty() {
                        *cached = Some(name);
                    }
                }
            }
            if cached.as_deref() == Some(service_name) {
                return Some(*service_id);
            }
        }
        None
    }

    /// Starts (or restarts) the deferred-release timer for the current
    /// channel.
    fn schedule_drain(&self, st: &mut TunerState) {
        let Some(channel) = st.current_channel.clone() else {
            return;
        };
        self.cancel_drain(st);
        st.drain_generation += 1;
        let generation = st.drain_generation;
        let this = self.strong();
        log::debug!(
            "[Radio] scheduling release of {} in {:?}",
            channel,
            CHANNEL_RELEASE_GRACE
        );
        let task = tokio::spawn(async move {
            tokio::time::sleep(CHANNEL_RELEASE_GRACE).await;
            let mut st = this.state.lock().await;
            // A subscribe that raced us cancelled or replaced the timer.
            if st
                .drain
                .as_ref()
                .is_some_and(|drain| drain.generation == generation)
            {
                st.drain = None;
                log::info!("[Radio] releasing channel {} after drain grace", channel);
                this.reset_tuner(&mut st);
            }
        });
        st.drain = Some(DrainTimer { generation, task });
    }

    fn cancel_drain(&self, st: &mut TunerState) {
        if let Some(drain) = st.drain.take() {
            drain.task.abort();
            log::debug!("[Radio] pending channel release cancelled");
        }
    }

    /// Untunes, clears ensemble state and gives the lease back.
    fn reset_tuner(&self, st: &mut TunerState) {
        self.device.reset_channel();
        st.current_channel = None;
        self.discovered.lock().clear();
        *self.ensemble_label.lock() = None;
        self.last_datetime.store(0, Ordering::Release);
        self.device.lease().release(LeaseOwner::RadioController);
    }
}

impl ChannelEvents for RadioController {
    fn on_service_detected(&self, service_id: u32) {
        self.discovered.lock().entry(service_id).or_insert(None);
    }

    fn on_ensemble_label(&self, label: &str) {
        *self.ensemble_label.lock() = Some(label.to_string());
    }

    fn on_datetime_update(&self, unix_timestamp: i64) {
        self.last_datetime.store(unix_timestamp, Ordering::Release);
    }
}

/// Schedules a deferred release if the subscribe future is dropped during
/// the unlocked discovery phase, e.g. because the HTTP client disconnected.
struct DiscoveryGuard {
    radio: Option<Arc<RadioController>>,
    channel: String,
}

impl DiscoveryGuard {
    fn new(radio: Arc<RadioController>, channel: &str) -> Self {
        Self {
            radio: Some(radio),
            channel: channel.to_string(),
        }
    }

    fn defuse(&mut self) {
        self.radio = None;
    }
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        let Some(radio) = self.radio.take() else {
            return;
        };
        let channel = std::mem::take(&mut self.channel);
        tokio::spawn(async move {
            let mut st = radio.state.lock().await;
            if st.subscriptions.is_empty()
                && st.current_channel.as_deref() == Some(channel.as_str())
                && st.drain.is_none()
            {
                log::debug!("[Radio] subscribe abandoned during discovery");
                radio.schedule_drain(&mut st);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TunerLease;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    /// In-memory tuner with scriptable services.
    #[derive(Default)]
    struct FakeDevice {
        lease: TunerLease,
        names: SyncMutex<HashMap<u32, String>>,
        channel_log: SyncMutex<Vec<String>>,
        live_subscriptions: SyncMutex<HashMap<u32, Arc<dyn ServiceEvents>>>,
        subscribe_calls: AtomicUsize,
    }

    impl FakeDevice {
        fn with_service(self, service_id: u32, name: &str) -> Self {
            self.names.lock().insert(service_id, name.to_string());
            self
        }

        fn tune_count(&self, channel: &str) -> usize {
            self.channel_log
                .lock()
                .iter()
                .filter(|c| c.as_str() == channel)
                .count()
        }
    }

    impl TunerDevice for FakeDevice {
        fn lease(&self) -> &TunerLease {
            &self.lease
        }

        fn set_channel(&self, channel: &str, _is_scan: bool) -> bool {
            self.channel_log.lock().push(channel.to_string());
            true
        }

        fn subscribe_service(&self, handler: Arc<dyn ServiceEvents>, service_id: u32) -> bool {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.live_subscriptions.lock().insert(service_id, handler);
            true
        }

        fn unsubscribe_service(&self, service_id: u32) -> bool {
            self.live_subscriptions.lock().remove(&service_id).is_some()
        }

        fn service_name(&self, service_id: u32) -> Option<String> {
            self.names.lock().get(&service_id).cloned()
        }

        fn is_audio_service(&self, _service_id: u32) -> bool {
            true
        }

        fn channel_names(&self) -> Vec<String> {
            vec!["5C".into(), "11D".into()]
        }
    }

    fn radio_with(device: FakeDevice) -> (Arc<RadioController>, Arc<FakeDevice>) {
        let device = Arc::new(device);
        let radio = RadioController::new(Arc::clone(&device) as Arc<dyn TunerDevice>);
        (radio, device)
    }

    /// Announces a service the way the driver would after tuning.
    fn announce(radio: &RadioController, service_id: u32) {
        radio.on_service_detected(service_id);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_tunes_and_attaches() {
        let (radio, device) = radio_with(FakeDevice::default().with_service(1, "SWR3  "));
        announce(&radio, 1);

        let controller = radio.subscribe("11D", "SWR3").await.unwrap();
        assert_eq!(device.tune_count("11D"), 1);
        assert_eq!(device.lease.owner(), Some(LeaseOwner::RadioController));
        assert_eq!(radio.current_channel().await.as_deref(), Some("11D"));

        // driver frames reach the controller through the registered handler
        let handler = device.live_subscriptions.lock().get(&1).cloned().unwrap();
        handler.on_audio(Bytes::from_static(b"pcm"), 48000, "DAB+");
        let (_, audio) = controller.await_audio(0).await.unwrap();
        assert_eq!(&audio[..], b"pcm");
    }

    #[tokio::test(start_paused = true)]
    async fn second_subscriber_shares_the_controller() {
        let (radio, device) = radio_with(FakeDevice::default().with_service(1, "SWR3"));
        announce(&radio, 1);

        let first = radio.subscribe("11D", "SWR3").await.unwrap();
        let second = radio.subscribe("11D", "SWR3").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(device.subscribe_calls.load(Ordering::SeqCst), 1);

        // first unsubscribe keeps the driver subscription alive
        radio.unsubscribe("SWR3").await;
        assert_eq!(device.live_subscriptions.lock().len(), 1);
        radio.unsubscribe("SWR3").await;
        assert_eq!(device.live_subscriptions.lock().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn service_appearing_during_discovery_poll_is_found() {
        let (radio, _device) = radio_with(FakeDevice::default().with_service(7, "Dlf Kultur"));
        let subscriber = {
            let radio = Arc::clone(&radio);
            tokio::spawn(async move { radio.subscribe("5C", "Dlf Kultur").await })
        };
        tokio::task::yield_now().await;
        // Announced two poll intervals in.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        announce(&radio, 7);

        assert!(subscriber.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_service_fails_and_schedules_release() {
        let (radio, device) = radio_with(FakeDevice::default());
        let err = radio.subscribe("11D", "No Such Service").await.unwrap_err();
        assert!(matches!(err, DabcastError::NotFound(_)));

        // still tuned during the grace window
        assert_eq!(radio.current_channel().await.as_deref(), Some("11D"));
        tokio::time::sleep(CHANNEL_RELEASE_GRACE + Duration::from_millis(50)).await;
        assert_eq!(radio.current_channel().await, None);
        assert_eq!(device.lease.owner(), None);
        assert_eq!(device.tune_count(""), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_drains_then_releases() {
        let (radio, device) = radio_with(FakeDevice::default().with_service(1, "SWR3"));
        announce(&radio, 1);
        let controller = radio.subscribe("11D", "SWR3").await.unwrap();
        radio.unsubscribe("SWR3").await;

        // torn-down controller rejects waiters immediately
        assert!(controller.await_audio(0).await.is_err());

        // drain pending: tuner still ours within the grace window
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(radio.current_channel().await.as_deref(), Some("11D"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(radio.current_channel().await, None);
        assert_eq!(device.lease.owner(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_within_grace_cancels_the_drain() {
        let (radio, device) = radio_with(FakeDevice::default().with_service(1, "SWR3"));
        announce(&radio, 1);
        radio.subscribe("11D", "SWR3").await.unwrap();
        radio.unsubscribe("SWR3").await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        radio.subscribe("11D", "SWR3").await.unwrap();

        // well past the original deadline: no release happened, no retune
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(radio.current_channel().await.as_deref(), Some("11D"));
        assert_eq!(device.tune_count("11D"), 1);
        assert_eq!(device.tune_count(""), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn other_channel_subscribe_fires_drain_early() {
        let (radio, device) = radio_with(
            FakeDevice::default()
                .with_service(1, "SWR3")
                .with_service(2, "Dlf"),
        );
        announce(&radio, 1);
        radio.subscribe("11D", "SWR3").await.unwrap();
        radio.unsubscribe("SWR3").await;

        // within the grace window, a different channel takes over immediately
        let subscriber = {
            let radio = Arc::clone(&radio);
            tokio::spawn(async move { radio.subscribe("5C", "Dlf").await })
        };
        tokio::task::yield_now().await;
        announce(&radio, 2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(subscriber.await.unwrap().is_ok());
        assert_eq!(device.tune_count(""), 1);
        assert_eq!(device.tune_count("5C"), 1);
        assert_eq!(radio.current_channel().await.as_deref(), Some("5C"));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_channel_rejects_other_channels() {
        let (radio, _device) = radio_with(
            FakeDevice::default()
                .with_service(1, "SWR3")
                .with_service(2, "Dlf"),
        );
        announce(&radio, 1);
        radio.subscribe("11D", "SWR3").await.unwrap();
        assert!(radio.can_accept("11D").await);
        assert!(!radio.can_accept("5C").await);

        let err = radio.subscribe("5C", "Dlf").await.unwrap_err();
        assert!(matches!(err, DabcastError::TunerBusy(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn leased_device_rejects_subscribe() {
        struct Nop;
        impl ChannelEvents for Nop {}

        let (radio, device) = radio_with(FakeDevice::default().with_service(1, "SWR3"));
        assert!(device.lease.try_acquire(LeaseOwner::Scanner, Arc::new(Nop)));

        let err = radio.subscribe("11D", "SWR3").await.unwrap_err();
        assert!(matches!(err, DabcastError::TunerBusy(_)));
        // the foreign lease is untouched
        assert_eq!(device.lease.owner(), Some(LeaseOwner::Scanner));
    }

    #[tokio::test(start_paused = true)]
    async fn ensemble_metadata_is_cleared_on_release() {
        let (radio, _device) = radio_with(FakeDevice::default().with_service(1, "SWR3"));
        announce(&radio, 1);
        radio.subscribe("11D", "SWR3").await.unwrap();

        radio.on_ensemble_label("SWR BW N");
        radio.on_datetime_update(1_722_500_000);
        assert_eq!(radio.ensemble_label().as_deref(), Some("SWR BW N"));
        assert_eq!(radio.last_datetime(), Some(1_722_500_000));

        radio.stop().await;
        assert_eq!(radio.ensemble_label(), None);
        assert_eq!(radio.last_datetime(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let (radio, device) = radio_with(FakeDevice::default().with_service(1, "SWR3"));
        announce(&radio, 1);
        radio.subscribe("11D", "SWR3").await.unwrap();

        radio.stop().await;
        assert_eq!(radio.current_channel().await, None);
        assert_eq!(device.lease.owner(), None);
        assert!(device.live_subscriptions.lock().is_empty());

        // applied again: no-op
        radio.stop().await;
        assert_eq!(device.tune_count(""), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_subscriptions_match_live_controllers() {
        let (radio, device) = radio_with(
            FakeDevice::default()
                .with_service(1, "SWR3")
                .with_service(2, "Dlf"),
        );
        announce(&radio, 1);
        announce(&radio, 2);

        radio.subscribe("11D", "SWR3").await.unwrap();
        radio.subscribe("11D", "Dlf").await.unwrap();
        assert_eq!(device.live_subscriptions.lock().len(), 2);

        radio.unsubscribe("SWR3").await;
        assert_eq!(device.live_subscriptions.lock().len(), 1);
        // one subscription remains: no drain, channel stays tuned
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(radio.current_channel().await.as_deref(), Some("11D"));
    }
}
