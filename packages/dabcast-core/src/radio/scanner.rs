//! Full-spectrum DAB scanner.
//!
//! Holds the tuner lease exclusively for the whole sweep: scanning and live
//! listening are mutually exclusive by construction. For every channel name
//! the driver knows, the scanner tunes, waits for the signal-presence
//! verdict, gives service discovery a fixed window, then collects the
//! display names of the audio services it saw.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::UrlBuilder;
use crate::device::{ChannelEvents, LeaseOwner, TunerDevice};

/// Time the scanner parks on a channel with signal to let the driver
/// enumerate its services.
pub const SERVICE_DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone)]
struct ScannedService {
    name: Option<String>,
}

struct ScanTask {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ScanState {
    results: BTreeMap<String, BTreeMap<u32, ScannedService>>,
    running: Option<ScanTask>,
    scanner_status: String,
    download_ready: bool,
}

/// Scanner status as served to the web UI.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub scanner_status: String,
    pub download_ready: bool,
    pub is_scan_active: bool,
    pub progress: u32,
    pub progress_text: String,
}

/// Sweeps all channels and renders the result as an M3U playlist.
pub struct DabScanner {
    device: Arc<dyn TunerDevice>,
    state: Mutex<ScanState>,
    // channel currently being swept; target of on_service_detected
    scanning_channel: Mutex<Option<String>>,
    signal_flag: Mutex<Option<bool>>,
    signal_notify: Notify,
    weak_self: Weak<Self>,
}

impl DabScanner {
    pub fn new(device: Arc<dyn TunerDevice>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            device,
            state: Mutex::new(ScanState {
                scanner_status: "&nbsp;".into(),
                ..ScanState::default()
            }),
            scanning_channel: Mutex::new(None),
            signal_flag: Mutex::new(None),
            signal_notify: Notify::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// A `&self` can only exist while an `Arc` is alive.
    fn strong(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("scanner is alive")
    }

    /// Starts a sweep. Refuses (with a status message, not an error) when a
    /// scan is already running or the tuner lease is taken.
    pub fn start_scan(&self) {
        let mut st = self.state.lock();
        if st.running.is_some() {
            st.scanner_status = "Scan in progress. No new scan possible.".into();
            return;
        }
        let handler = self.strong() as Arc<dyn ChannelEvents>;
        if !self.device.lease().try_acquire(LeaseOwner::Scanner, handler) {
            st.scanner_status = "DAB device is locked. No scan possible.".into();
            return;
        }
        let token = CancellationToken::new();
        let task = tokio::spawn(Self::run_scan(self.strong(), token.clone()));
        st.running = Some(ScanTask { token, task });
        st.scanner_status = "Scan started successfully".into();
    }

    /// Cancels a running sweep; already-collected results remain valid.
    pub fn stop_scan(&self) {
        let st = self.state.lock();
        if let Some(running) = &st.running {
            running.token.cancel();
        }
    }

    /// Cancels and awaits the sweep task; used on shutdown.
    pub async fn stop(&self) {
        let running = {
            let mut st = self.state.lock();
            st.running.take()
        };
        if let Some(running) = running {
            running.token.cancel();
            let _ = running.task.await;
        }
    }

    /// Current status for the UI.
    pub fn status(&self) -> ScannerStatus {
        let st = self.state.lock();
        if st.running.is_some() {
            let total = self.device.channel_names().len().max(1);
            let scanned = st.results.len().saturating_sub(1);
            let progress = (100 * scanned / total) as u32;
            let discovered: usize = st
                .results
                .values()
                .map(|services| services.values().filter(|s| s.name.is_some()).count())
                .sum();
            let current = self.scanning_channel.lock().clone().unwrap_or_default();
            ScannerStatus {
                scanner_status: format!("Scan in progress. Currently scanning channel {current}."),
                download_ready: st.download_ready,
                is_scan_active: true,
                progress,
                progress_text: format!(
                    "{progress}% ({scanned} of {total} channels) Found {discovered} radio services."
                ),
            }
        } else {
            ScannerStatus {
                scanner_status: st.scanner_status.clone(),
                download_ready: st.download_ready,
                is_scan_active: false,
                progress: 0,
                progress_text: "&nbsp;".into(),
            }
        }
    }

    /// Renders the last scan's named audio services as an M3U playlist.
    ///
    /// Results are held in ordered maps, so the rendering is byte-stable for
    /// identical scans.
    pub fn playlist(&self, base: &UrlBuilder) -> String {
        let st = self.state.lock();
        let mut playlist = String::from("#EXTM3U\n");
        for (channel, services) in &st.results {
            for service in services.values() {
                if let Some(name) = &service.name {
                    playlist.push_str(&format!("#EXTINF:-1,{name}\n"));
                    playlist.push_str(&base.stream_url(channel, name));
                    playlist.push('\n');
                }
            }
        }
        playlist
    }

    async fn run_scan(self: Arc<Self>, token: CancellationToken) {
        {
            let mut st = self.state.lock();
            st.results.clear();
            st.download_ready = false;
        }

        let outcome = self.sweep_channels(&token).await;

        self.device.reset_channel();
        *self.scanning_channel.lock() = None;
        self.device.lease().release(LeaseOwner::Scanner);

        let mut st = self.state.lock();
        st.running = None;
        let service_count = match outcome {
            Ok(count) => {
                st.scanner_status = format!("Scan finished. Found {count} radio services.");
                count
            }
            Err(count) => {
                st.scanner_status = format!("Scan stopped. Found {count} radio services.");
                count
            }
        };
        st.download_ready = service_count > 0;
    }

    /// Sweeps every channel; `Err` carries the partial count on cancellation.
    async fn sweep_channels(&self, token: &CancellationToken) -> Result<usize, usize> {
        let mut service_count = 0;
        for channel in self.device.channel_names() {
            {
                let mut st = self.state.lock();
                st.results.insert(channel.clone(), BTreeMap::new());
            }
            *self.scanning_channel.lock() = Some(channel.clone());
            *self.signal_flag.lock() = None;
            self.device.set_channel(&channel, true);

            let is_signal = tokio::select! {
                _ = token.cancelled() => return Err(service_count),
                is_signal = self.wait_signal() => is_signal,
            };
            if is_signal {
                tokio::select! {
                    _ = token.cancelled() => return Err(service_count),
                    _ = tokio::time::sleep(SERVICE_DISCOVERY_WINDOW) => {}
                }
                service_count += self.collect_names(&channel);
            }
            self.device.reset_channel();
        }
        Ok(service_count)
    }

    /// Resolves display names for every service seen on `channel`.
    fn collect_names(&self, channel: &str) -> usize {
        let mut st = self.state.lock();
        let Some(services) = st.results.get_mut(channel) else {
            return 0;
        };
        let mut named = 0;
        for (service_id, service) in services.iter_mut() {
            if let Some(name) = self.device.service_name(*service_id) {
                let name = name.trim_end().to_string();
                if !name.is_empty() {
                    service.name = Some(name);
                    named += 1;
                }
            }
        }
        log::info!("[Scanner] channel {}: {} named services", channel, named);
        named
    }

    /// Waits for the driver's signal-presence verdict for the current tune.
    async fn wait_signal(&self) -> bool {
        loop {
            let notified = self.signal_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(is_signal) = *self.signal_flag.lock() {
                return is_signal;
            }
            notified.await;
        }
    }
}

impl ChannelEvents for DabScanner {
    fn on_signal_presence(&self, is_signal: bool) {
        *self.signal_flag.lock() = Some(is_signal);
        self.signal_notify.notify_waiters();
    }

    fn on_service_detected(&self, service_id: u32) {
        if !self.device.is_audio_service(service_id) {
            return;
        }
        let Some(channel) = self.scanning_channel.lock().clone() else {
            return;
        };
        let mut st = self.state.lock();
        if let Some(services) = st.results.get_mut(&channel) {
            services.entry(service_id).or_default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ServiceEvents, TunerLease};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeDevice {
        lease: TunerLease,
        names: Mutex<HashMap<u32, (String, bool)>>,
        channel_log: Mutex<Vec<String>>,
    }

    impl FakeDevice {
        fn with_service(self, service_id: u32, name: &str, audio: bool) -> Self {
            self.names
                .lock()
                .insert(service_id, (name.to_string(), audio));
            self
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

        fn subscribe_service(&self, _handler: Arc<dyn ServiceEvents>, _service_id: u32) -> bool {
            false
        }

        fn unsubscribe_service(&self, _service_id: u32) -> bool {
            false
        }

        fn service_name(&self, service_id: u32) -> Option<String> {
            self.names.lock().get(&service_id).map(|(n, _)| n.clone())
        }

        fn is_audio_service(&self, service_id: u32) -> bool {
            self.names
                .lock()
                .get(&service_id)
                .is_some_and(|(_, audio)| *audio)
        }

        fn channel_names(&self) -> Vec<String> {
            vec!["5C".into(), "11D".into()]
        }
    }

    fn scanner_with(device: FakeDevice) -> (Arc<DabScanner>, Arc<FakeDevice>) {
        let device = Arc::new(device);
        let scanner = DabScanner::new(Arc::clone(&device) as Arc<dyn TunerDevice>);
        (scanner, device)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_sweep_collects_audio_services() {
        let (scanner, device) = scanner_with(
            FakeDevice::default()
                .with_service(1, "SWR3  ", true)
                .with_service(2, "EPG Data", false),
        );
        scanner.start_scan();
        assert_eq!(device.lease.owner(), Some(LeaseOwner::Scanner));
        settle().await;

        // channel 5C has signal and two services, one of them data-only
        scanner.on_signal_presence(true);
        scanner.on_service_detected(1);
        scanner.on_service_detected(2);
        assert!(scanner.status().is_scan_active);
        tokio::time::sleep(SERVICE_DISCOVERY_WINDOW + Duration::from_millis(100)).await;

        // channel 11D is dead air
        scanner.on_signal_presence(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;

        let status = scanner.status();
        assert!(!status.is_scan_active);
        assert_eq!(
            status.scanner_status,
            "Scan finished. Found 1 radio services."
        );
        assert!(status.download_ready);
        assert_eq!(device.lease.owner(), None);
        // tuned both channels, untuned after each
        assert_eq!(
            *device.channel_log.lock(),
            vec!["5C", "", "11D", ""]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn playlist_renders_named_services_stably() {
        let (scanner, _device) =
            scanner_with(FakeDevice::default().with_service(1, "BAYERN 3", true));
        scanner.start_scan();
        settle().await;
        scanner.on_signal_presence(true);
        scanner.on_service_detected(1);
        tokio::time::sleep(SERVICE_DISCOVERY_WINDOW + Duration::from_millis(100)).await;
        scanner.on_signal_presence(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;

        let base = UrlBuilder::new("192.168.1.2", 8864);
        let expected = "#EXTM3U\n#EXTINF:-1,BAYERN 3\nhttp://192.168.1.2:8864/stream/5C/BAYERN%203\n";
        assert_eq!(scanner.playlist(&base), expected);
        // pure render: identical on repeat
        assert_eq!(scanner.playlist(&base), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_partial_results() {
        let (scanner, device) = scanner_with(FakeDevice::default().with_service(1, "SWR3", true));
        scanner.start_scan();
        settle().await;
        scanner.on_signal_presence(true);
        scanner.on_service_detected(1);
        settle().await;

        // cancel inside the first channel's discovery window
        scanner.stop_scan();
        scanner.stop().await;

        let status = scanner.status();
        assert!(status.scanner_status.starts_with("Scan stopped."));
        assert_eq!(device.lease.owner(), None);
        // the second channel was never tuned
        assert!(!device.channel_log.lock().iter().any(|c| c == "11D"));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_refused_while_lease_is_taken() {
        struct Nop;
        impl ChannelEvents for Nop {}

        let (scanner, device) = scanner_with(FakeDevice::default());
        assert!(device
            .lease
            .try_acquire(LeaseOwner::RadioController, Arc::new(Nop)));

        scanner.start_scan();
        let status = scanner.status();
        assert!(!status.is_scan_active);
        assert_eq!(
            status.scanner_status,
            "DAB device is locked. No scan possible."
        );
        // the radio's lease is untouched and no channel was set
        assert_eq!(device.lease.owner(), Some(LeaseOwner::RadioController));
        assert!(device.channel_log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_refused_while_running() {
        let (scanner, _device) = scanner_with(FakeDevice::default());
        scanner.start_scan();
        settle().await;
        scanner.start_scan();
        assert_eq!(
            scanner.status().scanner_status,
            "Scan in progress. Currently scanning channel 5C."
        );
        scanner.stop().await;
    }
}
