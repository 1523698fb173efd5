//! Tuner device abstraction.
//!
//! The native DAB demodulator runs its own OS threads and reports everything
//! through callbacks. This module defines the seam the rest of the crate
//! programs against:
//!
//! - [`TunerDevice`]: the operations the core invokes on the hardware
//! - [`ChannelEvents`] / [`ServiceEvents`]: the callback surfaces the
//!   hardware invokes on the core, per tuned channel and per subscribed
//!   service respectively
//! - [`TunerLease`]: single-owner arbitration between the radio controller
//!   and the scanner
//!
//! Driver callbacks are never executed on driver threads directly: the FFI
//! glue (behind the `welle` feature) posts [`DriverEvent`]s into a channel
//! drained by a tokio task, which dispatches to the handler surfaces. Test
//! code implements [`TunerDevice`] directly and calls the handlers inline.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

#[cfg(feature = "welle")]
mod ffi;
#[cfg(feature = "welle")]
mod welle;

#[cfg(feature = "welle")]
pub use welle::WelleDevice;

/// Channel-scoped driver callbacks.
///
/// Exactly one receiver is active at a time: whichever subsystem holds the
/// [`TunerLease`]. All methods default to no-ops so implementors only handle
/// what they care about, mirroring the driver's diagnostic callbacks which
/// the core ignores.
pub trait ChannelEvents: Send + Sync {
    fn on_signal_presence(&self, _is_signal: bool) {}
    fn on_service_detected(&self, _service_id: u32) {}
    fn on_ensemble_label(&self, _label: &str) {}
    fn on_datetime_update(&self, _unix_timestamp: i64) {}
}

/// Service-scoped driver callbacks, active between `subscribe_service` and
/// `unsubscribe_service`.
pub trait ServiceEvents: Send + Sync {
    fn on_audio(&self, data: Bytes, sample_rate: u32, mode: &str);
    fn on_dynamic_label(&self, label: &str);
    fn on_mot(&self, data: Bytes, mime_type: &str, name: &str);
}

/// Operations the core invokes on the tuner hardware.
///
/// Calls are expected to be fast (bookkeeping plus a command to the driver
/// thread); none of them may block for seconds. `unsubscribe_service` is
/// synchronous: once it returns, no further [`ServiceEvents`] callbacks are
/// delivered for that service id.
pub trait TunerDevice: Send + Sync {
    /// The arbitration lease guarding channel-level access.
    fn lease(&self) -> &TunerLease;

    /// Tunes to the named channel; the empty string untunes.
    fn set_channel(&self, channel: &str, is_scan: bool) -> bool;

    /// Untunes the device.
    fn reset_channel(&self) -> bool {
        self.set_channel("", false)
    }

    /// Starts frame delivery for a service to the given handler.
    fn subscribe_service(&self, handler: Arc<dyn ServiceEvents>, service_id: u32) -> bool;

    /// Stops frame delivery for a service.
    fn unsubscribe_service(&self, service_id: u32) -> bool;

    /// Looks up the display name of a discovered service.
    fn service_name(&self, service_id: u32) -> Option<String>;

    /// Whether the service carries audio (as opposed to data).
    fn is_audio_service(&self, service_id: u32) -> bool;

    /// The fixed list of channel names the hardware can tune.
    fn channel_names(&self) -> Vec<String>;
}

/// Identity of a lease holder, used in log and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOwner {
    RadioController,
    Scanner,
}

impl LeaseOwner {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RadioController => "radio controller",
            Self::Scanner => "scanner",
        }
    }
}

struct LeaseHolder {
    owner: LeaseOwner,
    handler: Arc<dyn ChannelEvents>,
}

/// Single-owner tuner lease.
///
/// Ownership also selects the target for channel-scoped callbacks: events
/// arriving while nobody holds the lease are dropped (the driver keeps
/// reporting briefly after an untune).
///
/// Contention is resolved by refusal, never by blocking.
#[derive(Default)]
pub struct TunerLease {
    holder: Mutex<Option<LeaseHolder>>,
}

impl TunerLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the lease for `owner`, routing channel events to
    /// `handler`. Returns false if another owner currently holds it.
    pub fn try_acquire(&self, owner: LeaseOwner, handler: Arc<dyn ChannelEvents>) -> bool {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return false;
        }
        *holder = Some(LeaseHolder { owner, handler });
        true
    }

    /// Releases the lease if `owner` holds it.
    pub fn release(&self, owner: LeaseOwner) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_ref() {
            Some(h) if h.owner == owner => {
                *holder = None;
                true
            }
            _ => false,
        }
    }

    /// The current owner, if any.
    pub fn owner(&self) -> Option<LeaseOwner> {
        self.holder.lock().as_ref().map(|h| h.owner)
    }

    /// The channel-event handler of the current owner.
    pub fn handler(&self) -> Option<Arc<dyn ChannelEvents>> {
        self.holder.lock().as_ref().map(|h| Arc::clone(&h.handler))
    }
}

/// A driver callback, marshalled off the driver thread.
///
/// The FFI glue converts every native callback into one of these and posts
/// it to the dispatch task; handler code therefore always runs on the tokio
/// scheduler and may freely touch shared state.
#[derive(Debug)]
pub enum DriverEvent {
    SignalPresence(bool),
    ServiceDetected(u32),
    EnsembleLabel(String),
    DateTimeUpdate(i64),
    Audio {
        service_id: u32,
        data: Bytes,
        sample_rate: u32,
        mode: String,
    },
    DynamicLabel {
        service_id: u32,
        label: String,
    },
    Mot {
        service_id: u32,
        data: Bytes,
        mime_type: String,
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopEvents;
    impl ChannelEvents for NopEvents {}

    #[test]
    fn lease_is_exclusive_between_owners() {
        let lease = TunerLease::new();
        assert!(lease.try_acquire(LeaseOwner::Scanner, Arc::new(NopEvents)));
        assert!(!lease.try_acquire(LeaseOwner::RadioController, Arc::new(NopEvents)));
        assert_eq!(lease.owner(), Some(LeaseOwner::Scanner));

        // only the holder may release
        assert!(!lease.release(LeaseOwner::RadioController));
        assert!(lease.release(LeaseOwner::Scanner));
        assert!(lease.try_acquire(LeaseOwner::RadioController, Arc::new(NopEvents)));
    }

    #[test]
    fn released_lease_drops_handler() {
        let lease = TunerLease::new();
        lease.try_acquire(LeaseOwner::Scanner, Arc::new(NopEvents));
        assert!(lease.handler().is_some());
        lease.release(LeaseOwner::Scanner);
        assert!(lease.handler().is_none());
    }
}
