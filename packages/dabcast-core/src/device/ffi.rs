//! Raw bindings to the welle-io C wrapper library.
//!
//! The wrapper exposes a flat C API over the C++ demodulator. All callbacks
//! in [`RadioCallbacks`] are invoked on driver-owned threads; the trampolines
//! installed by [`super::welle::WelleDevice`] do nothing but convert the
//! arguments and post a [`super::DriverEvent`], so no Rust state is touched
//! off the tokio scheduler.

use std::ffi::{c_char, c_int, c_void};

/// Opaque demodulator instance.
#[repr(C)]
pub struct WelleHandle {
    _private: [u8; 0],
}

/// Callback table registered at open time.
///
/// `ctx` is passed back verbatim as the first argument of every callback.
/// Service-scoped callbacks carry the service id; routing to the subscribed
/// handler happens on the Rust side.
#[repr(C)]
pub struct RadioCallbacks {
    pub ctx: *mut c_void,
    pub on_signal_presence: unsafe extern "C" fn(ctx: *mut c_void, is_signal: bool),
    pub on_service_detected: unsafe extern "C" fn(ctx: *mut c_void, service_id: u32),
    pub on_set_ensemble_label: unsafe extern "C" fn(ctx: *mut c_void, label: *const c_char),
    pub on_datetime_update: unsafe extern "C" fn(ctx: *mut c_void, unix_timestamp: i64),
    pub on_new_audio: unsafe extern "C" fn(
        ctx: *mut c_void,
        service_id: u32,
        data: *const u8,
        len: usize,
        sample_rate: u32,
        mode: *const c_char,
    ),
    pub on_new_dynamic_label:
        unsafe extern "C" fn(ctx: *mut c_void, service_id: u32, label: *const c_char),
    pub on_mot: unsafe extern "C" fn(
        ctx: *mut c_void,
        service_id: u32,
        data: *const u8,
        len: usize,
        mime_type: *const c_char,
        name: *const c_char,
    ),
}

#[link(name = "welle-io")]
extern "C" {
    /// Opens the device; returns null when no hardware is present.
    pub fn welle_open(
        device_name: *const c_char,
        gain: c_int,
        decode_audio: bool,
        callbacks: *const RadioCallbacks,
    ) -> *mut WelleHandle;

    /// Stops the driver threads. Callbacks may still fire briefly afterwards.
    pub fn welle_close(handle: *mut WelleHandle);

    /// Frees the instance. Must not be called before `welle_close`.
    pub fn welle_finalize(handle: *mut WelleHandle);

    /// Tunes the named channel; the empty string untunes.
    pub fn welle_set_channel(
        handle: *mut WelleHandle,
        channel: *const c_char,
        is_scan: bool,
    ) -> bool;

    pub fn welle_subscribe_service(handle: *mut WelleHandle, service_id: u32) -> bool;

    pub fn welle_unsubscribe_service(handle: *mut WelleHandle, service_id: u32) -> bool;

    /// Writes the service's display name into `buf`; returns the name length
    /// or a negative value if the service is unknown.
    pub fn welle_get_service_name(
        handle: *mut WelleHandle,
        service_id: u32,
        buf: *mut c_char,
        len: usize,
    ) -> c_int;

    pub fn welle_is_audio_service(handle: *mut WelleHandle, service_id: u32) -> bool;

    /// Number of tunable channel names.
    pub fn welle_channel_count() -> usize;

    /// Writes the channel name at `index` into `buf`; returns its length or a
    /// negative value when out of range.
    pub fn welle_channel_name(index: usize, buf: *mut c_char, len: usize) -> c_int;
}
