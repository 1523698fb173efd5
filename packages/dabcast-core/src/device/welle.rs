//! [`TunerDevice`] implementation over the native welle-io wrapper.

use std::ffi::{c_char, c_void, CStr, CString};
use std::slice;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ffi;
use super::{DriverEvent, ServiceEvents, TunerDevice, TunerLease};

/// Context handed to the C library; outlives the device instance.
struct ForwardCtx {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

/// Raw handle wrapper. The C wrapper serializes access internally; the
/// pointer itself is only invalidated by `welle_finalize` in `Drop`.
struct Handle(*mut ffi::WelleHandle);

// The driver guards its own state; we never dereference the pointer.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

/// The physical DAB tuner.
pub struct WelleDevice {
    handle: Handle,
    lease: TunerLease,
    services: DashMap<u32, Arc<dyn ServiceEvents>>,
    // Keeps the callback table and its ctx alive for the driver's lifetime.
    _callbacks: Box<ffi::RadioCallbacks>,
    _ctx: Box<ForwardCtx>,
}

// The callback table's raw ctx pointer is only dereferenced by the driver
// threads; everything it points at is thread-safe.
unsafe impl Send for WelleDevice {}
unsafe impl Sync for WelleDevice {}

impl WelleDevice {
    /// Opens the tuner and starts the event dispatch task.
    ///
    /// Returns `None` when no usable hardware is present; the caller then
    /// runs with the DAB subsystem disabled. Must be called from within a
    /// tokio runtime.
    pub fn open(device_name: &str, gain: i32, decode_audio: bool) -> Option<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Box::new(ForwardCtx { tx });
        let callbacks = Box::new(ffi::RadioCallbacks {
            ctx: &*ctx as *const ForwardCtx as *mut c_void,
            on_signal_presence: trampoline_signal_presence,
            on_service_detected: trampoline_service_detected,
            on_set_ensemble_label: trampoline_ensemble_label,
            on_datetime_update: trampoline_datetime_update,
            on_new_audio: trampoline_new_audio,
            on_new_dynamic_label: trampoline_dynamic_label,
            on_mot: trampoline_mot,
        });

        let name = CString::new(device_name).ok()?;
        let raw = unsafe { ffi::welle_open(name.as_ptr(), gain, decode_audio, &*callbacks) };
        if raw.is_null() {
            log::warn!("[Device] welle_open returned null for '{}'", device_name);
            return None;
        }

        let device = Arc::new(Self {
            handle: Handle(raw),
            lease: TunerLease::new(),
            services: DashMap::new(),
            _callbacks: callbacks,
            _ctx: ctx,
        });
        tokio::spawn(Self::dispatch_events(Arc::downgrade(&device), rx));
        Some(device)
    }

    /// Drains driver events and routes them to the current handlers.
    ///
    /// Channel-scoped events go to whoever holds the lease; service-scoped
    /// events go to the subscribed handler. Events for released leases or
    /// unsubscribed services are dropped, which absorbs the driver's brief
    /// post-untune callback tail.
    ///
    /// Holds only a weak reference: the device owns the sending side, so a
    /// strong one here would keep both alive forever.
    async fn dispatch_events(device: Weak<Self>, mut rx: mpsc::UnboundedReceiver<DriverEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(device) = device.upgrade() else {
                return;
            };
            match event {
                DriverEvent::SignalPresence(is_signal) => {
                    if let Some(handler) = device.lease.handler() {
                        handler.on_signal_presence(is_signal);
                    }
                }
                DriverEvent::ServiceDetected(service_id) => {
                    if let Some(handler) = device.lease.handler() {
                        handler.on_service_detected(service_id);
                    }
                }
                DriverEvent::EnsembleLabel(label) => {
                    if let Some(handler) = device.lease.handler() {
                        handler.on_ensemble_label(&label);
                    }
                }
                DriverEvent::DateTimeUpdate(ts) => {
                    if let Some(handler) = device.lease.handler() {
                        handler.on_datetime_update(ts);
                    }
                }
                DriverEvent::Audio {
                    service_id,
                    data,
                    sample_rate,
                    mode,
                } => {
                    if let Some(handler) = device.services.get(&service_id) {
                        handler.on_audio(data, sample_rate, &mode);
                    }
                }
                DriverEvent::DynamicLabel { service_id, label } => {
                    if let Some(handler) = device.services.get(&service_id) {
                        handler.on_dynamic_label(&label);
                    }
                }
                DriverEvent::Mot {
                    service_id,
                    data,
                    mime_type,
                    name,
                } => {
                    if let Some(handler) = device.services.get(&service_id) {
                        handler.on_mot(data, &mime_type, &name);
                    }
                }
            }
        }
    }
}

impl TunerDevice for WelleDevice {
    fn lease(&self) -> &TunerLease {
        &self.lease
    }

    fn set_channel(&self, channel: &str, is_scan: bool) -> bool {
        let Ok(name) = CString::new(channel) else {
            return false;
        };
        unsafe { ffi::welle_set_channel(self.handle.0, name.as_ptr(), is_scan) }
    }

    fn subscribe_service(&self, handler: Arc<dyn ServiceEvents>, service_id: u32) -> bool {
        // Register before the driver call so the first frame cannot race
        // past an empty registry.
        self.services.insert(service_id, handler);
        let ok = unsafe { ffi::welle_subscribe_service(self.handle.0, service_id) };
        if !ok {
            self.services.remove(&service_id);
        }
        ok
    }

    fn unsubscribe_service(&self, service_id: u32) -> bool {
        let ok = unsafe { ffi::welle_unsubscribe_service(self.handle.0, service_id) };
        self.services.remove(&service_id);
        ok
    }

    fn service_name(&self, service_id: u32) -> Option<String> {
        let mut buf = [0u8; 64];
        let len = unsafe {
            ffi::welle_get_service_name(
                self.handle.0,
                service_id,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            )
        };
        if len < 0 {
            return None;
        }
        let len = (len as usize).min(buf.len());
        Some(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    fn is_audio_service(&self, service_id: u32) -> bool {
        unsafe { ffi::welle_is_audio_service(self.handle.0, service_id) }
    }

    fn channel_names(&self) -> Vec<String> {
        let count = unsafe { ffi::welle_channel_count() };
        let mut names = Vec::with_capacity(count);
        let mut buf = [0u8; 16];
        for index in 0..count {
            let len = unsafe {
                ffi::welle_channel_name(index, buf.as_mut_ptr() as *mut c_char, buf.len())
            };
            if len > 0 {
                let len = (len as usize).min(buf.len());
                names.push(String::from_utf8_lossy(&buf[..len]).into_owned());
            }
        }
        names
    }
}

impl Drop for WelleDevice {
    fn drop(&mut self) {
        unsafe {
            ffi::welle_set_channel(self.handle.0, c"".as_ptr(), false);
            ffi::welle_close(self.handle.0);
        }
        // Let in-flight driver callbacks drain before freeing the instance.
        std::thread::sleep(Duration::from_millis(100));
        unsafe { ffi::welle_finalize(self.handle.0) };
    }
}

unsafe fn cstr_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

unsafe fn byte_slice(data: *const u8, len: usize) -> Bytes {
    if data.is_null() || len == 0 {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(slice::from_raw_parts(data, len))
    }
}

unsafe fn forward(ctx: *mut c_void, event: DriverEvent) {
    let fwd = &*(ctx as *const ForwardCtx);
    // Send fails only during shutdown, when events are discarded anyway.
    let _ = fwd.tx.send(event);
}

unsafe extern "C" fn trampoline_signal_presence(ctx: *mut c_void, is_signal: bool) {
    forward(ctx, DriverEvent::SignalPresence(is_signal));
}

unsafe extern "C" fn trampoline_service_detected(ctx: *mut c_void, service_id: u32) {
    forward(ctx, DriverEvent::ServiceDetected(service_id));
}

unsafe extern "C" fn trampoline_ensemble_label(ctx: *mut c_void, label: *const c_char) {
    forward(ctx, DriverEvent::EnsembleLabel(cstr_lossy(label)));
}

unsafe extern "C" fn trampoline_datetime_update(ctx: *mut c_void, unix_timestamp: i64) {
    forward(ctx, DriverEvent::DateTimeUpdate(unix_timestamp));
}

unsafe extern "C" fn trampoline_new_audio(
    ctx: *mut c_void,
    service_id: u32,
    data: *const u8,
    len: usize,
    sample_rate: u32,
    mode: *const c_char,
) {
    forward(
        ctx,
        DriverEvent::Audio {
            service_id,
            data: byte_slice(data, len),
            sample_rate,
            mode: cstr_lossy(mode),
        },
    );
}

unsafe extern "C" fn trampoline_dynamic_label(
    ctx: *mut c_void,
    service_id: u32,
    label: *const c_char,
) {
    forward(
        ctx,
        DriverEvent::DynamicLabel {
            service_id,
            label: cstr_lossy(label),
        },
    );
}

unsafe extern "C" fn trampoline_mot(
    ctx: *mut c_void,
    service_id: u32,
    data: *const u8,
    len: usize,
    mime_type: *const c_char,
    name: *const c_char,
) {
    forward(
        ctx,
        DriverEvent::Mot {
            service_id,
            data: byte_slice(data, len),
            mime_type: cstr_lossy(mime_type),
            name: cstr_lossy(name),
        },
    );
}
