//! DAB radio subsystem: tuner arbitration, per-service fan-out and the
//! band scanner.

mod controller;
mod scanner;
mod service_controller;

pub use controller::{
    RadioController, CHANNEL_RELEASE_GRACE, SERVICE_DISCOVERY_POLL, SERVICE_DISCOVERY_TIMEOUT,
};
pub use scanner::{DabScanner, ScannerStatus, SERVICE_DISCOVERY_WINDOW};
pub use service_controller::{MotImage, ServiceController, Unsubscribed, AUDIO_BUFFER_FRAMES};
