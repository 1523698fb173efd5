//! DabCast Core - shared library for DabCast.
//!
//! This crate provides the core functionality for DabCast, a single-host
//! service that exposes a locally received DAB+ ensemble as an HTTP streaming
//! and metadata service, and mirrors a local MPD player onto a Chromecast
//! device. It is designed to be used by the standalone headless server.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`device`]: Tuner device abstraction, lease arbitration and FFI glue
//! - [`radio`]: Tuner arbitration, per-service fan-out and the band scanner
//! - [`stream`]: Audio codec selection and WAV header generation
//! - [`api`]: HTTP routes for streaming, metadata long-polls and scan control
//! - [`cast`]: Chromecast discovery, the MPD mirror and metadata resolvers
//! - [`context`]: Network configuration and URL building
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! Core logic depends on traits rather than hardware or wire protocols:
//!
//! - [`TunerDevice`](device::TunerDevice): the native demodulator seam
//! - [`ChannelEvents`](device::ChannelEvents) / [`ServiceEvents`](device::ServiceEvents):
//!   driver callback surfaces
//! - [`MediaTarget`](cast::MediaTarget): the cast-session command surface
//!
//! Production implementations live behind the `welle` feature (tuner) and in
//! [`cast::device`] (Chromecast); tests inject fakes through the same seams.

#![warn(clippy::all)]

pub mod api;
pub mod cast;
pub mod context;
pub mod device;
pub mod error;
pub mod radio;
pub mod stream;

// Re-export commonly used types at the crate root
pub use api::{bind_server, start_server, AppState, BoundServer, ServerError};
pub use context::{LocalIpDetector, NetworkContext, NetworkError, UrlBuilder};
pub use device::{ChannelEvents, ServiceEvents, TunerDevice, TunerLease};
pub use error::{DabcastError, DabcastResult};
pub use radio::{DabScanner, RadioController, ServiceController, Unsubscribed};
pub use stream::AudioCodec;
