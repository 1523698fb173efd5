//! MPD-to-Chromecast bridge.
//!
//! Keeps a discovered cast device mirroring the local MPD player: when MPD
//! starts playing its httpd output, the device is told to play that stream;
//! per-track metadata (title, artist, image) is refreshed continuously from
//! MPD itself, from the DAB server's metadata endpoints, or from a
//! TVHeadend EPG, depending on what MPD is playing.

mod caster;
mod dab_station;
pub mod device;
mod finder;
mod image_server;
mod mpd;
mod mpd_config;
mod tvheadend;

pub use caster::{CastConnector, DeviceFinder, MediaTarget, MpdCaster};
pub use dab_station::DabStation;
pub use device::{CastAddr, CastError, CastEvent, CastSession, CastSessionConnector};
pub use finder::CastFinder;
pub use image_server::{CachedImage, ImageCache};
pub use mpd::{MpdClient, MpdError, SongInfo, SongPicture};
pub use mpd_config::{MpdConfig, MpdConfigError};
pub use tvheadend::{ShowDetails, TvheadendChannel};

/// Metadata pushed to the cast receiver for the current track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CastData {
    pub title: String,
    pub artist: String,
    pub image_url: String,
}
