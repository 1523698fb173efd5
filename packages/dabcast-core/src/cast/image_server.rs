//! In-memory cache for MPD album art.
//!
//! The cast device cannot read pictures embedded in local music files, so
//! the bridge extracts them via MPD's `readpicture` and serves them from
//! memory under `/mpd_image/<escaped-song-path>`.

use bytes::Bytes;
use dashmap::DashMap;

use crate::context::NetworkContext;

/// A cached album-art image.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub mime_type: String,
    pub data: Bytes,
}

/// Thread-safe registry of song path → embedded picture.
pub struct ImageCache {
    images: DashMap<String, CachedImage>,
    network: NetworkContext,
}

impl ImageCache {
    pub fn new(network: NetworkContext) -> Self {
        Self {
            images: DashMap::new(),
            network,
        }
    }

    /// Stores a song's picture and returns the URL it is served under.
    pub fn store(&self, song_path: &str, mime_type: String, data: Bytes) -> String {
        self.images
            .insert(song_path.to_string(), CachedImage { mime_type, data });
        self.network.url_builder().mpd_image_url(song_path)
    }

    /// Looks up a cached picture by song path.
    pub fn get(&self, song_path: &str) -> Option<CachedImage> {
        self.images.get(song_path).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn stored_image_is_served_under_escaped_url() {
        let network = NetworkContext::explicit(8864, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        let cache = ImageCache::new(network);

        let url = cache.store(
            "albums/a b/track.flac",
            "image/png".into(),
            Bytes::from_static(b"png"),
        );
        assert_eq!(
            url,
            "http://10.0.0.2:8864/mpd_image/albums%2Fa%20b%2Ftrack.flac"
        );

        let image = cache.get("albums/a b/track.flac").unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert!(cache.get("unknown.flac").is_none());
    }
}
