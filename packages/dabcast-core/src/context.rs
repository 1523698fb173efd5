//! Network configuration context for the streaming server.
//!
//! This module provides [`NetworkContext`] which bundles the address
//! information shared across subsystems: the HTTP port and the IP address
//! that cast devices and playlist consumers can reach us at.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

/// Network configuration shared across services.
///
/// Bundles server address information that multiple subsystems need for
/// constructing stream URLs, playlist entries and the cast receiver page URL.
#[derive(Clone)]
pub struct NetworkContext {
    port: u16,
    local_ip: Arc<RwLock<String>>,
}

impl NetworkContext {
    /// Creates a `NetworkContext` with an explicit advertise address.
    #[must_use]
    pub fn explicit(port: u16, advertise_ip: IpAddr) -> Self {
        Self {
            port,
            local_ip: Arc::new(RwLock::new(advertise_ip.to_string())),
        }
    }

    /// Creates a `NetworkContext` by auto-detecting the local IP address.
    ///
    /// # Errors
    ///
    /// Returns an error if no non-loopback IPv4 address can be found.
    pub fn auto_detect(port: u16) -> Result<Self, NetworkError> {
        let local_ip = LocalIpDetector::detect()?;
        Ok(Self {
            port,
            local_ip: Arc::new(RwLock::new(local_ip)),
        })
    }

    /// Returns the configured port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the current local IP.
    #[must_use]
    pub fn local_ip(&self) -> String {
        self.local_ip.read().clone()
    }

    /// Returns a `UrlBuilder` for the current network configuration.
    #[must_use]
    pub fn url_builder(&self) -> UrlBuilder {
        UrlBuilder::new(self.local_ip(), self.port)
    }
}

/// Default IP detector using the system's network interfaces.
#[derive(Debug, Clone, Default)]
pub struct LocalIpDetector;

impl LocalIpDetector {
    /// Detects the local IP address.
    pub fn detect() -> Result<String, NetworkError> {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .map_err(|e| NetworkError::Detection(e.to_string()))
    }
}

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not detect local IP address.
    #[error("Failed to detect local IP: {0}")]
    Detection(String),
}

/// Builder for constructing URLs for the streaming server.
pub struct UrlBuilder {
    ip: String,
    port: u16,
}

impl UrlBuilder {
    /// Creates a new `UrlBuilder` for the given server address.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Returns the base URL for the server (e.g., `http://192.168.1.100:8864`).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Returns the audio stream URL for a service within a channel.
    ///
    /// The service name is percent-encoded; DAB service names routinely
    /// contain spaces.
    #[must_use]
    pub fn stream_url(&self, channel: &str, service: &str) -> String {
        format!(
            "{}/stream/{}/{}",
            self.base_url(),
            channel,
            urlencoding::encode(service)
        )
    }

    /// Returns the URL under which a cached MPD album-art image is served.
    #[must_use]
    pub fn mpd_image_url(&self, song_path: &str) -> String {
        format!(
            "{}/mpd_image/{}",
            self.base_url(),
            urlencoding::encode(song_path)
        )
    }

    /// Returns the URL of the cast receiver page loaded by the cast app.
    #[must_use]
    pub fn cast_receiver_url(&self) -> String {
        format!("{}/cast_receiver/receiver.html", self.base_url())
    }

    /// Returns the base URL the MPD httpd output is reachable at.
    ///
    /// The cast device pulls the MPD stream directly from this port.
    #[must_use]
    pub fn mpd_stream_url(&self, streaming_port: u16) -> String {
        format!("http://{}:{}", self.ip, streaming_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn explicit_context_uses_provided_ip() {
        let ctx = NetworkContext::explicit(8864, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(ctx.local_ip(), "192.168.1.100");
        assert_eq!(ctx.port(), 8864);
    }

    #[test]
    fn url_builder_generates_correct_urls() {
        let builder = UrlBuilder::new("192.168.1.100", 8864);
        assert_eq!(builder.base_url(), "http://192.168.1.100:8864");
        assert_eq!(
            builder.stream_url("11D", "BAYERN 3"),
            "http://192.168.1.100:8864/stream/11D/BAYERN%203"
        );
        assert_eq!(
            builder.mpd_image_url("music/album/track.flac"),
            "http://192.168.1.100:8864/mpd_image/music%2Falbum%2Ftrack.flac"
        );
        assert_eq!(
            builder.cast_receiver_url(),
            "http://192.168.1.100:8864/cast_receiver/receiver.html"
        );
        assert_eq!(
            builder.mpd_stream_url(8000),
            "http://192.168.1.100:8000"
        );
    }
}
