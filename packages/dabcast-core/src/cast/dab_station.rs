//! Stream metadata from the DAB server's own HTTP surface.
//!
//! Handles playlist items like `http://<dab_server>:8864/stream/11D/BAYERN%203`,
//! i.e. the URLs the scanner playlist hands to MPD. Initialization probes the
//! `label/current` endpoint; afterwards `new_label`/`new_image` long-poll the
//! `next` endpoints, which only answer when the broadcast metadata changes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use url::Url;

use crate::cast::CastData;

/// Shown until the station broadcasts a MOT slide.
const DAB_LOGO_IMAGE: &str =
    "https://www.worlddab.org/image/content/2054/400x235_DABplus_Logo_Farbe_sRGB.png";

/// The initial label probe must outlive a device that is still tuning, which
/// can hold the request for a long time.
const INITIAL_PROBE_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay before retrying a failed metadata long-poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connector to one DAB station served by this process (or a sibling).
pub struct DabStation {
    song_url: Url,
    channel_name: String,
    station_name: String,
    label: Mutex<String>,
    image_url: Mutex<String>,
}

impl DabStation {
    /// Parses the stream URL; `None` when it is not shaped like a DAB
    /// stream link.
    pub fn new(song_url: &str) -> Option<Self> {
        let url = Url::parse(song_url).ok()?;
        let segments: Vec<String> = url
            .path_segments()?
            .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).ok())
            .collect::<Option<_>>()?;
        if segments.len() != 3 || segments[0] != "stream" {
            return None;
        }
        Some(Self {
            song_url: url,
            channel_name: segments[1].clone(),
            station_name: segments[2].clone(),
            label: Mutex::new(String::new()),
            image_url: Mutex::new(DAB_LOGO_IMAGE.to_string()),
        })
    }

    /// Validates the DAB server's presence by fetching the current label.
    /// Any disconnect or timeout means "not a DAB stream".
    pub async fn initialize(&self) -> bool {
        log::info!(
            "[DabStation] probing {}/{}",
            self.channel_name,
            self.station_name
        );
        let url = self.metadata_url("label/current");
        let response = reqwest::Client::new()
            .get(url)
            .timeout(INITIAL_PROBE_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                match response.text().await {
                    Ok(label) => {
                        *self.label.lock() = label;
                        true
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    /// Fills title (station), artist (label) and image for the cast device.
    pub fn fill_cast_data(&self, cast_data: &mut CastData) {
        cast_data.title = self.station_name.clone();
        cast_data.artist = self.label.lock().clone();
        cast_data.image_url = self.image_url.lock().clone();
    }

    /// Long-polls until the station broadcasts a new dynamic label.
    pub async fn new_label(&self) {
        let url = self.metadata_url("label/next");
        let client = reqwest::Client::new();
        loop {
            match client.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    if let Ok(label) = response.text().await {
                        *self.label.lock() = label;
                        return;
                    }
                }
                _ => {}
            }
            tokio::time::sleep(POLL_RETRY_DELAY).await;
        }
    }

    /// Long-polls until the station broadcasts a new MOT image, then points
    /// the image URL at `image/current` with a cache-buster query.
    pub async fn new_image(&self) {
        let url = self.metadata_url("image/next");
        let client = reqwest::Client::new();
        loop {
            match client.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    let mut current = self.metadata_url("image/current");
                    let buster = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    current.set_query(Some(&buster.to_string()));
                    *self.image_url.lock() = current.to_string();
                    return;
                }
                _ => {}
            }
            tokio::time::sleep(POLL_RETRY_DELAY).await;
        }
    }

    fn metadata_url(&self, kind: &str) -> Url {
        let mut url = self.song_url.clone();
        url.set_path(&format!(
            "{}/{}/{}",
            kind, self.channel_name, self.station_name
        ));
        url.set_query(None);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dab_stream_urls() {
        let station = DabStation::new("http://10.0.0.2:8864/stream/11D/BAYERN%203").unwrap();
        assert_eq!(station.channel_name, "11D");
        assert_eq!(station.station_name, "BAYERN 3");
        assert_eq!(
            station.metadata_url("label/next").as_str(),
            "http://10.0.0.2:8864/label/next/11D/BAYERN%203"
        );
    }

    #[test]
    fn rejects_non_stream_urls() {
        assert!(DabStation::new("http://10.0.0.2:8864/label/11D/X").is_none());
        assert!(DabStation::new("http://10.0.0.2:8864/stream/11D").is_none());
        assert!(DabStation::new("local/file.flac").is_none());
    }

    #[test]
    fn cast_data_starts_with_station_and_logo() {
        let station = DabStation::new("http://10.0.0.2:8864/stream/11D/SWR3").unwrap();
        let mut data = CastData::default();
        station.fill_cast_data(&mut data);
        assert_eq!(data.title, "SWR3");
        assert_eq!(data.artist, "");
        assert_eq!(data.image_url, DAB_LOGO_IMAGE);
    }
}
