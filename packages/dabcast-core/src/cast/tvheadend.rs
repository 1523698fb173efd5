//! Stream metadata from a TVHeadend server.
//!
//! Handles playlist items like
//! `http://<tvh_server>:9981/stream/channelname/BAYERN%203`: the channel is
//! looked up in the EPG, and the current show provides title, subtitle and
//! the time at which the metadata should be refreshed next.

use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::cast::CastData;

/// Shown when the channel has no icon configured.
const FALLBACK_RADIO_IMAGE: &str =
    "https://www.radio.de/assets/images/app-stores/square_512x512_playstore.png";

/// Channel icon path on the TVHeadend host when none is published.
const FALLBACK_ICON_PATH: &str = "static/img/logobig.png";

/// Maps the stream-URL path key to the channel-grid field it filters on.
fn filter_field(key: &str) -> Option<&'static str> {
    match key {
        "channelnumber" => Some("number"),
        "channelname" => Some("name"),
        "channel" => Some("uuid"),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelEntry {
    uuid: String,
    name: String,
    #[serde(default)]
    number: Option<i64>,
    #[serde(default)]
    icon_public_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelGrid {
    #[serde(default)]
    entries: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowDetails {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    pub stop: i64,
}

#[derive(Debug, Deserialize)]
struct EpgGrid {
    #[serde(default)]
    entries: Vec<ShowDetails>,
}

/// Connector to interact with TVHeadend for one stream URL.
pub struct TvheadendChannel {
    song_url: Url,
    filter_field: &'static str,
    channel_id: String,
    channel: Option<ChannelEntry>,
    show_end: Option<i64>,
}

impl TvheadendChannel {
    /// Parses the stream URL; `None` when it is not a TVHeadend stream link.
    pub fn new(song_url: &str) -> Option<Self> {
        let url = Url::parse(song_url).ok()?;
        let segments: Vec<String> = url
            .path_segments()?
            .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).ok())
            .collect::<Option<_>>()?;
        if segments.len() != 3 || segments[0] != "stream" {
            return None;
        }
        let field = filter_field(&segments[1])?;
        Some(Self {
            song_url: url,
            filter_field: field,
            channel_id: segments[2].clone(),
            channel: None,
            show_end: None,
        })
    }

    /// Looks the channel up in the grid; true when a radio channel with the
    /// exact requested id exists.
    pub async fn initialize(&mut self) -> bool {
        log::info!("[Tvheadend] initializing channel lookup");
        let filters = json!([
            {"type": "string", "value": self.channel_id, "field": self.filter_field},
            {"type": "string", "value": "Radio", "field": "tags"},
        ]);
        let form = [
            ("start", "0".to_string()),
            ("limit", "1".to_string()),
            ("sort", "name".to_string()),
            ("dir", "ASC".to_string()),
            ("filter", filters.to_string()),
        ];
        let Ok(endpoint) = self.song_url.join("/api/channel/grid") else {
            return false;
        };
        let grid: ChannelGrid = match post_form(endpoint, &form).await {
            Ok(grid) => grid,
            Err(e) => {
                log::info!("[Tvheadend] channel grid request failed: {}", e);
                return false;
            }
        };

        // The grid filter is a substring match; require the id to be really
        // equal (don't use "QVC ZWEI" instead of "QVC").
        for entry in grid.entries {
            let matches = match self.filter_field {
                "number" => entry
                    .number
                    .is_some_and(|n| n.to_string() == self.channel_id),
                "name" => entry.name == self.channel_id,
                _ => entry.uuid == self.channel_id,
            };
            if matches {
                self.channel = Some(entry);
                return true;
            }
        }
        false
    }

    /// Fills title, artist and image for the show running right now.
    pub async fn fill_cast_data(&mut self, cast_data: &mut CastData) -> bool {
        let Some(channel) = self.channel.clone() else {
            return false;
        };
        cast_data.image_url = self
            .image_url(&channel)
            .unwrap_or_else(|| FALLBACK_RADIO_IMAGE.to_string());

        match self.current_show().await {
            Some(show) => {
                if let Some(title) = show.title {
                    cast_data.title = title;
                }
                if let Some(subtitle) = show.subtitle {
                    cast_data.artist = subtitle;
                }
                self.show_end = Some(show.stop);
            }
            // No EPG data. Show only the channel name.
            None => cast_data.title = channel.name.clone(),
        }
        true
    }

    /// Seconds until the current show ends, used to schedule the next
    /// metadata refresh.
    pub fn remaining_show_time(&self) -> Option<i64> {
        let stop = self.show_end?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Some(stop - now)
    }

    /// Queries the show running right now on the channel.
    pub async fn current_show(&self) -> Option<ShowDetails> {
        let channel = self.channel.as_ref()?;
        let form = [
            ("start", "0".to_string()),
            ("limit", "1".to_string()),
            ("sort", "channelnumber".to_string()),
            ("dir", "ASC".to_string()),
            ("mode", "now".to_string()),
            ("channel", channel.uuid.clone()),
        ];
        let endpoint = self.song_url.join("/api/epg/events/grid").ok()?;
        let grid: EpgGrid = match post_form(endpoint, &form).await {
            Ok(grid) => grid,
            Err(e) => {
                log::info!("[Tvheadend] EPG request failed: {}", e);
                return None;
            }
        };
        grid.entries.into_iter().next()
    }

    fn image_url(&self, channel: &ChannelEntry) -> Option<String> {
        let icon_path = channel
            .icon_public_url
            .clone()
            .unwrap_or_else(|| FALLBACK_ICON_PATH.to_string());
        self.song_url
            .join(&format!("/{}", icon_path.trim_start_matches('/')))
            .map(String::from)
            .ok()
    }
}

async fn post_form<T: serde::de::DeserializeOwned>(
    endpoint: Url,
    form: &[(&str, String)],
) -> Result<T, reqwest::Error> {
    reqwest::Client::new()
        .post(endpoint)
        .form(form)
        .send()
        .await?
        .json()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_supported_stream_links() {
        let channel =
            TvheadendChannel::new("http://tvh.local:9981/stream/channelname/BAYERN%203").unwrap();
        assert_eq!(channel.filter_field, "name");
        assert_eq!(channel.channel_id, "BAYERN 3");

        let by_number = TvheadendChannel::new("http://tvh.local:9981/stream/channelnumber/12");
        assert_eq!(by_number.unwrap().filter_field, "number");

        let by_uuid = TvheadendChannel::new("http://tvh.local:9981/stream/channel/abcd1234");
        assert_eq!(by_uuid.unwrap().filter_field, "uuid");
    }

    #[test]
    fn rejects_other_urls() {
        assert!(TvheadendChannel::new("http://tvh.local:9981/stream/something/x").is_none());
        assert!(TvheadendChannel::new("http://tvh.local:9981/other/channelname/x").is_none());
        assert!(TvheadendChannel::new("not a url").is_none());
        assert!(TvheadendChannel::new("http://tvh.local:9981/stream/channelname").is_none());
    }

    #[test]
    fn icon_url_falls_back_to_logobig() {
        let channel =
            TvheadendChannel::new("http://tvh.local:9981/stream/channelname/QVC").unwrap();
        let entry = ChannelEntry {
            uuid: "u1".into(),
            name: "QVC".into(),
            number: None,
            icon_public_url: None,
        };
        assert_eq!(
            channel.image_url(&entry).unwrap(),
            "http://tvh.local:9981/static/img/logobig.png"
        );

        let with_icon = ChannelEntry {
            icon_public_url: Some("imagecache/42".into()),
            ..entry
        };
        assert_eq!(
            channel.image_url(&with_icon).unwrap(),
            "http://tvh.local:9981/imagecache/42"
        );
    }
}
