//! MPD configuration reader.
//!
//! mpd.conf is not in any standard format, but two textual rewrites turn it
//! into valid TOML: `name { ... }` blocks become `[[name]]` array tables,
//! and `key value` lines get an equals sign. The rewritten document is then
//! parsed normally and validated for the fields the cast bridge needs.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MpdConfigError {
    #[error("Failed to read MPD config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse MPD config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No httpd audio output defined.")]
    NoHttpdOutput,
    #[error("No httpd streaming port defined.")]
    NoStreamingPort,
    #[error("Invalid httpd streaming port defined: {0}.")]
    InvalidStreamingPort(String),
    #[error("No cast device name defined.")]
    NoDeviceName,
}

/// The MPD settings the cast bridge consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpdConfig {
    /// MPD control port.
    pub port: u16,
    /// Port of the `httpd` audio output the cast device will stream from.
    pub streaming_port: u16,
    /// Friendly name of the cast device, taken from the output's `name`.
    pub device_name: String,
}

impl MpdConfig {
    /// Loads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self, MpdConfigError> {
        log::info!("[MpdConfig] loading config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_conf(&raw)
    }

    /// Parses mpd.conf text.
    fn from_conf(raw: &str) -> Result<Self, MpdConfigError> {
        let document: toml::Value = toml::from_str(&rewrite_to_toml(raw))?;

        let port = match document.get("port") {
            None => 6600,
            Some(value) => parse_port(value)
                .ok_or_else(|| MpdConfigError::InvalidStreamingPort(value.to_string()))?,
        };

        let outputs = document
            .get("audio_output")
            .and_then(toml::Value::as_array)
            .cloned()
            .unwrap_or_default();
        let httpd = outputs
            .iter()
            .find(|output| output.get("type").and_then(toml::Value::as_str) == Some("httpd"))
            .ok_or(MpdConfigError::NoHttpdOutput)?;

        let streaming_port = match httpd.get("port") {
            None => return Err(MpdConfigError::NoStreamingPort),
            Some(value) => parse_port(value)
                .ok_or_else(|| MpdConfigError::InvalidStreamingPort(value.to_string()))?,
        };

        let device_name = httpd
            .get("name")
            .and_then(toml::Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or(MpdConfigError::NoDeviceName)?
            .to_string();

        Ok(Self {
            port,
            streaming_port,
            device_name,
        })
    }
}

/// Accepts both `port 6600` and the quoted form `port "6600"`.
fn parse_port(value: &toml::Value) -> Option<u16> {
    match value {
        toml::Value::Integer(port) => u16::try_from(*port).ok(),
        toml::Value::String(port) => port.parse().ok(),
        _ => None,
    }
}

/// Applies the two rewrites that make mpd.conf parseable as TOML.
fn rewrite_to_toml(raw: &str) -> String {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static KEY_VALUE: OnceLock<Regex> = OnceLock::new();
    let block = BLOCK.get_or_init(|| Regex::new(r"(?s)\n([^\s#]+?)\s*\{(.*?)\}").unwrap());
    let key_value = KEY_VALUE.get_or_init(|| Regex::new(r"(?m)^\s*(\w+)\s*(.*)$").unwrap());

    // curly brace groups become toml array tables
    let rewritten = block.replace_all(raw, "\n[[$1]]$2\n");
    // keys and values get separated with an equals sign
    key_value.replace_all(&rewritten, "$1 = $2").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
music_directory "/var/lib/mpd/music"
port "6600"

audio_output {
    type "alsa"
    name "Built-in"
}

audio_output {
    type "httpd"
    name "Living Room Speaker"
    port "8000"
    encoder "lame"
}
"#;

    #[test]
    fn parses_a_typical_config() {
        let config = MpdConfig::from_conf(SAMPLE).unwrap();
        assert_eq!(
            config,
            MpdConfig {
                port: 6600,
                streaming_port: 8000,
                device_name: "Living Room Speaker".into(),
            }
        );
    }

    #[test]
    fn control_port_defaults_to_6600() {
        let config = MpdConfig::from_conf(
            "audio_output {\n type \"httpd\"\n name \"Box\"\n port \"8000\"\n}\n",
        )
        .unwrap();
        assert_eq!(config.port, 6600);
    }

    #[test]
    fn missing_httpd_output_is_an_error() {
        let conf = "port \"6600\"\naudio_output {\n type \"alsa\"\n name \"Built-in\"\n}\n";
        assert!(matches!(
            MpdConfig::from_conf(conf),
            Err(MpdConfigError::NoHttpdOutput)
        ));
    }

    #[test]
    fn missing_streaming_port_is_an_error() {
        let conf = "audio_output {\n type \"httpd\"\n name \"Box\"\n}\n";
        assert!(matches!(
            MpdConfig::from_conf(conf),
            Err(MpdConfigError::NoStreamingPort)
        ));
    }

    #[test]
    fn missing_device_name_is_an_error() {
        let conf = "audio_output {\n type \"httpd\"\n port \"8000\"\n}\n";
        assert!(matches!(
            MpdConfig::from_conf(conf),
            Err(MpdConfigError::NoDeviceName)
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = MpdConfig::load(file.path()).unwrap();
        assert_eq!(config.device_name, "Living Room Speaker");
    }
}
