//! Async client for the MPD line protocol.
//!
//! Covers exactly the commands the mirror needs: `idle`, `status`,
//! `currentsong` and `readpicture`. Responses are `key: value` lines
//! terminated by `OK`, or an `ACK [...]` error line; `readpicture`
//! interleaves length-prefixed binary chunks.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum MpdError {
    #[error("MPD connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MPD protocol error: {0}")]
    Protocol(String),
    #[error("MPD command failed: {0}")]
    Ack(String),
}

/// One song record as returned by `currentsong`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SongInfo {
    fields: HashMap<String, String>,
}

impl SongInfo {
    pub fn from_fields(fields: HashMap<String, String>) -> Self {
        Self { fields }
    }

    pub fn file(&self) -> Option<&str> {
        self.get("file")
    }

    pub fn title(&self) -> Option<&str> {
        self.get("Title")
    }

    pub fn artist(&self) -> Option<&str> {
        self.get("Artist")
    }

    /// Stream name, set for radio playlist entries.
    pub fn name(&self) -> Option<&str> {
        self.get("Name")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// A picture embedded in a song file.
#[derive(Debug, Clone)]
pub struct SongPicture {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Connected MPD client.
pub struct MpdClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MpdClient {
    /// Connects and consumes the `OK MPD <version>` banner.
    pub async fn connect(host: &str, port: u16) -> Result<Self, MpdError> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        let banner = client.read_line().await?;
        if !banner.starts_with("OK MPD") {
            return Err(MpdError::Protocol(format!("unexpected banner: {banner}")));
        }
        log::debug!("[Mpd] connected: {}", banner);
        Ok(client)
    }

    /// Blocks until MPD reports a change in any subsystem.
    pub async fn idle(&mut self) -> Result<Vec<String>, MpdError> {
        let fields = self.command("idle").await?;
        Ok(fields.into_iter().map(|(_, subsystem)| subsystem).collect())
    }

    /// Fetches the player status (`state`, `song`, ...).
    pub async fn status(&mut self) -> Result<HashMap<String, String>, MpdError> {
        Ok(self.command("status").await?.into_iter().collect())
    }

    /// Fetches the currently playing song, `None` when the queue is empty.
    pub async fn current_song(&mut self) -> Result<Option<SongInfo>, MpdError> {
        let fields: HashMap<String, String> =
            self.command("currentsong").await?.into_iter().collect();
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SongInfo::from_fields(fields)))
        }
    }

    /// Reads the picture embedded in a song file, chunk by chunk.
    pub async fn read_picture(&mut self, uri: &str) -> Result<Option<SongPicture>, MpdError> {
        let mut data = Vec::new();
        let mut mime_type = String::new();
        let mut total: Option<usize> = None;

        loop {
            self.send_command(&format!("readpicture {} {}", quote(uri), data.len()))
                .await?;
            let mut chunk_len: Option<usize> = None;
            loop {
                let line = self.read_line().await?;
                if line == "OK" {
                    break;
                }
                if let Some(message) = line.strip_prefix("ACK ") {
                    return Err(MpdError::Ack(message.to_string()));
                }
                let Some((key, value)) = split_pair(&line) else {
                    return Err(MpdError::Protocol(format!("malformed line: {line}")));
                };
                match key {
                    "size" => {
                        total = value.parse().ok();
                    }
                    "type" => {
                        mime_type = value.to_string();
                    }
                    "binary" => {
                        let len: usize = value
                            .parse()
                            .map_err(|_| MpdError::Protocol("bad binary length".into()))?;
                        let mut chunk = vec![0u8; len + 1]; // payload + trailing newline
                        self.reader.read_exact(&mut chunk).await?;
                        chunk.pop();
                        data.extend_from_slice(&chunk);
                        chunk_len = Some(len);
                    }
                    _ => {}
                }
            }
            match (chunk_len, total) {
                // no binary part at all: the song has no embedded picture
                (None, _) => return Ok(None),
                (Some(0), _) => break,
                (Some(_), Some(total)) if data.len() >= total => break,
                (Some(_), None) => break,
                _ => {}
            }
        }

        if data.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SongPicture { mime_type, data }))
        }
    }

    async fn command(&mut self, command: &str) -> Result<Vec<(String, String)>, MpdError> {
        self.send_command(command).await?;
        let mut fields = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "OK" {
                return Ok(fields);
            }
            if let Some(message) = line.strip_prefix("ACK ") {
                return Err(MpdError::Ack(message.to_string()));
            }
            if let Some((key, value)) = split_pair(&line) {
                fields.push((key.to_string(), value.to_string()));
            }
        }
    }

    async fn send_command(&mut self, command: &str) -> Result<(), MpdError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, MpdError> {
        let mut line = Vec::new();
        loop {
            let byte = self.reader.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key, value.trim_start()))
}

/// Quotes an argument for the MPD protocol.
fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn serve_script(listener: TcpListener, script: Vec<(&'static str, Vec<u8>)>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"OK MPD 0.23.5\n").await.unwrap();
        let mut reader = BufReader::new(read_half);
        for (expected, reply) in script {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), expected);
            write_half.write_all(&reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn status_and_current_song_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_script(
            listener,
            vec![
                ("status", b"state: play\nsong: 3\nOK\n".to_vec()),
                (
                    "currentsong",
                    b"file: radio/stream.m3u\nTitle: Morning Show\nArtist: Host\nOK\n".to_vec(),
                ),
                ("currentsong", b"OK\n".to_vec()),
            ],
        ));

        let mut client = MpdClient::connect("127.0.0.1", port).await.unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.get("state").map(String::as_str), Some("play"));

        let song = client.current_song().await.unwrap().unwrap();
        assert_eq!(song.file(), Some("radio/stream.m3u"));
        assert_eq!(song.title(), Some("Morning Show"));
        assert_eq!(song.artist(), Some("Host"));

        assert!(client.current_song().await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_picture_assembles_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut first = b"size: 6\ntype: image/png\nbinary: 4\n".to_vec();
        first.extend_from_slice(b"abcd\nOK\n");
        let mut second = b"size: 6\ntype: image/png\nbinary: 2\n".to_vec();
        second.extend_from_slice(b"ef\nOK\n");

        let server = tokio::spawn(serve_script(
            listener,
            vec![
                ("readpicture \"a song.flac\" 0", first),
                ("readpicture \"a song.flac\" 4", second),
            ],
        ));

        let mut client = MpdClient::connect("127.0.0.1", port).await.unwrap();
        let picture = client.read_picture("a song.flac").await.unwrap().unwrap();
        assert_eq!(picture.mime_type, "image/png");
        assert_eq!(picture.data, b"abcdef");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn song_without_picture_returns_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_script(
            listener,
            vec![("readpicture \"plain.mp3\" 0", b"OK\n".to_vec())],
        ));

        let mut client = MpdClient::connect("127.0.0.1", port).await.unwrap();
        assert!(client.read_picture("plain.mp3").await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ack_is_surfaced_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_script(
            listener,
            vec![(
                "status",
                b"ACK [5@0] {status} unknown command\n".to_vec(),
            )],
        ));

        let mut client = MpdClient::connect("127.0.0.1", port).await.unwrap();
        assert!(matches!(client.status().await, Err(MpdError::Ack(_))));
        server.await.unwrap();
    }
}
