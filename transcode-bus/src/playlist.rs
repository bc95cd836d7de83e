//! HLS media playlist (RFC 8216) for a finished set of segments.

use std::fmt;

use crate::segment::ManifestEntry;

pub const PLAYLIST_FILE: &str = "playlist.m3u8";

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub version: u8,
    /// Whole seconds, never below the longest segment.
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segment_extension: String,
    pub entries: Vec<ManifestEntry>,
    /// Whether to close the playlist with `#EXT-X-ENDLIST`.
    pub ended: bool,
}

impl MediaPlaylist {
    /// VOD playlist over `entries`, cut against `target_seconds`.
    pub fn from_entries(target_seconds: f64, entries: Vec<ManifestEntry>) -> Self {
        let longest = entries
            .iter()
            .map(|e| e.duration_seconds)
            .fold(target_seconds, f64::max);
        Self {
            version: 3,
            target_duration: longest.ceil().max(1.0) as u64,
            media_sequence: 0,
            segment_extension: "ts".to_string(),
            entries,
            ended: true,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.segment_extension = extension.into();
        self
    }

    pub fn segment_uri(&self, index: u64) -> String {
        segment_file_name(index, &self.segment_extension)
    }

    pub fn total_duration(&self) -> f64 {
        self.entries.iter().map(|e| e.duration_seconds).sum()
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

pub fn segment_file_name(index: u64, extension: &str) -> String {
    format!("segment{index}.{extension}")
}

impl fmt::Display for MediaPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:{}", self.version)?;
        writeln!(f, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        writeln!(f, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence)?;
        if self.ended {
            writeln!(f, "#EXT-X-PLAYLIST-TYPE:VOD")?;
        }
        for entry in &self.entries {
            writeln!(f, "#EXTINF:{:.3},", entry.duration_seconds)?;
            writeln!(f, "{}", self.segment_uri(entry.index))?;
        }
        if self.ended {
            writeln!(f, "#EXT-X-ENDLIST")?;
        }
        Ok(())
    }
}
