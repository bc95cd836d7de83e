use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::playlist::{MediaPlaylist, PLAYLIST_FILE, segment_file_name};
use crate::segment::{ManifestEntry, Segment};
use crate::stream::StreamDescriptor;

/// Container writer.
pub trait Muxer: Send {
    fn write_header(&mut self, streams: &[StreamDescriptor]) -> Result<()>;

    /// Packets arrive in the time base of their output stream.
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;

    fn write_trailer(&mut self) -> Result<()>;
}

/// Enforces header, then packets, then trailer exactly once around a [`Muxer`].
pub struct MuxOutput {
    inner: Box<dyn Muxer>,
    streams: Vec<StreamDescriptor>,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl MuxOutput {
    pub fn new(inner: Box<dyn Muxer>) -> Self {
        Self {
            inner,
            streams: Vec::new(),
            have_written_header: false,
            have_written_trailer: false,
        }
    }

    pub fn add_stream(&mut self, stream: &StreamDescriptor) -> Result<()> {
        if self.have_written_header {
            return Err(Error::mux("cannot add a stream after the header"));
        }
        self.streams.push(stream.clone());
        Ok(())
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if self.have_written_trailer {
            return Err(Error::InvalidState {
                stage: "muxer",
                op: "write_packet",
                state: "finished",
            });
        }
        let stream = self
            .streams
            .iter()
            .find(|s| s.index() == packet.index())
            .ok_or_else(|| Error::mux(format!("stream {} not found", packet.index())))?;
        if stream.time_base() != packet.time_base() {
            return Err(Error::mux(format!(
                "packet time base {} differs from stream time base {}",
                packet.time_base(),
                stream.time_base()
            )));
        }
        if !self.have_written_header {
            self.inner.write_header(&self.streams)?;
            self.have_written_header = true;
        }
        self.inner.write_packet(packet)
    }

    /// Writes the trailer once. Does nothing if no packet was ever written.
    pub fn finish(&mut self) -> Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
        }
        Ok(())
    }
}

/// Receives each segment as soon as it is sealed.
pub trait SegmentConsumer: Send {
    /// Called once with the encoded stream before the first segment.
    fn start(&mut self, _stream: &StreamDescriptor) -> Result<()> {
        Ok(())
    }

    fn on_segment(&mut self, segment: Segment, entry: &ManifestEntry) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes `segment{index}.{ext}` files and a `playlist.m3u8` into a directory.
pub struct HlsDirectory {
    dir: PathBuf,
    extension: String,
    target_seconds: f64,
    header: Option<Bytes>,
    entries: Vec<ManifestEntry>,
}

impl HlsDirectory {
    pub fn create(dir: impl AsRef<Path>, target_seconds: f64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            extension: "ts".to_string(),
            target_seconds,
            header: None,
            entries: Vec::new(),
        })
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn playlist(&self) -> MediaPlaylist {
        MediaPlaylist::from_entries(self.target_seconds, self.entries.clone())
            .with_extension(self.extension.clone())
    }
}

impl SegmentConsumer for HlsDirectory {
    fn start(&mut self, stream: &StreamDescriptor) -> Result<()> {
        self.header = stream.extra_data().cloned();
        Ok(())
    }

    fn on_segment(&mut self, segment: Segment, entry: &ManifestEntry) -> Result<()> {
        let path = self.dir.join(segment_file_name(entry.index, &self.extension));
        let mut file = fs::File::create(&path)?;
        // Every segment carries the stream header so it decodes on its own.
        if let Some(header) = &self.header {
            file.write_all(header)?;
        }
        for packet in segment.packets() {
            file.write_all(packet.data())?;
        }
        file.sync_all()?;
        log::info!(
            "wrote {} ({:.3}s, {} bytes)",
            path.display(),
            entry.duration_seconds,
            entry.byte_length
        );
        self.entries.push(entry.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let path = self.dir.join(PLAYLIST_FILE);
        fs::write(&path, self.playlist().render())?;
        log::info!("wrote {} with {} segments", path.display(), self.entries.len());
        Ok(())
    }
}

/// What a [`MemoryMuxer`] has seen, shared with the test or caller.
#[derive(Debug, Default)]
pub struct MuxLog {
    pub streams: Vec<StreamDescriptor>,
    pub packets: Vec<(usize, Option<i64>, Option<i64>, Bytes)>,
    pub headers: usize,
    pub trailers: usize,
}

#[derive(Clone, Default)]
pub struct MemoryMuxer {
    log: Arc<Mutex<MuxLog>>,
}

impl MemoryMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<MuxLog>> {
        Arc::clone(&self.log)
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut MuxLog) -> T) -> T {
        f(&mut self.log.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Muxer for MemoryMuxer {
    fn write_header(&mut self, streams: &[StreamDescriptor]) -> Result<()> {
        self.with_log(|log| {
            log.streams = streams.to_vec();
            log.headers += 1;
        });
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.with_log(|log| {
            log.packets.push((
                packet.index(),
                packet.pts(),
                packet.dts(),
                packet.data().clone(),
            ))
        });
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.with_log(|log| log.trailers += 1);
        Ok(())
    }
}

/// Writes the stream header followed by raw packet payloads, e.g. an Annex B
/// `.h264` file.
pub struct ElementaryStreamWriter<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> ElementaryStreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl ElementaryStreamWriter<fs::File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(fs::File::create(path)?))
    }
}

impl<W: Write + Send> Muxer for ElementaryStreamWriter<W> {
    fn write_header(&mut self, streams: &[StreamDescriptor]) -> Result<()> {
        if streams.len() != 1 {
            return Err(Error::mux(format!(
                "elementary stream output takes one stream, got {}",
                streams.len()
            )));
        }
        if let Some(header) = streams[0].extra_data() {
            self.writer.write_all(header)?;
        }
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.writer.write_all(packet.data())?;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::rational::{Rational, TimeBase};
    use crate::segment::Segmenter;

    fn stream() -> StreamDescriptor {
        StreamDescriptor::video(0, "rawvideo", PixelFormat::Yuv420p, 4, 4, TimeBase::MPEG_TS)
    }

    fn packet(pts: i64) -> Packet {
        Packet::new(Bytes::from_static(b"abcd"), TimeBase::MPEG_TS)
            .with_pts(Some(pts))
            .with_dts(Some(pts))
            .with_key(true)
    }

    #[test]
    fn header_and_trailer_written_once() -> anyhow::Result<()> {
        let muxer = MemoryMuxer::new();
        let log = muxer.log();
        let mut output = MuxOutput::new(Box::new(muxer));
        output.add_stream(&stream())?;

        output.write_packet(&packet(0))?;
        output.write_packet(&packet(3000))?;
        assert!(output.add_stream(&stream()).is_err());
        output.finish()?;
        output.finish()?;
        assert!(output.write_packet(&packet(6000)).is_err());

        let log = log.lock().unwrap();
        assert_eq!(log.headers, 1);
        assert_eq!(log.trailers, 1);
        assert_eq!(log.packets.len(), 2);
        Ok(())
    }

    #[test]
    fn finish_without_packets_writes_nothing() -> anyhow::Result<()> {
        let muxer = MemoryMuxer::new();
        let log = muxer.log();
        let mut output = MuxOutput::new(Box::new(muxer));
        output.add_stream(&stream())?;
        output.finish()?;
        assert_eq!(log.lock().unwrap().trailers, 0);
        Ok(())
    }

    #[test]
    fn packets_must_match_stream_time_base() -> anyhow::Result<()> {
        let mut output = MuxOutput::new(Box::new(MemoryMuxer::new()));
        output.add_stream(&stream())?;
        let packet = Packet::new(Bytes::from_static(b"x"), TimeBase::MILLISECONDS);
        assert!(matches!(output.write_packet(&packet), Err(Error::Mux(_))));
        Ok(())
    }

    #[test]
    fn hls_directory_writes_segments_and_playlist() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut hls = HlsDirectory::create(tmp.path().join("out"), 1.0)?;
        let stream = stream();
        stream.set_extra_data(Bytes::from_static(b"HDR"))?;
        hls.start(&stream)?;

        let mut segmenter = Segmenter::new(Rational::ONE);
        let second = Rational::ONE;
        assert!(segmenter.absorb(packet(0), second).is_none());
        let segment = segmenter.absorb(packet(90_000), second).expect("sealed");
        let entry = segment.manifest_entry();
        hls.on_segment(segment, &entry)?;
        let last = segmenter.flush().expect("pending");
        let entry = last.manifest_entry();
        hls.on_segment(last, &entry)?;
        hls.finish()?;

        let dir = tmp.path().join("out");
        assert_eq!(fs::read(dir.join("segment0.ts"))?, b"HDRabcd");
        assert_eq!(fs::read(dir.join("segment1.ts"))?, b"HDRabcd");
        let playlist = fs::read_to_string(dir.join(PLAYLIST_FILE))?;
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXTINF:1.000,\nsegment1.ts\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
        Ok(())
    }

    #[test]
    fn elementary_stream_writer_prepends_header() -> anyhow::Result<()> {
        let stream = stream();
        stream.set_extra_data(Bytes::from_static(b"H"))?;
        let mut writer = ElementaryStreamWriter::new(Vec::new());
        writer.write_header(&[stream])?;
        writer.write_packet(&packet(0))?;
        writer.write_trailer()?;
        assert_eq!(writer.into_inner(), b"Habcd");
        Ok(())
    }
}
