use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::*;
use crate::format::{MediaFormat, PixelFormat, SampleFormat};
use crate::input::PacketQueue;
use crate::output::{HlsDirectory, MemoryMuxer};
use crate::playlist::PLAYLIST_FILE;
use crate::raw::{LoopbackDevice, RAW_CODEC, RawDecoder, RawEncoder, TestPattern, TestPatternSource};

fn pattern(frames: u64) -> TestPattern {
    TestPattern {
        width: 4,
        height: 4,
        frames,
        ..TestPattern::default()
    }
}

fn source(pattern: TestPattern) -> anyhow::Result<Box<dyn Demuxer>> {
    Ok(Box::new(TestPatternSource::new(pattern)?))
}

fn config(target: f64) -> PipelineConfig {
    PipelineConfig {
        target_segment_duration: target,
        ..PipelineConfig::default()
    }
}

fn raw_stream() -> StreamDescriptor {
    StreamDescriptor::video(0, RAW_CODEC, PixelFormat::Yuv420p, 4, 4, TimeBase::MPEG_TS)
}

fn raw_packet(pts: i64) -> Packet {
    Packet::new(vec![7u8; 24], TimeBase::MPEG_TS)
        .with_pts(Some(pts))
        .with_dts(Some(pts))
        .with_duration(Some(3000))
        .with_key(true)
}

fn collect_segments(builder: PipelineBuilder) -> (PipelineBuilder, Arc<Mutex<Vec<ManifestEntry>>>) {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&entries);
    let builder = builder.on_segment(move |entry| sink.lock().unwrap().push(entry.clone()));
    (builder, entries)
}

#[test]
fn three_seconds_at_one_second_target_gives_three_segments() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    let builder = Pipeline::builder(source(pattern(90))?)
        .config(config(1.0))
        .muxer(Box::new(muxer));
    let (builder, entries) = collect_segments(builder);

    let stats = builder.build()?.run()?;
    assert_eq!(stats.packets_read, 90);
    assert_eq!(stats.frames_decoded, 90);
    assert_eq!(stats.frames_encoded, 90);
    assert_eq!(stats.packets_written, 90);
    assert_eq!(stats.segments, 3);
    assert_eq!(stats.last_pts, Some(89 * 3000));

    let entries = entries.lock().unwrap();
    assert_eq!(entries.len(), 3);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.index, i as u64);
        assert!((entry.duration_seconds - 1.0).abs() < 1e-9);
        assert_eq!(entry.byte_length, 30 * 24);
    }

    let log = log.lock().unwrap();
    assert_eq!((log.headers, log.trailers), (1, 1));
    assert_eq!(log.streams[0].time_base(), TimeBase::MPEG_TS);
    assert!(log.streams[0].extra_data().is_some());
    let pts: Vec<_> = log.packets.iter().map(|p| p.1).collect();
    let expected: Vec<_> = (0..90).map(|i| Some(i * 3000)).collect();
    assert_eq!(pts, expected);
    Ok(())
}

#[test]
fn two_second_target_runs_long_instead_of_short() -> anyhow::Result<()> {
    let builder = Pipeline::builder(source(pattern(90))?).config(config(2.0));
    let (builder, entries) = collect_segments(builder);

    let stats = builder.build()?.run()?;
    assert_eq!(stats.segments, 2);
    let durations: Vec<_> = entries
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.duration_seconds)
        .collect();
    assert_eq!(durations, vec![2.0, 1.0]);
    Ok(())
}

#[test]
fn delayed_codecs_are_drained_at_end_of_input() -> anyhow::Result<()> {
    let input = TestPatternSource::new(pattern(45))?;
    let stream = input.streams()[0].clone();
    let muxer = MemoryMuxer::new();
    let log = muxer.log();

    let stats = Pipeline::builder(Box::new(input))
        .config(config(1.0))
        .decoder(Box::new(RawDecoder::new(&stream, 3)?))
        .encoder(Box::new(RawEncoder::new(2)))
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    assert_eq!(stats.frames_decoded, 45);
    assert_eq!(stats.packets_written, 45);
    assert_eq!(stats.segments, 2);
    let log = log.lock().unwrap();
    assert!(log.packets.windows(2).all(|w| w[0].2 < w[1].2));
    Ok(())
}

#[test]
fn timestamps_reach_the_muxer_in_the_output_time_base() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    let stats = Pipeline::builder(source(TestPattern {
        time_base: TimeBase::MILLISECONDS,
        ..pattern(3)
    })?)
    .muxer(Box::new(muxer))
    .build()?
    .run()?;

    assert_eq!(stats.packets_written, 3);
    let log = log.lock().unwrap();
    // 33ms and 67ms at 1/1000, re-expressed at 1/90000.
    let pts: Vec<_> = log.packets.iter().map(|p| p.1).collect();
    assert_eq!(pts, vec![Some(0), Some(2970), Some(6030)]);
    Ok(())
}

/// Never accepts input and never produces output.
struct Jammed;

impl DecodeStep for Jammed {
    fn name(&self) -> &str {
        "jammed"
    }

    fn time_base(&self) -> TimeBase {
        TimeBase::MPEG_TS
    }

    fn send_packet(&mut self, packet: Packet) -> std::result::Result<(), TrySubmitError<Packet>> {
        Err(TrySubmitError::Busy(packet))
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        Ok(None)
    }
}

#[test]
fn engine_that_never_drains_stalls_the_pipeline() -> anyhow::Result<()> {
    let err = Pipeline::builder(source(pattern(10))?)
        .config(PipelineConfig {
            max_stall_attempts: 4,
            ..PipelineConfig::default()
        })
        .decoder(Box::new(Jammed))
        .build()?
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Aborted {
            stage: "decoder",
            last_pts: None,
            ..
        }
    ));
    assert!(matches!(
        err.root(),
        Error::StalledPipeline {
            stage: "decoder",
            attempts: 4
        }
    ));
    Ok(())
}

#[test]
fn hardware_frames_are_downloaded_before_encoding() -> anyhow::Result<()> {
    let loopback = LoopbackDevice::new(PixelFormat::Yuv420p);
    let pool = loopback.pool_handle();
    let options = DecoderOptions::default().with_hw_device(loopback.into_device());

    let pipeline = Pipeline::builder(source(pattern(60))?)
        .config(config(1.0))
        .decoder_options(options)
        .build()?;
    assert_eq!(pipeline.decoder().output_format(), Some(PixelFormat::Opaque));

    let stats = pipeline.run()?;
    assert_eq!(stats.frames_decoded, 60);
    assert_eq!(stats.frames_dropped_transfer, 0);
    assert_eq!(stats.frames_encoded, 60);
    assert_eq!(stats.segments, 2);
    assert_eq!(pool.in_use(), 0);
    Ok(())
}

#[test]
fn failed_transfers_drop_frames_and_continue() -> anyhow::Result<()> {
    let loopback = LoopbackDevice::new(PixelFormat::Yuv420p);
    let pool = loopback.pool_handle();
    let muxer = MemoryMuxer::new();
    let log = muxer.log();

    let stats = Pipeline::builder(source(pattern(30))?)
        .decoder_options(DecoderOptions::default().with_hw_device(loopback.into_device()))
        .encoder_settings(EncoderSettings {
            format: MediaFormat::Pixel(PixelFormat::Nv12),
            ..EncoderSettings::default()
        })
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    assert_eq!(stats.frames_decoded, 30);
    assert_eq!(stats.frames_dropped_transfer, 30);
    assert_eq!(stats.frames_encoded, 0);
    assert_eq!(stats.segments, 0);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(log.lock().unwrap().headers, 0);
    Ok(())
}

#[test]
fn frames_in_the_wrong_format_are_dropped_without_a_converter() -> anyhow::Result<()> {
    let stats = Pipeline::builder(source(TestPattern {
        format: PixelFormat::Nv12,
        ..pattern(10)
    })?)
    .build()?
    .run()?;

    assert_eq!(stats.frames_decoded, 10);
    assert_eq!(stats.frames_dropped_format, 10);
    assert_eq!(stats.packets_written, 0);
    Ok(())
}

/// Reinterprets the picture bytes in the target layout.
struct Relabel;

impl FormatConverter for Relabel {
    fn convert(&mut self, frame: &Frame, target: MediaFormat) -> Result<Frame> {
        let data = frame
            .software_data()
            .cloned()
            .ok_or_else(|| Error::codec("software frames only"))?;
        let format = target
            .pixel()
            .ok_or_else(|| Error::codec("video targets only"))?;
        Ok(Frame::video(data, format, frame.width(), frame.height()))
    }
}

#[test]
fn converter_brings_frames_into_the_encoder_format() -> anyhow::Result<()> {
    let stats = Pipeline::builder(source(TestPattern {
        format: PixelFormat::Nv12,
        ..pattern(10)
    })?)
    .converter(Box::new(Relabel))
    .build()?
    .run()?;

    assert_eq!(stats.frames_converted, 10);
    assert_eq!(stats.frames_dropped_format, 0);
    assert_eq!(stats.packets_written, 10);
    Ok(())
}

#[test]
fn backwards_dts_is_clamped() -> anyhow::Result<()> {
    let mut input = PacketQueue::new(vec![raw_stream()]);
    input.extend([raw_packet(0), raw_packet(6000), raw_packet(3000)]);
    let muxer = MemoryMuxer::new();
    let log = muxer.log();

    let stats = Pipeline::builder(Box::new(input))
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    assert_eq!(stats.dts_corrections, 1);
    let dts: Vec<_> = log.lock().unwrap().packets.iter().map(|p| p.2).collect();
    assert_eq!(dts, vec![Some(0), Some(6000), Some(6000)]);
    Ok(())
}

#[test]
fn discontinuity_restarts_dts_ordering() -> anyhow::Result<()> {
    let mut input = PacketQueue::new(vec![raw_stream()]);
    let mut restart = raw_packet(0);
    restart.set_discontinuity(true);
    input.extend([raw_packet(90_000), raw_packet(93_000), restart, raw_packet(3000)]);

    let stats = Pipeline::builder(Box::new(input)).build()?.run()?;
    assert_eq!(stats.dts_corrections, 0);
    assert_eq!(stats.last_pts, Some(3000));
    Ok(())
}

#[test]
fn discontinuity_survives_codec_delay() -> anyhow::Result<()> {
    let mut input = PacketQueue::new(vec![raw_stream()]);
    input.extend([
        raw_packet(90_000),
        raw_packet(93_000),
        raw_packet(0).with_discontinuity(true),
        raw_packet(3000),
        raw_packet(6000),
    ]);
    let muxer = MemoryMuxer::new();
    let log = muxer.log();

    let stats = Pipeline::builder(Box::new(input))
        .decoder(Box::new(RawDecoder::new(&raw_stream(), 2)?))
        .encoder(Box::new(RawEncoder::new(2)))
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    assert_eq!(stats.dts_corrections, 0);
    let log = log.lock().unwrap();
    let dts: Vec<_> = log.packets.iter().map(|p| p.2).collect();
    assert_eq!(
        dts,
        vec![Some(90_000), Some(93_000), Some(0), Some(3000), Some(6000)]
    );
    Ok(())
}

/// Emits pictures in I P B decode order: the second of every pair goes out
/// first, with dts running one frame behind pts.
#[derive(Default)]
struct Reordering {
    held: Option<Frame>,
    ready: std::collections::VecDeque<Frame>,
    seen: u64,
    emitted: i64,
}

impl EncodeStep for Reordering {
    fn name(&self) -> &str {
        "reordering"
    }

    fn open(&mut self, _settings: &EncoderSettings) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn send_frame(&mut self, frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>> {
        if !self.ready.is_empty() {
            return Err(TrySubmitError::Busy(frame));
        }
        self.seen += 1;
        if self.seen == 1 {
            self.ready.push_back(frame);
            return Ok(());
        }
        match self.held.take() {
            None => self.held = Some(frame),
            Some(earlier) => {
                self.ready.push_back(frame);
                self.ready.push_back(earlier);
            }
        }
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        if let Some(frame) = self.held.take() {
            self.ready.push_back(frame);
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        let Some(frame) = self.ready.pop_front() else {
            return Ok(None);
        };
        let dts = (self.emitted - 1) * 3000;
        let is_key = self.emitted == 0;
        self.emitted += 1;
        Ok(Some(
            Packet::new(vec![0u8; 4], TimeBase::MPEG_TS)
                .with_pts(frame.pts())
                .with_dts(Some(dts))
                .with_key(is_key),
        ))
    }
}

#[test]
fn reordered_encoder_output_keeps_dts_non_decreasing() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    let stats = Pipeline::builder(source(pattern(31))?)
        .encoder(Box::new(Reordering::default()))
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    assert_eq!(stats.packets_written, 31);
    assert_eq!(stats.dts_corrections, 0);
    let log = log.lock().unwrap();
    let pts: Vec<_> = log.packets.iter().map(|p| p.1).take(5).collect();
    assert_eq!(pts, vec![Some(0), Some(6000), Some(3000), Some(12_000), Some(9000)]);
    let dts: Vec<_> = log.packets.iter().filter_map(|p| p.2).collect();
    assert_eq!(dts.len(), 31);
    assert!(dts.windows(2).all(|w| w[0] <= w[1]));
    assert!(log.packets.iter().all(|p| p.1 >= p.2));
    Ok(())
}

#[test]
fn packets_of_other_streams_are_skipped() -> anyhow::Result<()> {
    let audio = StreamDescriptor::audio(1, "pcm", SampleFormat::S16, 48_000, 2, TimeBase::MPEG_TS);
    let mut input = PacketQueue::new(vec![audio, raw_stream()]);
    input.push(Packet::new(Bytes::from_static(&[0; 8]), TimeBase::MPEG_TS).with_stream_index(1));
    input.push(raw_packet(0));
    input.push(Packet::new(Bytes::from_static(&[0; 8]), TimeBase::MPEG_TS).with_stream_index(1));

    let pipeline = Pipeline::builder(Box::new(input)).build()?;
    assert_eq!(pipeline.input_stream().index(), 0);
    let stats = pipeline.run()?;
    assert_eq!(stats.packets_read, 3);
    assert_eq!(stats.packets_skipped, 2);
    assert_eq!(stats.packets_written, 1);
    Ok(())
}

#[test]
fn empty_input_flushes_cleanly() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    let stats = Pipeline::builder(source(pattern(0))?)
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    assert_eq!(stats, PipelineStats::default());
    let log = log.lock().unwrap();
    assert_eq!((log.headers, log.trailers), (0, 0));
    Ok(())
}

#[test]
fn cancelled_run_is_not_flushed() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = Pipeline::builder(source(pattern(30))?)
        .muxer(Box::new(muxer))
        .build()?
        .run_until_cancelled(&cancel);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(log.lock().unwrap().trailers, 0);
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected() -> anyhow::Result<()> {
    let zero_target = Pipeline::builder(source(pattern(1))?).config(config(0.0)).build();
    assert!(matches!(zero_target, Err(Error::Config(_))));

    let missing = Pipeline::builder(source(pattern(1))?)
        .config(PipelineConfig {
            stream_index: Some(5),
            ..PipelineConfig::default()
        })
        .build();
    assert!(matches!(missing, Err(Error::Config(_))));
    Ok(())
}

#[test]
fn hls_directory_receives_every_segment() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let hls = HlsDirectory::create(tmp.path(), 1.0)?;

    let stats = Pipeline::builder(source(pattern(90))?)
        .config(config(1.0))
        .segment_consumer(Box::new(hls))
        .build()?
        .run()?;
    assert_eq!(stats.segments, 3);

    for i in 0..3 {
        let segment = std::fs::read(tmp.path().join(format!("segment{i}.ts")))?;
        assert!(segment.starts_with(b"RAW1 yuv420p 4x4"));
    }
    let playlist = std::fs::read_to_string(tmp.path().join(PLAYLIST_FILE))?;
    assert_eq!(playlist.matches("#EXTINF:1.000,").count(), 3);
    Ok(())
}

const AVCC: [u8; 14] = [1, 0x64, 0, 0x1f, 0xff, 0xe1, 0, 2, 0x67, 0x64, 1, 0, 1, 0x68];

/// Emits length-prefixed slices with an avcC header, like an MP4-minded
/// H.264 encoder.
#[derive(Default)]
struct AvccEncoder {
    queue: std::collections::VecDeque<Frame>,
    encoded: u64,
}

impl EncodeStep for AvccEncoder {
    fn name(&self) -> &str {
        "avcc"
    }

    fn open(&mut self, _settings: &EncoderSettings) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::from_static(&AVCC)))
    }

    fn send_frame(&mut self, frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>> {
        if !self.queue.is_empty() {
            return Err(TrySubmitError::Busy(frame));
        }
        self.queue.push_back(frame);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        let Some(frame) = self.queue.pop_front() else {
            return Ok(None);
        };
        let is_key = self.encoded % 30 == 0;
        self.encoded += 1;
        Ok(Some(
            Packet::new(vec![0u8, 0, 0, 2, 0x65, 0x88], TimeBase::MPEG_TS)
                .with_pts(frame.pts())
                .with_dts(frame.pts())
                .with_key(is_key),
        ))
    }
}

#[test]
fn avcc_output_is_rewritten_to_start_codes() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    let stats = Pipeline::builder(source(pattern(30))?)
        .config(config(1.0))
        .encoder(Box::new(AvccEncoder::default()))
        .muxer(Box::new(muxer))
        .build()?
        .run()?;
    assert_eq!(stats.packets_written, 30);

    let log = log.lock().unwrap();
    assert!(log.streams[0].extra_data().is_none());
    assert_eq!(
        &log.packets[0].3[..],
        &[0, 0, 0, 1, 0x67, 0x64, 0, 0, 0, 1, 0x68, 0, 0, 0, 1, 0x65, 0x88][..]
    );
    assert_eq!(&log.packets[1].3[..], &[0, 0, 0, 1, 0x65, 0x88][..]);
    Ok(())
}

#[test]
fn annexb_conversion_can_be_turned_off() -> anyhow::Result<()> {
    let muxer = MemoryMuxer::new();
    let log = muxer.log();
    Pipeline::builder(source(pattern(30))?)
        .config(PipelineConfig {
            annexb: false,
            ..config(1.0)
        })
        .encoder(Box::new(AvccEncoder::default()))
        .muxer(Box::new(muxer))
        .build()?
        .run()?;

    let log = log.lock().unwrap();
    assert_eq!(log.streams[0].extra_data().map(|d| &d[..]), Some(&AVCC[..]));
    assert_eq!(&log.packets[0].3[..], &[0, 0, 0, 2, 0x65, 0x88][..]);
    Ok(())
}
