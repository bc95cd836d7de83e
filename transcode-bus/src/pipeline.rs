//! Drives packets from a demuxer through decode, transfer, encode and
//! segmentation, one packet at a time.
//!
//! The loop is synchronous: each submit is followed by retrieving everything
//! the engine has ready before the next input, and a `Busy` engine is drained
//! and retried a bounded number of times before the pipeline gives up with
//! [`Error::StalledPipeline`]. End of input runs a three-phase flush: drain
//! the decoder, drain the encoder, then seal the last segment.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bsf::{AvccToAnnexB, BitstreamFilter, filter_packet, needs_annexb_conversion};
use crate::codec::{CodecRegistry, DecodeStep, EncodeStep};
use crate::decoder::{Decoder, DecoderOptions};
use crate::encoder::{Encoder, EncoderSettings};
use crate::error::{Error, Result, TrySubmitError};
use crate::frame::Frame;
use crate::hw::HwTransfer;
use crate::input::Demuxer;
use crate::output::{MuxOutput, Muxer, SegmentConsumer};
use crate::packet::Packet;
use crate::rational::{Rational, TimeBase};
use crate::scaler::{FormatConverter, Scaler};
use crate::segment::{ManifestEntry, Segment, Segmenter};
use crate::stream::{MediaType, StreamDescriptor};
use crate::timestamp::DtsGuard;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input stream to transcode. `None` picks the first video stream.
    pub stream_index: Option<usize>,
    /// Minimum segment length in seconds.
    pub target_segment_duration: f64,
    /// Consecutive fruitless drain attempts on a busy engine before giving up.
    pub max_stall_attempts: usize,
    pub output_stream_index: usize,
    /// Time base of the muxed stream. `None` keeps the encoder's.
    pub output_time_base: Option<TimeBase>,
    /// Try accelerated codecs before software ones.
    pub prefer_hw: bool,
    /// Rewrite length-prefixed H.264/HEVC output to start codes when no
    /// bitstream filter is given.
    pub annexb: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream_index: None,
            target_segment_duration: 2.0,
            max_stall_attempts: 64,
            output_stream_index: 0,
            output_time_base: Some(TimeBase::MPEG_TS),
            prefer_hw: false,
            annexb: true,
        }
    }
}

impl PipelineConfig {
    pub fn target_duration(&self) -> Result<Rational> {
        let target = self.target_segment_duration;
        if !target.is_finite() || target <= 0.0 {
            return Err(Error::config(format!("segment duration {target} must be positive")));
        }
        Rational::from_f64(target, 1_000_000)
    }
}

/// Counters for one run. Every frame that does not reach the encoder is
/// counted under the reason it was dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub packets_read: u64,
    /// Packets of streams other than the transcoded one.
    pub packets_skipped: u64,
    pub frames_decoded: u64,
    pub frames_dropped_transfer: u64,
    pub frames_dropped_format: u64,
    pub frames_converted: u64,
    pub frames_encoded: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub dts_corrections: u64,
    pub segments: u64,
    pub last_pts: Option<i64>,
}

pub type SegmentListener = Box<dyn FnMut(&ManifestEntry) + Send>;

pub struct PipelineBuilder {
    input: Box<dyn Demuxer>,
    config: PipelineConfig,
    registry: Option<CodecRegistry>,
    decoder: Option<Box<dyn DecodeStep>>,
    encoder: Option<Box<dyn EncodeStep>>,
    decoder_options: DecoderOptions,
    encoder_settings: EncoderSettings,
    bitstream_filter: Option<Box<dyn BitstreamFilter>>,
    converter: Option<Box<dyn FormatConverter>>,
    muxer: Option<Box<dyn Muxer>>,
    consumer: Option<Box<dyn SegmentConsumer>>,
    listener: Option<SegmentListener>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry used for codecs not given explicitly.
    pub fn registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn decoder(mut self, step: Box<dyn DecodeStep>) -> Self {
        self.decoder = Some(step);
        self
    }

    pub fn encoder(mut self, step: Box<dyn EncodeStep>) -> Self {
        self.encoder = Some(step);
        self
    }

    pub fn decoder_options(mut self, options: DecoderOptions) -> Self {
        self.decoder_options = options;
        self
    }

    pub fn encoder_settings(mut self, settings: EncoderSettings) -> Self {
        self.encoder_settings = settings;
        self
    }

    pub fn bitstream_filter(mut self, filter: Box<dyn BitstreamFilter>) -> Self {
        self.bitstream_filter = Some(filter);
        self
    }

    pub fn converter(mut self, converter: Box<dyn FormatConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn muxer(mut self, muxer: Box<dyn Muxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }

    pub fn segment_consumer(mut self, consumer: Box<dyn SegmentConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn on_segment<F>(mut self, listener: F) -> Self
    where
        F: FnMut(&ManifestEntry) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let target = config.target_duration()?;
        if config.max_stall_attempts == 0 {
            return Err(Error::config("max_stall_attempts must be at least 1"));
        }

        let stream = match config.stream_index {
            Some(index) => self.input.stream(index).cloned(),
            None => self
                .input
                .best_stream(MediaType::Video)
                .or_else(|| self.input.streams().first())
                .cloned(),
        }
        .ok_or_else(|| Error::config("input has no stream to transcode"))?;

        let registry = self.registry.unwrap_or_else(CodecRegistry::with_builtin);
        let decoder = match self.decoder {
            Some(step) => Decoder::new(&stream, step, self.decoder_options)?,
            None => registry.open_decoder(&stream, self.decoder_options, config.prefer_hw)?,
        };
        let mut settings = self.encoder_settings;
        if settings.width == 0 {
            settings.width = stream.width();
        }
        if settings.height == 0 {
            settings.height = stream.height();
        }
        let encoder = match self.encoder {
            Some(step) => Encoder::new(step, settings)?,
            None => registry.open_encoder(&settings, config.prefer_hw)?,
        };

        let transfer = encoder
            .format()
            .pixel()
            .filter(|format| !format.is_hardware())
            .map(|format| HwTransfer::new(format, stream.time_base()));
        let scaler = self
            .converter
            .map(|converter| Scaler::new(converter, encoder.format()));

        let mut bitstream_filter = self.bitstream_filter;
        let mut in_band_headers = false;
        if bitstream_filter.is_none() && config.annexb {
            if let Some(extra_data) = encoder.extra_data().filter(|d| needs_annexb_conversion(d)) {
                log::info!("encoder {} emits avcC, converting to annex b", encoder.name());
                let filter = AvccToAnnexB::new(Some(&extra_data[..]), encoder.time_base())?;
                bitstream_filter = Some(Box::new(filter));
                in_band_headers = true;
            }
        }

        let output_time_base = config.output_time_base.unwrap_or(encoder.time_base());
        // parameter sets travel in front of each keyframe once converted
        let output_stream = if in_band_headers {
            StreamDescriptor::for_encoder_output(&stream, encoder.settings(), config.output_stream_index)
        } else {
            encoder.output_stream(&stream, config.output_stream_index)?
        }
        .with_time_base(output_time_base);

        let muxer = match self.muxer {
            Some(muxer) => {
                let mut output = MuxOutput::new(muxer);
                output.add_stream(&output_stream)?;
                Some(output)
            }
            None => None,
        };
        let mut consumer = self.consumer;
        if let Some(consumer) = consumer.as_mut() {
            consumer.start(&output_stream)?;
        }

        log::info!(
            "pipeline: stream {} ({}) -> {} -> {} segments of at least {:.3}s",
            stream.index(),
            decoder.name(),
            encoder.name(),
            output_time_base,
            target.to_f64()
        );

        Ok(Pipeline {
            frame_duration: encoder.settings().frame_duration(),
            input_time_base: stream.time_base(),
            config,
            input: self.input,
            input_stream: stream,
            output_stream,
            decoder,
            transfer,
            scaler,
            encoder,
            bitstream_filter,
            dts_guard: DtsGuard::new(),
            segmenter: Segmenter::new(target),
            muxer,
            consumer,
            listener: self.listener,
            stats: PipelineStats::default(),
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    input: Box<dyn Demuxer>,
    input_stream: StreamDescriptor,
    input_time_base: TimeBase,
    output_stream: StreamDescriptor,
    decoder: Decoder,
    transfer: Option<HwTransfer>,
    scaler: Option<Scaler>,
    encoder: Encoder,
    bitstream_filter: Option<Box<dyn BitstreamFilter>>,
    dts_guard: DtsGuard,
    segmenter: Segmenter,
    frame_duration: Rational,
    muxer: Option<MuxOutput>,
    consumer: Option<Box<dyn SegmentConsumer>>,
    listener: Option<SegmentListener>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn builder(input: Box<dyn Demuxer>) -> PipelineBuilder {
        PipelineBuilder {
            input,
            config: PipelineConfig::default(),
            registry: None,
            decoder: None,
            encoder: None,
            decoder_options: DecoderOptions::default(),
            encoder_settings: EncoderSettings::default(),
            bitstream_filter: None,
            converter: None,
            muxer: None,
            consumer: None,
            listener: None,
        }
    }

    pub fn set_segment_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&ManifestEntry) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn input_stream(&self) -> &StreamDescriptor {
        &self.input_stream
    }

    pub fn output_stream(&self) -> &StreamDescriptor {
        &self.output_stream
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Runs to the end of input and flushes.
    pub fn run(mut self) -> Result<PipelineStats> {
        while self.step()? {}
        self.finish()
    }

    /// Like [`Pipeline::run`], checking `cancel` between packets. A cancelled
    /// run is not flushed.
    pub fn run_until_cancelled(mut self, cancel: &CancellationToken) -> Result<PipelineStats> {
        loop {
            if cancel.is_cancelled() {
                log::info!(
                    "pipeline cancelled after {} packets",
                    self.stats.packets_read
                );
                return Err(Error::Cancelled);
            }
            if !self.step()? {
                return self.finish();
            }
        }
    }

    /// Reads and processes one input packet. Returns false at end of input.
    pub fn step(&mut self) -> Result<bool> {
        let packet = match self.input.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(false),
            Err(err) => return Err(self.abort("demuxer", err)),
        };
        self.stats.packets_read += 1;

        if packet.index() != self.decoder.stream_index() {
            self.stats.packets_skipped += 1;
            return Ok(true);
        }
        if packet.is_discontinuity() {
            log::debug!("timestamp discontinuity at pts {:?}", packet.pts());
        }
        self.decode_packet(packet)?;
        Ok(true)
    }

    /// Drains decoder, encoder and filter, then seals the last segment and
    /// closes the outputs.
    pub fn finish(mut self) -> Result<PipelineStats> {
        self.flush_decoder()?;
        self.flush_encoder()?;
        self.flush_filter()?;

        if let Some(segment) = self.segmenter.flush() {
            self.emit_segment(segment)?;
        }
        if let Some(muxer) = self.muxer.as_mut() {
            if let Err(err) = muxer.finish() {
                return Err(self.abort("muxer", err));
            }
        }
        if let Some(consumer) = self.consumer.as_mut() {
            if let Err(err) = consumer.finish() {
                return Err(self.abort("segment consumer", err));
            }
        }

        let stats = self.stats;
        log::info!(
            "pipeline finished: {} packets in, {} frames encoded, {} segments, {} dropped",
            stats.packets_read,
            stats.frames_encoded,
            stats.segments,
            stats.frames_dropped_transfer + stats.frames_dropped_format
        );
        Ok(stats)
    }

    fn decode_packet(&mut self, packet: Packet) -> Result<()> {
        let mut pending = packet;
        let mut attempts = 0;
        loop {
            match self.decoder.submit(pending) {
                Ok(()) => break,
                Err(TrySubmitError::Busy(packet)) => {
                    pending = packet;
                    let produced = self.drain_decoder()?;
                    attempts = self.stall_check("decoder", attempts, produced)?;
                }
                Err(TrySubmitError::Failed(err)) => return Err(self.abort("decoder", err)),
            }
        }
        self.drain_decoder()?;
        Ok(())
    }

    fn drain_decoder(&mut self) -> Result<usize> {
        let mut produced = 0;
        loop {
            let frame = match self.decoder.retrieve() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(produced),
                Err(err) => return Err(self.abort("decoder", err)),
            };
            produced += 1;
            self.stats.frames_decoded += 1;
            self.process_frame(frame)?;
        }
    }

    fn flush_decoder(&mut self) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.decoder.submit_eof() {
                Ok(()) => break,
                Err(Error::Busy) => {
                    let produced = self.drain_decoder()?;
                    attempts = self.stall_check("decoder", attempts, produced)?;
                }
                Err(err) => return Err(self.abort("decoder", err)),
            }
        }
        self.drain_decoder()?;
        Ok(())
    }

    fn process_frame(&mut self, frame: Frame) -> Result<()> {
        let frame = match &self.transfer {
            Some(transfer) => match transfer.transfer(frame) {
                Ok(frame) => frame,
                Err(Error::TransferFailed(reason)) => {
                    self.stats.frames_dropped_transfer += 1;
                    log::warn!("dropping frame: {}", reason);
                    return Ok(());
                }
                Err(err) => return Err(self.abort("transfer", err)),
            },
            None => {
                let time_base = frame.time_base().unwrap_or(self.input_time_base);
                frame.with_time_base(Some(time_base))
            }
        };

        let frame = match &mut self.scaler {
            Some(scaler) if frame.format() != scaler.target() => match scaler.run(frame) {
                Ok(frame) => {
                    self.stats.frames_converted += 1;
                    frame
                }
                Err(err) => {
                    self.stats.frames_dropped_format += 1;
                    log::warn!("dropping frame: conversion failed: {}", err);
                    return Ok(());
                }
            },
            _ => frame,
        };

        self.encode_frame(frame)
    }

    fn encode_frame(&mut self, frame: Frame) -> Result<()> {
        let mut pending = frame;
        let mut attempts = 0;
        loop {
            match self.encoder.submit(pending) {
                Ok(()) => break,
                Err(TrySubmitError::Busy(frame)) => {
                    pending = frame;
                    let produced = self.drain_encoder()?;
                    attempts = self.stall_check("encoder", attempts, produced)?;
                }
                Err(TrySubmitError::Failed(Error::FormatMismatch { expected, actual })) => {
                    self.stats.frames_dropped_format += 1;
                    log::warn!("dropping {} frame, encoder takes {}", actual, expected);
                    return Ok(());
                }
                Err(TrySubmitError::Failed(err)) => return Err(self.abort("encoder", err)),
            }
        }
        self.stats.frames_encoded += 1;
        self.drain_encoder()?;
        Ok(())
    }

    fn drain_encoder(&mut self) -> Result<usize> {
        let mut produced = 0;
        loop {
            let packet = match self.encoder.retrieve() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(produced),
                Err(err) => return Err(self.abort("encoder", err)),
            };
            produced += 1;
            self.handle_encoded(Some(packet))?;
        }
    }

    fn flush_encoder(&mut self) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.encoder.submit_eof() {
                Ok(()) => break,
                Err(Error::Busy) => {
                    let produced = self.drain_encoder()?;
                    attempts = self.stall_check("encoder", attempts, produced)?;
                }
                Err(err) => return Err(self.abort("encoder", err)),
            }
        }
        self.drain_encoder()?;
        Ok(())
    }

    fn flush_filter(&mut self) -> Result<()> {
        if self.bitstream_filter.is_some() {
            self.handle_encoded(None)?;
        }
        Ok(())
    }

    /// Passes an encoded packet (or end of stream) through the bitstream
    /// filter, if any, and writes what comes out.
    fn handle_encoded(&mut self, packet: Option<Packet>) -> Result<()> {
        let packets = match self.bitstream_filter.as_deref_mut() {
            Some(filter) => match filter_packet(filter, packet) {
                Ok(packets) => packets,
                Err(err) => return Err(self.abort("bitstream filter", err)),
            },
            None => packet.into_iter().collect(),
        };
        for packet in packets {
            self.write_output(packet)?;
        }
        Ok(())
    }

    fn write_output(&mut self, mut packet: Packet) -> Result<()> {
        packet.set_stream_index(self.output_stream.index());
        packet.rescale_ts(self.output_stream.time_base());
        if self.dts_guard.apply(&mut packet) {
            self.stats.dts_corrections += 1;
            log::debug!("clamped non-monotonic dts at pts {:?}", packet.pts());
        }

        self.stats.last_pts = packet.pts().or(self.stats.last_pts);
        self.stats.packets_written += 1;
        self.stats.bytes_written += packet.size() as u64;

        if let Some(muxer) = self.muxer.as_mut() {
            if let Err(err) = muxer.write_packet(&packet) {
                return Err(self.abort("muxer", err));
            }
        }

        let duration = packet.duration_seconds().unwrap_or(self.frame_duration);
        if let Some(segment) = self.segmenter.absorb(packet, duration) {
            self.emit_segment(segment)?;
        }
        Ok(())
    }

    fn emit_segment(&mut self, segment: Segment) -> Result<()> {
        let entry = segment.manifest_entry();
        self.stats.segments += 1;
        if let Some(consumer) = self.consumer.as_mut() {
            if let Err(err) = consumer.on_segment(segment, &entry) {
                return Err(self.abort("segment consumer", err));
            }
        }
        if let Some(listener) = self.listener.as_mut() {
            listener(&entry);
        }
        Ok(())
    }

    /// Counts a drain that produced nothing; fails once the limit is hit.
    fn stall_check(&self, stage: &'static str, attempts: usize, produced: usize) -> Result<usize> {
        if produced > 0 {
            return Ok(0);
        }
        let attempts = attempts + 1;
        if attempts >= self.config.max_stall_attempts {
            return Err(self.abort(stage, Error::StalledPipeline { stage, attempts }));
        }
        Ok(attempts)
    }

    fn abort(&self, stage: &'static str, err: Error) -> Error {
        log::error!("pipeline aborted in {}: {}", stage, err);
        Error::Aborted {
            stage,
            last_pts: self.stats.last_pts,
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
