//! In-process `rawvideo` codec, a synthetic input and a host-memory device.
//!
//! These need no system libraries, so the whole pipeline can run (and be
//! tested) without FFmpeg. The codec passes pixel data through unchanged but
//! keeps the behaviour of a real one: a configurable output delay, `Busy`
//! when its queue is full, keyframes on a GOP and a stream header.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecRegistry, DecodeStep, EncodeStep};
use crate::encoder::EncoderSettings;
use crate::error::{Error, Result, TrySubmitError};
use crate::format::{MediaFormat, PixelFormat};
use crate::frame::{Frame, FrameData};
use crate::hw::{HwDevice, HwDeviceKind, HwFrameProvider};
use crate::input::Demuxer;
use crate::packet::Packet;
use crate::rational::{Rational, TimeBase};
use crate::stream::StreamDescriptor;
use crate::timestamp::rescale_ticks;

pub const RAW_CODEC: &str = "rawvideo";

pub fn register(registry: &mut CodecRegistry) {
    registry.register_decoder(RAW_CODEC, |stream| {
        Ok(Box::new(RawDecoder::new(stream, 0)?) as Box<dyn DecodeStep>)
    });
    registry.register_encoder(RAW_CODEC, || {
        Ok(Box::new(RawEncoder::new(0)) as Box<dyn EncodeStep>)
    });
}

pub struct RawDecoder {
    time_base: TimeBase,
    format: MediaFormat,
    width: u32,
    height: u32,
    channels: u16,
    delay: usize,
    queue: VecDeque<Packet>,
    eof: bool,
    device: Option<Arc<HwDevice>>,
}

impl RawDecoder {
    /// `delay` is the number of packets held back before the first frame
    /// comes out.
    pub fn new(stream: &StreamDescriptor, delay: usize) -> Result<Self> {
        let format = stream
            .format()
            .ok_or_else(|| Error::codec(format!("stream {} has no format", stream.index())))?;
        if format.is_hardware() {
            return Err(Error::codec(format!("cannot decode raw {format} data")));
        }
        Ok(Self {
            time_base: stream.time_base(),
            format,
            width: stream.width(),
            height: stream.height(),
            channels: stream.parameters().channels,
            delay,
            queue: VecDeque::with_capacity(delay + 1),
            eof: false,
            device: None,
        })
    }

    fn to_frame(&self, packet: Packet) -> Result<Frame> {
        let pts = packet.pts();
        let time_base = packet.time_base();
        let discontinuity = packet.is_discontinuity();
        let frame = match self.format {
            MediaFormat::Pixel(format) => {
                if let Some(expected) = format.frame_size(self.width, self.height) {
                    if packet.size() != expected {
                        return Err(Error::codec(format!(
                            "{} byte packet does not hold a {}x{} {} picture",
                            packet.size(),
                            self.width,
                            self.height,
                            format
                        )));
                    }
                }
                let data = packet.into_data();
                match &self.device {
                    Some(device) => {
                        Frame::hardware(device.upload(data, format)?, self.width, self.height)
                    }
                    None => Frame::video(data, format, self.width, self.height),
                }
            }
            MediaFormat::Sample(format) => {
                let frame_bytes = format.bytes_per_sample() * self.channels.max(1) as usize;
                let samples = packet.size() / frame_bytes;
                Frame::audio(packet.into_data(), format, samples)
            }
        };
        Ok(frame
            .with_pts(pts)
            .with_time_base(Some(time_base))
            .with_discontinuity(discontinuity))
    }
}

impl DecodeStep for RawDecoder {
    fn name(&self) -> &str {
        RAW_CODEC
    }

    fn time_base(&self) -> TimeBase {
        self.time_base
    }

    fn candidate_formats(&self) -> Vec<PixelFormat> {
        match self.format {
            MediaFormat::Pixel(format) => vec![PixelFormat::Opaque, format],
            MediaFormat::Sample(_) => Vec::new(),
        }
    }

    fn configure(
        &mut self,
        format: Option<PixelFormat>,
        device: Option<Arc<HwDevice>>,
    ) -> Result<()> {
        match format {
            Some(format) if format.is_hardware() => {
                let device = device
                    .ok_or_else(|| Error::codec(format!("{format} output needs a device")))?;
                log::info!("rawvideo decoder uploading to {} device", device.kind());
                self.device = Some(device);
            }
            Some(format) if MediaFormat::Pixel(format) != self.format => {
                return Err(Error::codec(format!(
                    "rawvideo cannot produce {format} from {}",
                    self.format
                )));
            }
            _ => self.device = None,
        }
        Ok(())
    }

    fn send_packet(&mut self, packet: Packet) -> std::result::Result<(), TrySubmitError<Packet>> {
        if self.eof {
            return Err(Error::codec("packet after end of stream").into());
        }
        if self.queue.len() > self.delay {
            return Err(TrySubmitError::Busy(packet));
        }
        self.queue.push_back(packet);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        self.eof = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        if self.queue.len() <= self.delay && !self.eof {
            return Ok(None);
        }
        match self.queue.pop_front() {
            Some(packet) => self.to_frame(packet).map(Some),
            None => Ok(None),
        }
    }
}

pub struct RawEncoder {
    delay: usize,
    settings: Option<EncoderSettings>,
    header: Option<Bytes>,
    queue: VecDeque<Frame>,
    eof: bool,
    encoded: u64,
}

impl RawEncoder {
    pub fn new(delay: usize) -> Self {
        Self {
            delay,
            settings: None,
            header: None,
            queue: VecDeque::with_capacity(delay + 1),
            eof: false,
            encoded: 0,
        }
    }

    fn encode(&mut self, frame: Frame, settings: &EncoderSettings) -> Result<Packet> {
        let pts = frame.pts();
        let discontinuity = frame.is_discontinuity();
        let data = match frame.into_data() {
            FrameData::Software(data) => data,
            FrameData::Hardware(_) => {
                return Err(Error::codec("rawvideo encodes software frames only"));
            }
        };

        let is_key = self.encoded % settings.gop_size as u64 == 0;
        self.encoded += 1;

        let data = match &self.header {
            Some(header) if is_key && !settings.global_header => {
                let mut buf = Vec::with_capacity(header.len() + data.len());
                buf.extend_from_slice(header);
                buf.extend_from_slice(&data);
                Bytes::from(buf)
            }
            _ => data,
        };

        let mut packet = Packet::new(data, settings.time_base)
            .with_pts(pts)
            .with_dts(pts)
            .with_key(is_key);
        packet.set_discontinuity(discontinuity);
        Ok(packet)
    }
}

impl EncodeStep for RawEncoder {
    fn name(&self) -> &str {
        RAW_CODEC
    }

    fn open(&mut self, settings: &EncoderSettings) -> Result<Option<Bytes>> {
        if settings.format.is_hardware() {
            return Err(Error::codec(format!(
                "rawvideo cannot take {} frames",
                settings.format
            )));
        }
        let header = Bytes::from(format!(
            "RAW1 {} {}x{} {}\n",
            settings.format, settings.width, settings.height, settings.frame_rate
        ));
        self.header = Some(header.clone());
        self.settings = Some(settings.clone());
        Ok(settings.global_header.then_some(header))
    }

    fn send_frame(&mut self, frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>> {
        if self.settings.is_none() {
            return Err(Error::codec("encoder not opened").into());
        }
        if self.eof {
            return Err(Error::codec("frame after end of stream").into());
        }
        if frame.is_hardware() {
            return Err(Error::codec("rawvideo encodes software frames only").into());
        }
        if self.queue.len() > self.delay {
            return Err(TrySubmitError::Busy(frame));
        }
        self.queue.push_back(frame);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        self.eof = true;
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        if self.queue.len() <= self.delay && !self.eof {
            return Ok(None);
        }
        let Some(frame) = self.queue.pop_front() else {
            return Ok(None);
        };
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| Error::codec("encoder not opened"))?;
        self.encode(frame, &settings).map(Some)
    }
}

/// Parameters of the synthetic input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestPattern {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_rate: Rational,
    pub frames: u64,
    pub keyframe_interval: u64,
    pub time_base: TimeBase,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            format: PixelFormat::Yuv420p,
            frame_rate: Rational::from_int(30),
            frames: 90,
            keyframe_interval: 30,
            time_base: TimeBase::MPEG_TS,
        }
    }
}

impl TestPattern {
    /// Enough frames to cover `seconds` at the pattern frame rate.
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.frames = (seconds * self.frame_rate.to_f64()).ceil().max(0.0) as u64;
        self
    }
}

/// Demuxer producing one `rawvideo` stream of flat-colour pictures.
pub struct TestPatternSource {
    pattern: TestPattern,
    streams: Vec<StreamDescriptor>,
    frame_size: usize,
    frame_time_base: TimeBase,
    next: u64,
}

impl TestPatternSource {
    pub fn new(pattern: TestPattern) -> Result<Self> {
        let frame_size = pattern
            .format
            .frame_size(pattern.width, pattern.height)
            .ok_or_else(|| Error::config(format!("{} has no byte layout", pattern.format)))?;
        if pattern.keyframe_interval == 0 {
            return Err(Error::config("keyframe interval must be at least 1"));
        }
        let frame_time_base = TimeBase::from_frame_rate(pattern.frame_rate)?;
        let stream = StreamDescriptor::video(
            0,
            RAW_CODEC,
            pattern.format,
            pattern.width,
            pattern.height,
            pattern.time_base,
        )
        .with_rate(pattern.frame_rate);

        Ok(Self {
            pattern,
            streams: vec![stream],
            frame_size,
            frame_time_base,
            next: 0,
        })
    }
}

impl Demuxer for TestPatternSource {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.next >= self.pattern.frames {
            return Ok(None);
        }
        let index = self.next as i64;
        self.next += 1;

        let time_base = self.pattern.time_base;
        let pts = rescale_ticks(index, self.frame_time_base, time_base);
        let end = rescale_ticks(index + 1, self.frame_time_base, time_base);
        let shade = (index % 256) as u8;

        Ok(Some(
            Packet::new(vec![shade; self.frame_size], time_base)
                .with_pts(Some(pts))
                .with_dts(Some(pts))
                .with_duration(Some(end - pts))
                .with_key(index as u64 % self.pattern.keyframe_interval == 0),
        ))
    }
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Option<Bytes>>,
    free: Vec<usize>,
    in_use: usize,
}

/// Surface storage shared by a loopback device and its observers.
#[derive(Debug, Default)]
pub struct SurfacePool {
    slots: Mutex<Slots>,
    capacity: Option<usize>,
}

impl SurfacePool {
    pub fn in_use(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).in_use
    }

    fn insert(&self, data: Bytes) -> Result<u64> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if self.capacity.is_some_and(|cap| slots.in_use >= cap) {
            return Err(Error::transfer("surface pool exhausted"));
        }
        let index = match slots.free.pop() {
            Some(index) => {
                slots.entries[index] = Some(data);
                index
            }
            None => {
                slots.entries.push(Some(data));
                slots.entries.len() - 1
            }
        };
        slots.in_use += 1;
        Ok(index as u64)
    }

    fn get(&self, handle: u64) -> Option<Bytes> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entries.get(handle as usize).and_then(Clone::clone)
    }

    fn remove(&self, handle: u64) {
        let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slots = &mut *guard;
        let index = handle as usize;
        if let Some(entry) = slots.entries.get_mut(index) {
            if entry.take().is_some() {
                slots.free.push(index);
                slots.in_use -= 1;
            }
        }
    }
}

/// Hardware device emulated in host memory. Surfaces keep the layout they
/// were uploaded in and can only be downloaded into that layout.
pub struct LoopbackDevice {
    format: PixelFormat,
    pool: Arc<SurfacePool>,
}

impl LoopbackDevice {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            pool: Arc::new(SurfacePool::default()),
        }
    }

    /// At most `capacity` surfaces alive at once.
    pub fn with_capacity(format: PixelFormat, capacity: usize) -> Self {
        Self {
            format,
            pool: Arc::new(SurfacePool {
                slots: Mutex::default(),
                capacity: Some(capacity),
            }),
        }
    }

    pub fn pool_handle(&self) -> Arc<SurfacePool> {
        Arc::clone(&self.pool)
    }

    pub fn into_device(self) -> Arc<HwDevice> {
        HwDevice::new(HwDeviceKind::Loopback, self)
    }
}

impl HwFrameProvider for LoopbackDevice {
    fn transfer_formats(&self) -> Vec<PixelFormat> {
        vec![self.format]
    }

    fn upload(&self, data: Bytes, format: PixelFormat) -> Result<u64> {
        if format != self.format {
            return Err(Error::transfer(format!(
                "loopback device stores {}, got {}",
                self.format, format
            )));
        }
        self.pool.insert(data)
    }

    fn transfer_frame(&self, handle: u64, format: PixelFormat) -> Result<Bytes> {
        if format != self.format {
            return Err(Error::transfer(format!(
                "loopback device cannot download {} into {}",
                self.format, format
            )));
        }
        self.pool
            .get(handle)
            .ok_or_else(|| Error::transfer(format!("unknown surface {handle}")))
    }

    fn release(&self, handle: u64) {
        self.pool.remove(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamDescriptor {
        StreamDescriptor::video(0, RAW_CODEC, PixelFormat::Yuv420p, 4, 4, TimeBase::MPEG_TS)
    }

    fn packet(pts: i64) -> Packet {
        Packet::new(vec![0u8; 24], TimeBase::MPEG_TS).with_pts(Some(pts))
    }

    #[test]
    fn decoder_holds_back_delay_packets() -> anyhow::Result<()> {
        let mut decoder = RawDecoder::new(&stream(), 1)?;
        decoder.send_packet(packet(0))?;
        assert!(decoder.receive_frame()?.is_none());
        decoder.send_packet(packet(3000))?;
        assert!(decoder.send_packet(packet(6000)).unwrap_err().is_busy());

        assert_eq!(decoder.receive_frame()?.and_then(|f| f.pts()), Some(0));
        decoder.send_eof()?;
        assert_eq!(decoder.receive_frame()?.and_then(|f| f.pts()), Some(3000));
        assert!(decoder.receive_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn decoder_rejects_short_packets() -> anyhow::Result<()> {
        let mut decoder = RawDecoder::new(&stream(), 0)?;
        decoder.send_packet(Packet::new(vec![0u8; 5], TimeBase::MPEG_TS))?;
        assert!(matches!(decoder.receive_frame(), Err(Error::Codec(_))));
        Ok(())
    }

    #[test]
    fn encoder_marks_keyframes_on_gop() -> anyhow::Result<()> {
        let mut encoder = RawEncoder::new(0);
        let settings = EncoderSettings {
            gop_size: 2,
            global_header: false,
            ..EncoderSettings::default()
        };
        assert!(encoder.open(&settings)?.is_none());

        let mut keys = Vec::new();
        for i in 0..4 {
            encoder.send_frame(
                Frame::video(Bytes::from_static(&[1; 24]), PixelFormat::Yuv420p, 4, 4)
                    .with_pts(Some(i)),
            )?;
            let packet = encoder.receive_packet()?.expect("one packet per frame");
            keys.push(packet.is_key());
            if packet.is_key() {
                assert!(packet.data().starts_with(b"RAW1"));
            } else {
                assert_eq!(packet.size(), 24);
            }
        }
        assert_eq!(keys, vec![true, false, true, false]);
        Ok(())
    }

    #[test]
    fn test_pattern_timing() -> anyhow::Result<()> {
        let mut source = TestPatternSource::new(TestPattern {
            frames: 31,
            ..TestPattern::default()
        })?;
        let mut count = 0;
        let mut last = None;
        while let Some(packet) = source.read_packet()? {
            assert_eq!(packet.size(), 3456);
            assert_eq!(packet.is_key(), count % 30 == 0);
            assert_eq!(packet.duration(), Some(3000));
            last = packet.pts();
            count += 1;
        }
        assert_eq!(count, 31);
        assert_eq!(last, Some(90_000));
        Ok(())
    }

    #[test]
    fn loopback_pool_reuses_slots() -> anyhow::Result<()> {
        let loopback = LoopbackDevice::with_capacity(PixelFormat::Nv12, 1);
        let pool = loopback.pool_handle();
        let device = loopback.into_device();

        let first = device.upload(Bytes::from_static(b"a"), PixelFormat::Nv12)?;
        assert!(device.upload(Bytes::from_static(b"b"), PixelFormat::Nv12).is_err());
        assert!(device.upload(Bytes::from_static(b"c"), PixelFormat::Yuv420p).is_err());
        drop(first);
        assert_eq!(pool.in_use(), 0);

        let second = device.upload(Bytes::from_static(b"d"), PixelFormat::Nv12)?;
        assert_eq!(second.handle(), 0);
        assert_eq!(second.download(PixelFormat::Nv12)?, Bytes::from_static(b"d"));
        Ok(())
    }
}
