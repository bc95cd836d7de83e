//! Demuxer and codecs backed by the system FFmpeg libraries.
//!
//! Frames cross the boundary as tightly packed planes in the layouts
//! [`PixelFormat`] knows. Hardware frames are not produced here; decoding is
//! always into host memory.

use std::collections::VecDeque;
use std::path::Path;

use bytes::Bytes;
use ffmpeg_next::{Dictionary, codec, format, media};

use crate::codec::{CodecRegistry, DecodeStep, EncodeStep};
use crate::encoder::EncoderSettings;
use crate::error::{Error, Result, TrySubmitError};
use crate::format::{MediaFormat, PixelFormat, SampleFormat};
use crate::frame::{Frame, FrameData};
use crate::input::Demuxer;
use crate::packet::Packet;
use crate::rational::{Rational, TimeBase};
use crate::stream::{CodecParameters, MediaType, StreamDescriptor};

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> Result<()> {
    ffmpeg_next::init().map_err(|e| Error::codec(format!("ffmpeg init: {e}")))
}

/// Encoders registered by [`register`], keyed by the name the registry uses.
const ENCODERS: &[(&str, &str)] = &[
    ("h264", "libx264"),
    ("hevc", "libx265"),
    ("libx264", "libx264"),
    ("libx265", "libx265"),
    ("h264_videotoolbox", "h264_videotoolbox"),
    ("hevc_videotoolbox", "hevc_videotoolbox"),
    ("h264_nvenc", "h264_nvenc"),
    ("hevc_nvenc", "hevc_nvenc"),
    ("h264_vaapi", "h264_vaapi"),
    ("hevc_vaapi", "hevc_vaapi"),
    ("h264_qsv", "h264_qsv"),
    ("hevc_qsv", "hevc_qsv"),
    ("mjpeg", "mjpeg"),
];

/// Adds every FFmpeg video encoder this build of FFmpeg provides.
pub fn register(registry: &mut CodecRegistry) {
    for &(name, ffmpeg_name) in ENCODERS {
        if ffmpeg_next::encoder::find_by_name(ffmpeg_name).is_none() {
            continue;
        }
        registry.register_encoder(name, move || {
            Ok(Box::new(FfmpegEncoder::new(ffmpeg_name)) as Box<dyn EncodeStep>)
        });
    }
}

fn ff(err: ffmpeg_next::Error) -> Error {
    Error::codec(err.to_string())
}

fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

fn to_time_base(rational: ffmpeg_next::Rational) -> Result<TimeBase> {
    TimeBase::new(rational.numerator() as i64, rational.denominator() as i64)
}

fn to_ffmpeg(rational: Rational) -> ffmpeg_next::Rational {
    ffmpeg_next::Rational::new(rational.num() as i32, rational.den() as i32)
}

pub fn pixel_from_ffmpeg(pixel: format::Pixel) -> Option<PixelFormat> {
    let format = match pixel {
        format::Pixel::YUV420P => PixelFormat::Yuv420p,
        format::Pixel::NV12 => PixelFormat::Nv12,
        format::Pixel::YUV422P => PixelFormat::Yuv422p,
        format::Pixel::YUV444P => PixelFormat::Yuv444p,
        format::Pixel::YUV420P10LE => PixelFormat::Yuv420p10,
        format::Pixel::RGB24 => PixelFormat::Rgb24,
        format::Pixel::BGR24 => PixelFormat::Bgr24,
        format::Pixel::RGBA => PixelFormat::Rgba,
        format::Pixel::BGRA => PixelFormat::Bgra,
        format::Pixel::VIDEOTOOLBOX => PixelFormat::VideoToolbox,
        format::Pixel::CUDA => PixelFormat::Cuda,
        format::Pixel::VAAPI => PixelFormat::Vaapi,
        format::Pixel::QSV => PixelFormat::Qsv,
        _ => return None,
    };
    Some(format)
}

pub fn pixel_to_ffmpeg(pixel: PixelFormat) -> Option<format::Pixel> {
    let format = match pixel {
        PixelFormat::Yuv420p => format::Pixel::YUV420P,
        PixelFormat::Nv12 => format::Pixel::NV12,
        PixelFormat::Yuv422p => format::Pixel::YUV422P,
        PixelFormat::Yuv444p => format::Pixel::YUV444P,
        PixelFormat::Yuv420p10 => format::Pixel::YUV420P10LE,
        PixelFormat::Rgb24 => format::Pixel::RGB24,
        PixelFormat::Bgr24 => format::Pixel::BGR24,
        PixelFormat::Rgba => format::Pixel::RGBA,
        PixelFormat::Bgra => format::Pixel::BGRA,
        PixelFormat::VideoToolbox => format::Pixel::VIDEOTOOLBOX,
        PixelFormat::Cuda => format::Pixel::CUDA,
        PixelFormat::Vaapi => format::Pixel::VAAPI,
        PixelFormat::Qsv => format::Pixel::QSV,
        PixelFormat::Opaque => return None,
    };
    Some(format)
}

fn sample_from_ffmpeg(sample: format::Sample) -> Option<SampleFormat> {
    use format::sample::Type;

    let format = match sample {
        format::Sample::U8(Type::Packed) => SampleFormat::U8,
        format::Sample::I16(Type::Packed) => SampleFormat::S16,
        format::Sample::I32(Type::Packed) => SampleFormat::S32,
        format::Sample::F32(Type::Packed) => SampleFormat::F32,
        format::Sample::F64(Type::Packed) => SampleFormat::F64,
        format::Sample::I16(Type::Planar) => SampleFormat::S16p,
        format::Sample::F32(Type::Planar) => SampleFormat::F32p,
        _ => return None,
    };
    Some(format)
}

/// `(row bytes, rows)` of each plane of a packed picture.
fn plane_layout(format: PixelFormat, width: u32, height: u32) -> Option<Vec<(usize, usize)>> {
    let (w, h) = (width as usize, height as usize);
    let planes = match format {
        PixelFormat::Yuv420p => vec![(w, h), (w / 2, h / 2), (w / 2, h / 2)],
        PixelFormat::Nv12 => vec![(w, h), (w, h / 2)],
        PixelFormat::Yuv420p10 => vec![(w * 2, h), (w, h / 2), (w, h / 2)],
        PixelFormat::Yuv422p => vec![(w, h), (w / 2, h), (w / 2, h)],
        PixelFormat::Yuv444p => vec![(w, h); 3],
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => vec![(w * 3, h)],
        PixelFormat::Rgba | PixelFormat::Bgra => vec![(w * 4, h)],
        _ => return None,
    };
    Some(planes)
}

fn read_picture(frame: &ffmpeg_next::frame::Video, format: PixelFormat) -> Result<Bytes> {
    let layout = plane_layout(format, frame.width(), frame.height())
        .ok_or_else(|| Error::codec(format!("cannot read {format} pictures")))?;
    let mut out = Vec::with_capacity(layout.iter().map(|(row, rows)| row * rows).sum());
    for (plane, (row_bytes, rows)) in layout.into_iter().enumerate() {
        let stride = frame.stride(plane);
        let data = frame.data(plane);
        for row in 0..rows {
            let start = row * stride;
            out.extend_from_slice(&data[start..start + row_bytes]);
        }
    }
    Ok(Bytes::from(out))
}

fn write_picture(data: &[u8], format: PixelFormat, frame: &mut ffmpeg_next::frame::Video) -> Result<()> {
    let layout = plane_layout(format, frame.width(), frame.height())
        .ok_or_else(|| Error::codec(format!("cannot write {format} pictures")))?;
    let mut offset = 0;
    for (plane, (row_bytes, rows)) in layout.into_iter().enumerate() {
        let stride = frame.stride(plane);
        let dest = frame.data_mut(plane);
        for row in 0..rows {
            let src = data
                .get(offset..offset + row_bytes)
                .ok_or_else(|| Error::codec("frame data shorter than its picture"))?;
            dest[row * stride..row * stride + row_bytes].copy_from_slice(src);
            offset += row_bytes;
        }
    }
    Ok(())
}

fn extra_data(parameters: &codec::Parameters) -> Option<Bytes> {
    // SAFETY: extradata is owned by the parameters and lives as long as they do.
    unsafe {
        let raw = parameters.as_ptr();
        if (*raw).extradata.is_null() || (*raw).extradata_size <= 0 {
            return None;
        }
        Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
            (*raw).extradata,
            (*raw).extradata_size as usize,
        )))
    }
}

fn describe(stream: &format::stream::Stream) -> Result<StreamDescriptor> {
    let parameters = stream.parameters();
    let time_base = to_time_base(stream.time_base())?;
    let codec_name = parameters.id().name();

    let descriptor = match parameters.medium() {
        media::Type::Video => {
            let decoder = codec::Context::from_parameters(parameters.clone())
                .and_then(|ctx| ctx.decoder().video())
                .map_err(ff)?;
            let mut params = CodecParameters::new(codec_name, MediaType::Video);
            params.format = pixel_from_ffmpeg(decoder.format()).map(MediaFormat::Pixel);
            params.width = decoder.width();
            params.height = decoder.height();
            let mut descriptor = StreamDescriptor::new(stream.index(), params, time_base);
            let rate = stream.avg_frame_rate();
            if rate.numerator() > 0 && rate.denominator() > 0 {
                descriptor =
                    descriptor.with_rate(Rational::new(rate.numerator() as i64, rate.denominator() as i64)?);
            }
            descriptor
        }
        media::Type::Audio => {
            let decoder = codec::Context::from_parameters(parameters.clone())
                .and_then(|ctx| ctx.decoder().audio())
                .map_err(ff)?;
            let mut params = CodecParameters::new(codec_name, MediaType::Audio);
            params.format = sample_from_ffmpeg(decoder.format()).map(MediaFormat::Sample);
            params.sample_rate = decoder.rate();
            params.channels = decoder.ch_layout().channels() as u16;
            StreamDescriptor::new(stream.index(), params, time_base)
        }
        _ => StreamDescriptor::new(
            stream.index(),
            CodecParameters::new(codec_name, MediaType::Other),
            time_base,
        ),
    };

    if let Some(data) = extra_data(&parameters) {
        descriptor.set_extra_data(data)?;
    }
    Ok(descriptor)
}

pub struct FfmpegInput {
    inner: format::context::Input,
    streams: Vec<StreamDescriptor>,
}

impl FfmpegInput {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = format::input(&path).map_err(|e| {
            Error::codec(format!("cannot open {}: {}", path.display(), e))
        })?;

        let mut streams = Vec::new();
        for stream in inner.streams() {
            let descriptor = describe(&stream)?;
            log::info!(
                "input stream {}: {} {:?} time base {}",
                descriptor.index(),
                descriptor.codec(),
                descriptor.media_type(),
                descriptor.time_base()
            );
            streams.push(descriptor);
        }

        Ok(Self { inner, streams })
    }

    /// Software decoder for one of this input's video streams.
    pub fn decoder(&self, stream_index: usize) -> Result<FfmpegDecoder> {
        let stream = self
            .inner
            .stream(stream_index)
            .ok_or_else(|| Error::config(format!("input has no stream {stream_index}")))?;
        FfmpegDecoder::new(&stream)
    }
}

impl Demuxer for FfmpegInput {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut packet = ffmpeg_next::Packet::empty();
        match packet.read(&mut self.inner) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(err) => return Err(ff(err)),
        }

        let index = packet.stream();
        let time_base = self
            .stream(index)
            .map(StreamDescriptor::time_base)
            .ok_or_else(|| Error::StreamMismatch {
                expected: self.streams.len(),
                actual: index,
            })?;
        let duration = packet.duration();
        Ok(Some(
            Packet::new(Bytes::copy_from_slice(packet.data().unwrap_or_default()), time_base)
                .with_pts(packet.pts())
                .with_dts(packet.dts())
                .with_duration((duration > 0).then_some(duration))
                .with_stream_index(index)
                .with_key(packet.is_key()),
        ))
    }
}

/// Pts of inputs flagged as discontinuities, waiting for the codec output
/// that carries them. A mark without a pts goes to the next output.
#[derive(Debug, Default)]
struct DiscontinuityMarks {
    pending: VecDeque<Option<i64>>,
}

impl DiscontinuityMarks {
    fn mark(&mut self, pts: Option<i64>) {
        self.pending.push_back(pts);
    }

    fn take(&mut self, pts: Option<i64>) -> bool {
        match self.pending.iter().position(|p| p.is_none() || *p == pts) {
            Some(i) => {
                self.pending.remove(i);
                true
            }
            None => false,
        }
    }
}

pub struct FfmpegDecoder {
    name: String,
    inner: codec::decoder::Video,
    time_base: TimeBase,
    discontinuities: DiscontinuityMarks,
}

impl FfmpegDecoder {
    fn new(stream: &format::stream::Stream) -> Result<Self> {
        let stream_time_base = to_time_base(stream.time_base())?;
        let mut ctx = codec::Context::from_parameters(stream.parameters()).map_err(ff)?;
        // SAFETY: the context is exclusively owned and not yet opened.
        unsafe {
            (*ctx.as_mut_ptr()).time_base = stream.time_base().into();
        }
        let inner = ctx.decoder().video().map_err(ff)?;
        if inner.format() == format::Pixel::None || inner.width() == 0 || inner.height() == 0 {
            return Err(Error::codec("missing codec parameters"));
        }
        let time_base = to_time_base(inner.time_base()).unwrap_or(stream_time_base);
        Ok(Self {
            name: stream.parameters().id().name().to_string(),
            inner,
            time_base,
            discontinuities: DiscontinuityMarks::default(),
        })
    }
}

impl DecodeStep for FfmpegDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn time_base(&self) -> TimeBase {
        self.time_base
    }

    fn candidate_formats(&self) -> Vec<PixelFormat> {
        pixel_from_ffmpeg(self.inner.format()).into_iter().collect()
    }

    fn send_packet(&mut self, packet: Packet) -> std::result::Result<(), TrySubmitError<Packet>> {
        let mut av = ffmpeg_next::Packet::copy(packet.data());
        av.set_pts(packet.pts());
        av.set_dts(packet.dts());
        av.set_duration(packet.duration().unwrap_or(0));
        if packet.is_key() {
            av.set_flags(codec::packet::Flags::KEY);
        }
        match self.inner.send_packet(&av) {
            Ok(()) => {
                if packet.is_discontinuity() {
                    self.discontinuities.mark(packet.pts());
                }
                Ok(())
            }
            Err(err) if is_again(&err) => Err(TrySubmitError::Busy(packet)),
            Err(err) => Err(ff(err).into()),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.inner.send_eof().map_err(ff)
    }

    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        let mut av = ffmpeg_next::frame::Video::empty();
        match self.inner.receive_frame(&mut av) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(err) if is_again(&err) => return Ok(None),
            Err(err) => return Err(ff(err)),
        }
        let format = pixel_from_ffmpeg(av.format())
            .ok_or_else(|| Error::codec(format!("unsupported pixel format {:?}", av.format())))?;
        let data = read_picture(&av, format)?;
        let pts = av.timestamp().or(av.pts());
        Ok(Some(
            Frame::video(data, format, av.width(), av.height())
                .with_pts(pts)
                .with_time_base(Some(self.time_base))
                .with_discontinuity(self.discontinuities.take(pts)),
        ))
    }
}

/// Video encoder looked up by its FFmpeg name, e.g. `libx264`.
pub struct FfmpegEncoder {
    name: String,
    inner: Option<codec::encoder::Video>,
    format: PixelFormat,
    time_base: TimeBase,
    discontinuities: DiscontinuityMarks,
}

impl FfmpegEncoder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: None,
            format: PixelFormat::Yuv420p,
            time_base: TimeBase::MPEG_TS,
            discontinuities: DiscontinuityMarks::default(),
        }
    }

    fn encoder(&mut self) -> Result<&mut codec::encoder::Video> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::codec(format!("{} not opened", self.name)))
    }
}

impl EncodeStep for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, settings: &EncoderSettings) -> Result<Option<Bytes>> {
        let format = settings
            .format
            .pixel()
            .ok_or_else(|| Error::codec(format!("{} encodes video only", self.name)))?;
        let av_format = pixel_to_ffmpeg(format)
            .ok_or_else(|| Error::codec(format!("{format} has no FFmpeg equivalent")))?;
        let codec = ffmpeg_next::encoder::find_by_name(&self.name)
            .ok_or_else(|| Error::CodecNotFound(self.name.clone()))?;

        let mut encoder = codec::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(ff)?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(av_format);
        encoder.set_frame_rate(Some(to_ffmpeg(settings.frame_rate)));
        encoder.set_time_base(to_ffmpeg(settings.time_base.as_rational()));
        encoder.set_gop(settings.gop_size);
        if let Some(bit_rate) = settings.bit_rate {
            encoder.set_bit_rate(bit_rate as usize);
        }
        if settings.global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        if self.name == "libx264" || self.name == "libx265" {
            opts.set("preset", "ultrafast");
            opts.set("tune", "zerolatency");
            if let Some(quality) = settings.quality {
                opts.set("crf", &quality.to_string());
            }
        }
        let encoder = encoder.open_with(opts).map_err(ff)?;

        // SAFETY: reading fields of the opened context we own.
        let (time_base, extra) = unsafe {
            let raw = encoder.0.as_ptr();
            let extra = if (*raw).extradata.is_null() || (*raw).extradata_size <= 0 {
                None
            } else {
                Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
                    (*raw).extradata,
                    (*raw).extradata_size as usize,
                )))
            };
            (ffmpeg_next::Rational::from((*raw).time_base), extra)
        };
        self.time_base = to_time_base(time_base).unwrap_or(settings.time_base);
        self.format = format;
        self.inner = Some(encoder);
        Ok(extra)
    }

    fn send_frame(&mut self, frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>> {
        let format = self.format;
        let Some(av_format) = pixel_to_ffmpeg(format) else {
            return Err(Error::codec(format!("{format} has no FFmpeg equivalent")).into());
        };
        let data = match frame.data() {
            FrameData::Software(data) => data.clone(),
            FrameData::Hardware(_) => {
                return Err(Error::codec("hardware frames must be transferred first").into());
            }
        };

        let mut av = ffmpeg_next::frame::Video::new(av_format, frame.width(), frame.height());
        write_picture(&data, format, &mut av)?;
        av.set_pts(frame.pts());

        let encoder = self.encoder()?;
        match encoder.send_frame(&av) {
            Ok(()) => {
                if frame.is_discontinuity() {
                    self.discontinuities.mark(frame.pts());
                }
                Ok(())
            }
            Err(err) if is_again(&err) => Err(TrySubmitError::Busy(frame)),
            Err(err) => Err(ff(err).into()),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.encoder()?.send_eof().map_err(ff)
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        let time_base = self.time_base;
        let mut av = ffmpeg_next::Packet::empty();
        match self.encoder()?.receive_packet(&mut av) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(err) if is_again(&err) => return Ok(None),
            Err(err) => return Err(ff(err)),
        }
        let duration = av.duration();
        let discontinuity = self.discontinuities.take(av.pts());
        Ok(Some(
            Packet::new(Bytes::copy_from_slice(av.data().unwrap_or_default()), time_base)
                .with_pts(av.pts())
                .with_dts(av.dts())
                .with_duration((duration > 0).then_some(duration))
                .with_key(av.is_key())
                .with_discontinuity(discontinuity),
        ))
    }
}
