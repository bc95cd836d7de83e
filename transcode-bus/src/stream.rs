use std::sync::OnceLock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::encoder::EncoderSettings;
use crate::error::{Error, Result};
use crate::format::{MediaFormat, PixelFormat, SampleFormat};
use crate::rational::{Rational, TimeBase};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Other,
}

#[derive(Debug, Clone)]
pub struct CodecParameters {
    pub codec: String,
    pub media_type: MediaType,
    pub format: Option<MediaFormat>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: Option<u64>,
    pub global_header: bool,
    extra_data: OnceLock<Bytes>,
}

impl CodecParameters {
    pub fn new(codec: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            codec: codec.into(),
            media_type,
            format: None,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            bit_rate: None,
            global_header: false,
            extra_data: OnceLock::new(),
        }
    }

    pub fn extra_data(&self) -> Option<&Bytes> {
        self.extra_data.get()
    }
}

/// Description of one elementary stream of a container.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    index: usize,
    parameters: CodecParameters,
    time_base: TimeBase,
    rate: Option<Rational>,
}

impl StreamDescriptor {
    pub fn new(index: usize, parameters: CodecParameters, time_base: TimeBase) -> Self {
        Self {
            index,
            parameters,
            time_base,
            rate: None,
        }
    }

    pub fn video(
        index: usize,
        codec: impl Into<String>,
        format: PixelFormat,
        width: u32,
        height: u32,
        time_base: TimeBase,
    ) -> Self {
        let mut parameters = CodecParameters::new(codec, MediaType::Video);
        parameters.format = Some(MediaFormat::Pixel(format));
        parameters.width = width;
        parameters.height = height;
        Self::new(index, parameters, time_base)
    }

    pub fn audio(
        index: usize,
        codec: impl Into<String>,
        format: SampleFormat,
        sample_rate: u32,
        channels: u16,
        time_base: TimeBase,
    ) -> Self {
        let mut parameters = CodecParameters::new(codec, MediaType::Audio);
        parameters.format = Some(MediaFormat::Sample(format));
        parameters.sample_rate = sample_rate;
        parameters.channels = channels;
        Self::new(index, parameters, time_base)
    }

    pub fn with_rate(mut self, rate: Rational) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_time_base(mut self, time_base: TimeBase) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn codec(&self) -> &str {
        &self.parameters.codec
    }

    pub fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn rate(&self) -> Option<Rational> {
        self.rate
    }

    pub fn media_type(&self) -> MediaType {
        self.parameters.media_type
    }

    pub fn is_video(&self) -> bool {
        self.parameters.media_type == MediaType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.parameters.media_type == MediaType::Audio
    }

    pub fn format(&self) -> Option<MediaFormat> {
        self.parameters.format
    }

    pub fn width(&self) -> u32 {
        self.parameters.width
    }

    pub fn height(&self) -> u32 {
        self.parameters.height
    }

    pub fn fps(&self) -> f64 {
        self.rate.map(|r| r.to_f64()).unwrap_or_default()
    }

    pub fn extra_data(&self) -> Option<&Bytes> {
        self.parameters.extra_data()
    }

    /// Extradata can be set once, before the stream is handed to a muxer.
    pub fn set_extra_data(&self, data: Bytes) -> Result<()> {
        self.parameters
            .extra_data
            .set(data)
            .map_err(|_| Error::InvalidState {
                stage: "stream",
                op: "set_extra_data",
                state: "extradata already set",
            })
    }

    /// Output stream for packets produced by an encoder opened with
    /// `settings`: input geometry, encoder codec, format and time base.
    pub fn for_encoder_output(
        input: &StreamDescriptor,
        settings: &EncoderSettings,
        index: usize,
    ) -> Self {
        let mut parameters = CodecParameters::new(settings.codec.clone(), input.media_type());
        parameters.format = Some(settings.format);
        parameters.width = if settings.width > 0 {
            settings.width
        } else {
            input.width()
        };
        parameters.height = if settings.height > 0 {
            settings.height
        } else {
            input.height()
        };
        parameters.sample_rate = input.parameters.sample_rate;
        parameters.channels = input.parameters.channels;
        parameters.bit_rate = settings.bit_rate;
        parameters.global_header = settings.global_header;

        Self {
            index,
            parameters,
            time_base: settings.time_base,
            rate: Some(settings.frame_rate),
        }
    }
}

/// Picks the first stream of `media_type`.
pub fn best_stream(streams: &[StreamDescriptor], media_type: MediaType) -> Option<&StreamDescriptor> {
    streams.iter().find(|s| s.media_type() == media_type)
}
