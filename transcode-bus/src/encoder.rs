use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::EncodeStep;
use crate::decoder::EngineState;
use crate::error::{Error, Result, TrySubmitError};
use crate::format::{MediaFormat, PixelFormat};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::rational::{Rational, TimeBase};
use crate::stream::StreamDescriptor;
use crate::timestamp::{rescale, rescale_ticks};

/// How frame timestamps are assigned on the way into the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtsMode {
    /// Keep the decoded pts, converted into the encoder time base. Frames
    /// without one are numbered by their position.
    #[default]
    Source,
    /// Number every frame by its position, one frame duration apart.
    FrameIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Encoder name looked up in the codec registry.
    pub codec: String,
    /// Format the encoder accepts; frames in any other format are refused.
    pub format: MediaFormat,
    /// 0 keeps the input width.
    pub width: u32,
    /// 0 keeps the input height.
    pub height: u32,
    pub time_base: TimeBase,
    pub frame_rate: Rational,
    /// Frames between forced keyframes.
    pub gop_size: u32,
    pub bit_rate: Option<u64>,
    /// Constant-quality target, for encoders that support one.
    pub quality: Option<u32>,
    /// Put codec headers in the stream extradata instead of every keyframe.
    pub global_header: bool,
    pub pts_mode: PtsMode,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "rawvideo".to_string(),
            format: MediaFormat::Pixel(PixelFormat::Yuv420p),
            width: 0,
            height: 0,
            time_base: TimeBase::MPEG_TS,
            frame_rate: Rational::from_int(30),
            gop_size: 30,
            bit_rate: None,
            quality: None,
            global_header: true,
            pts_mode: PtsMode::Source,
        }
    }
}

impl EncoderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.codec.is_empty() {
            return Err(Error::config("encoder codec is empty"));
        }
        if !self.frame_rate.is_positive() {
            return Err(Error::config(format!("frame rate {} is not positive", self.frame_rate)));
        }
        if self.gop_size == 0 {
            return Err(Error::config("gop size must be at least 1"));
        }
        Ok(())
    }

    /// One frame in seconds.
    pub fn frame_duration(&self) -> Rational {
        self.frame_rate.recip().unwrap_or(Rational::ZERO)
    }
}

pub struct Encoder {
    inner: Box<dyn EncodeStep>,
    settings: EncoderSettings,
    frame_time_base: TimeBase,
    state: EngineState,
    awaiting_retrieve: bool,
    frame_index: i64,
    extra_data: Option<Bytes>,
}

impl Encoder {
    pub fn new(mut inner: Box<dyn EncodeStep>, settings: EncoderSettings) -> Result<Self> {
        settings.validate()?;
        let frame_time_base = TimeBase::from_frame_rate(settings.frame_rate)?;
        let extra_data = inner.open(&settings)?;

        log::info!(
            "encoder {} opened: {} {} time base {} gop {}",
            inner.name(),
            settings.format,
            settings.frame_rate,
            settings.time_base,
            settings.gop_size
        );

        Ok(Self {
            inner,
            settings,
            frame_time_base,
            state: EngineState::AcceptingInput,
            awaiting_retrieve: false,
            frame_index: 0,
            extra_data,
        })
    }

    /// Offers one frame. The frame must already be in the encoder format.
    pub fn submit(&mut self, mut frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>> {
        if self.state != EngineState::AcceptingInput {
            return Err(self.invalid_state("submit").into());
        }
        if self.awaiting_retrieve {
            return Err(TrySubmitError::Busy(frame));
        }
        if frame.format() != self.settings.format {
            return Err(Error::FormatMismatch {
                expected: self.settings.format,
                actual: frame.format(),
            }
            .into());
        }

        let pts = match (self.settings.pts_mode, frame.pts()) {
            (PtsMode::Source, Some(pts)) => {
                let from = frame.time_base().unwrap_or(self.settings.time_base);
                rescale_ticks(pts, from, self.settings.time_base)
            }
            _ => rescale_ticks(self.frame_index, self.frame_time_base, self.settings.time_base),
        };
        frame.set_pts(Some(pts));
        frame.set_time_base(Some(self.settings.time_base));

        self.inner.send_frame(frame)?;
        self.frame_index += 1;
        self.awaiting_retrieve = true;
        Ok(())
    }

    pub fn submit_eof(&mut self) -> Result<()> {
        if self.state != EngineState::AcceptingInput {
            return Err(self.invalid_state("submit_eof"));
        }
        self.inner.send_eof()?;
        self.state = EngineState::Draining;
        log::debug!("encoder {} draining after {} frames", self.inner.name(), self.frame_index);
        Ok(())
    }

    pub fn retrieve(&mut self) -> Result<Option<Packet>> {
        let packet = match self.state {
            EngineState::Exhausted => return Err(Error::Exhausted("encoder")),
            EngineState::AcceptingInput => {
                self.awaiting_retrieve = false;
                self.inner.receive_packet()?
            }
            EngineState::Draining => match self.inner.receive_packet()? {
                Some(packet) => Some(packet),
                None => {
                    self.state = EngineState::Exhausted;
                    log::debug!("encoder {} exhausted", self.inner.name());
                    None
                }
            },
        };
        Ok(packet.map(|packet| self.stamp(packet)))
    }

    fn stamp(&self, mut packet: Packet) -> Packet {
        packet.rescale_ts(self.settings.time_base);
        if packet.duration().is_none() {
            packet.set_duration(rescale(Some(1), self.frame_time_base, self.settings.time_base));
        }
        packet
    }

    fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            stage: "encoder",
            op,
            state: self.state.as_str(),
        }
    }

    /// Describes the encoded stream for a muxer, extradata included.
    pub fn output_stream(&self, input: &StreamDescriptor, index: usize) -> Result<StreamDescriptor> {
        let stream = StreamDescriptor::for_encoder_output(input, &self.settings, index);
        if let Some(extra_data) = &self.extra_data {
            stream.set_extra_data(extra_data.clone())?;
        }
        Ok(stream)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn is_hardware(&self) -> bool {
        self.inner.is_hardware()
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn format(&self) -> MediaFormat {
        self.settings.format
    }

    pub fn time_base(&self) -> TimeBase {
        self.settings.time_base
    }

    pub fn extra_data(&self) -> Option<&Bytes> {
        self.extra_data.as_ref()
    }

    pub fn frames_submitted(&self) -> i64 {
        self.frame_index
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
