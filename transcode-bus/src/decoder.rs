use std::fmt;
use std::sync::Arc;

use crate::codec::DecodeStep;
use crate::error::{Error, Result, TrySubmitError};
use crate::format::PixelFormat;
use crate::frame::Frame;
use crate::hw::HwDevice;
use crate::packet::Packet;
use crate::rational::TimeBase;
use crate::stream::StreamDescriptor;

/// Lifecycle shared by the decoder and encoder engines.
///
/// `AcceptingInput` until end of input is signalled, `Draining` while the
/// remaining output is retrieved, `Exhausted` once retrieval reports the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    AcceptingInput,
    Draining,
    Exhausted,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::AcceptingInput => "accepting-input",
            EngineState::Draining => "draining",
            EngineState::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the decoder output format from the offered candidates.
pub type FormatSelector = Arc<dyn Fn(&[PixelFormat]) -> Option<PixelFormat> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DecoderOptions {
    pub hw_device: Option<Arc<HwDevice>>,
    pub select_format: Option<FormatSelector>,
}

impl DecoderOptions {
    pub fn with_hw_device(mut self, device: Arc<HwDevice>) -> Self {
        self.hw_device = Some(device);
        self
    }

    pub fn with_format_selector<F>(mut self, select: F) -> Self
    where
        F: Fn(&[PixelFormat]) -> Option<PixelFormat> + Send + Sync + 'static,
    {
        self.select_format = Some(Arc::new(select));
        self
    }
}

impl fmt::Debug for DecoderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderOptions")
            .field("hw_device", &self.hw_device)
            .field("select_format", &self.select_format.is_some())
            .finish()
    }
}

/// Default selection: the first hardware candidate, else the first one.
pub fn prefer_hardware(candidates: &[PixelFormat]) -> Option<PixelFormat> {
    candidates
        .iter()
        .copied()
        .find(|format| format.is_hardware())
        .or_else(|| candidates.first().copied())
}

pub struct Decoder {
    stream: StreamDescriptor,
    inner: Box<dyn DecodeStep>,
    decoder_time_base: TimeBase,
    state: EngineState,
    awaiting_retrieve: bool,
    output_format: Option<PixelFormat>,
}

impl Decoder {
    pub fn new(
        stream: &StreamDescriptor,
        mut inner: Box<dyn DecodeStep>,
        options: DecoderOptions,
    ) -> Result<Self> {
        let output_format = if stream.is_video() {
            Self::negotiate(stream, inner.as_ref(), &options)
        } else {
            None
        };
        inner.configure(output_format, options.hw_device.clone())?;
        let decoder_time_base = inner.time_base();

        log::debug!(
            "decoder {} bound to stream {}, output format {:?}",
            inner.name(),
            stream.index(),
            output_format
        );

        Ok(Self {
            stream: stream.clone(),
            inner,
            decoder_time_base,
            state: EngineState::AcceptingInput,
            awaiting_retrieve: false,
            output_format,
        })
    }

    fn negotiate(
        stream: &StreamDescriptor,
        inner: &dyn DecodeStep,
        options: &DecoderOptions,
    ) -> Option<PixelFormat> {
        let candidates = inner.candidate_formats();
        if candidates.is_empty() {
            return stream.format().and_then(|f| f.pixel());
        }
        let selected = match &options.select_format {
            Some(select) => select(&candidates),
            None => prefer_hardware(&candidates),
        };
        match selected {
            Some(format) if format.is_hardware() && options.hw_device.is_none() => {
                log::warn!("{} selected without a device, using software output", format);
                candidates.iter().copied().find(|f| !f.is_hardware())
            }
            Some(format) if !candidates.contains(&format) => {
                log::warn!("selector returned {} which was not offered", format);
                candidates.first().copied()
            }
            other => other,
        }
    }

    /// Offers one packet. Returns it back with `Busy` until the output of
    /// the previous packet has been retrieved.
    pub fn submit(&mut self, mut packet: Packet) -> std::result::Result<(), TrySubmitError<Packet>> {
        if self.state != EngineState::AcceptingInput {
            return Err(self.invalid_state("submit").into());
        }
        if self.awaiting_retrieve {
            return Err(TrySubmitError::Busy(packet));
        }
        if packet.index() != self.stream.index() {
            return Err(Error::StreamMismatch {
                expected: self.stream.index(),
                actual: packet.index(),
            }
            .into());
        }

        packet.rescale_ts(self.decoder_time_base);
        self.inner.send_packet(packet)?;
        self.awaiting_retrieve = true;
        Ok(())
    }

    /// Signals end of input and switches to draining.
    pub fn submit_eof(&mut self) -> Result<()> {
        if self.state != EngineState::AcceptingInput {
            return Err(self.invalid_state("submit_eof"));
        }
        self.inner.send_eof()?;
        self.state = EngineState::Draining;
        log::debug!("decoder for stream {} draining", self.stream.index());
        Ok(())
    }

    /// Next decoded frame. `Ok(None)` while accepting input means more input
    /// is needed; while draining it means the decoder is exhausted.
    pub fn retrieve(&mut self) -> Result<Option<Frame>> {
        match self.state {
            EngineState::Exhausted => Err(Error::Exhausted("decoder")),
            EngineState::AcceptingInput => {
                self.awaiting_retrieve = false;
                self.inner.receive_frame()
            }
            EngineState::Draining => match self.inner.receive_frame()? {
                Some(frame) => Ok(Some(frame)),
                None => {
                    self.state = EngineState::Exhausted;
                    log::debug!("decoder for stream {} exhausted", self.stream.index());
                    Ok(None)
                }
            },
        }
    }

    fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            stage: "decoder",
            op,
            state: self.state.as_str(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn stream_index(&self) -> usize {
        self.stream.index()
    }

    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    pub fn time_base(&self) -> TimeBase {
        self.decoder_time_base
    }

    pub fn output_format(&self) -> Option<PixelFormat> {
        self.output_format
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
