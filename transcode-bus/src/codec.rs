//! Codec implementation seams and the registry that resolves them by name.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::decoder::{Decoder, DecoderOptions};
use crate::encoder::{Encoder, EncoderSettings};
use crate::error::{Error, Result, TrySubmitError};
use crate::format::{MediaFormat, PixelFormat};
use crate::frame::Frame;
use crate::hw::{self, HwDevice};
use crate::packet::Packet;
use crate::rational::TimeBase;
use crate::stream::StreamDescriptor;

/// A decoding implementation driven by [`Decoder`].
///
/// `send_packet` may refuse input with `Busy` while output is pending;
/// `receive_frame` returns `Ok(None)` when nothing is available yet or, after
/// `send_eof`, when everything has been emitted.
pub trait DecodeStep: Send {
    fn name(&self) -> &str;

    /// Time base packets are converted into before `send_packet`.
    fn time_base(&self) -> TimeBase;

    /// Output formats this implementation can produce, hardware first.
    fn candidate_formats(&self) -> Vec<PixelFormat> {
        Vec::new()
    }

    /// Called once before the first packet with the negotiated output format.
    fn configure(
        &mut self,
        _format: Option<PixelFormat>,
        _device: Option<Arc<HwDevice>>,
    ) -> Result<()> {
        Ok(())
    }

    fn send_packet(&mut self, packet: Packet) -> std::result::Result<(), TrySubmitError<Packet>>;

    fn send_eof(&mut self) -> Result<()>;

    fn receive_frame(&mut self) -> Result<Option<Frame>>;
}

/// An encoding implementation driven by [`Encoder`].
pub trait EncodeStep: Send {
    fn name(&self) -> &str;

    fn is_hardware(&self) -> bool {
        hw::is_hw_codec_name(self.name())
    }

    /// Applies settings and returns the stream header (extradata), if any.
    fn open(&mut self, settings: &EncoderSettings) -> Result<Option<Bytes>>;

    fn send_frame(&mut self, frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>>;

    fn send_eof(&mut self) -> Result<()>;

    fn receive_packet(&mut self) -> Result<Option<Packet>>;
}

pub type DecoderFactory =
    Arc<dyn Fn(&StreamDescriptor) -> Result<Box<dyn DecodeStep>> + Send + Sync>;
pub type EncoderFactory = Arc<dyn Fn() -> Result<Box<dyn EncodeStep>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CodecRegistry {
    decoders: HashMap<String, DecoderFactory>,
    encoders: HashMap<String, EncoderFactory>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process `rawvideo` codec.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::raw::register(&mut registry);
        registry
    }

    pub fn register_decoder<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StreamDescriptor) -> Result<Box<dyn DecodeStep>> + Send + Sync + 'static,
    {
        self.decoders.insert(name.into(), Arc::new(factory));
    }

    pub fn register_encoder<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn EncodeStep>> + Send + Sync + 'static,
    {
        self.encoders.insert(name.into(), Arc::new(factory));
    }

    pub fn has_decoder(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains_key(name)
    }

    pub fn find_decoder(&self, name: &str, stream: &StreamDescriptor) -> Result<Box<dyn DecodeStep>> {
        let factory = self
            .decoders
            .get(name)
            .ok_or_else(|| Error::CodecNotFound(name.to_string()))?;
        factory(stream)
    }

    pub fn find_encoder(&self, name: &str) -> Result<Box<dyn EncodeStep>> {
        let factory = self
            .encoders
            .get(name)
            .ok_or_else(|| Error::CodecNotFound(name.to_string()))?;
        factory()
    }

    /// Opens a decoder engine for `stream`. With `prefer_hw` the accelerated
    /// decoders for the codec are tried first.
    pub fn open_decoder(
        &self,
        stream: &StreamDescriptor,
        options: DecoderOptions,
        prefer_hw: bool,
    ) -> Result<Decoder> {
        let codec = stream.codec();
        let mut names: Vec<&str> = Vec::new();
        if prefer_hw {
            names.extend(hw::hw_decoder_names(codec).iter().copied());
        }
        names.push(codec);

        let mut last_err = Error::CodecNotFound(codec.to_string());
        for name in names {
            if !self.has_decoder(name) {
                continue;
            }
            match self
                .find_decoder(name, stream)
                .and_then(|step| Decoder::new(stream, step, options.clone()))
            {
                Ok(decoder) => {
                    log::info!("opened decoder {} for stream {}", name, stream.index());
                    return Ok(decoder);
                }
                Err(err) => {
                    log::warn!("decoder {} unavailable: {}", name, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Opens an encoder engine. With `prefer_hw` the accelerated encoders for
    /// `settings.codec` are tried first and the software encoder is the
    /// fallback.
    pub fn open_encoder(&self, settings: &EncoderSettings, prefer_hw: bool) -> Result<Encoder> {
        let mut candidates: Vec<EncoderSettings> = Vec::new();
        if prefer_hw {
            for name in hw::hw_encoder_names(&settings.codec) {
                let mut hw_settings = settings.clone();
                hw_settings.codec = name.to_string();
                if let MediaFormat::Pixel(format) = settings.format {
                    hw_settings.format =
                        MediaFormat::Pixel(hw::pixel_format_for_encoder(format, name));
                }
                candidates.push(hw_settings);
            }
        }
        candidates.push(settings.clone());

        let mut last_err = Error::CodecNotFound(settings.codec.clone());
        for candidate in candidates {
            if !self.has_encoder(&candidate.codec) {
                continue;
            }
            let name = candidate.codec.clone();
            match self
                .find_encoder(&name)
                .and_then(|step| Encoder::new(step, candidate))
            {
                Ok(encoder) => {
                    log::info!("opened encoder {}", name);
                    return Ok(encoder);
                }
                Err(err) => {
                    log::warn!("encoder {} unavailable, trying next: {}", name, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RawEncoder;

    struct BrokenEncoder;

    impl EncodeStep for BrokenEncoder {
        fn name(&self) -> &str {
            "h264_videotoolbox"
        }

        fn open(&mut self, _settings: &EncoderSettings) -> Result<Option<Bytes>> {
            Err(Error::codec("no device"))
        }

        fn send_frame(&mut self, frame: Frame) -> std::result::Result<(), TrySubmitError<Frame>> {
            Err(TrySubmitError::Busy(frame))
        }

        fn send_eof(&mut self) -> Result<()> {
            Ok(())
        }

        fn receive_packet(&mut self) -> Result<Option<Packet>> {
            Ok(None)
        }
    }

    #[test]
    fn unknown_codec_is_reported() {
        let registry = CodecRegistry::with_builtin();
        assert!(matches!(
            registry.find_encoder("libx264"),
            Err(Error::CodecNotFound(name)) if name == "libx264"
        ));
        assert!(registry.has_decoder("rawvideo"));
    }

    #[test]
    fn hardware_encoder_falls_back_to_software() -> anyhow::Result<()> {
        let mut registry = CodecRegistry::new();
        registry.register_encoder("h264_videotoolbox", || Ok(Box::new(BrokenEncoder)));
        registry.register_encoder("h264", || Ok(Box::new(RawEncoder::new(0))));

        let settings = EncoderSettings {
            codec: "h264".to_string(),
            ..EncoderSettings::default()
        };
        let encoder = registry.open_encoder(&settings, true)?;
        assert_eq!(encoder.settings().codec, "h264");
        assert!(!encoder.is_hardware());
        Ok(())
    }
}
