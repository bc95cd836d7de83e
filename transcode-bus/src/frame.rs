use std::fmt;

use bytes::Bytes;

use crate::format::{MediaFormat, PixelFormat, SampleFormat};
use crate::hw::{HwDeviceKind, HwSurface};
use crate::rational::TimeBase;

/// Where a frame's samples live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Software,
    Hardware(HwDeviceKind),
}

pub enum FrameData {
    Software(Bytes),
    Hardware(HwSurface),
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameData::Software(data) => write!(f, "Software({} bytes)", data.len()),
            FrameData::Hardware(surface) => write!(f, "Hardware({surface:?})"),
        }
    }
}

/// A decoded picture or block of audio samples.
///
/// Like [`crate::packet::Packet`], frames move between stages and are never
/// duplicated.
#[derive(Debug)]
pub struct Frame {
    data: FrameData,
    pts: Option<i64>,
    time_base: Option<TimeBase>,
    format: MediaFormat,
    width: u32,
    height: u32,
    samples: usize,
    /// First frame after a timestamp restart in the source.
    discontinuity: bool,
}

impl Frame {
    pub fn video(data: Bytes, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            data: FrameData::Software(data),
            pts: None,
            time_base: None,
            format: MediaFormat::Pixel(format),
            width,
            height,
            samples: 0,
            discontinuity: false,
        }
    }

    pub fn audio(data: Bytes, format: SampleFormat, samples: usize) -> Self {
        Self {
            data: FrameData::Software(data),
            pts: None,
            time_base: None,
            format: MediaFormat::Sample(format),
            width: 0,
            height: 0,
            samples,
            discontinuity: false,
        }
    }

    /// A picture held in device memory; its format is the device surface format.
    pub fn hardware(surface: HwSurface, width: u32, height: u32) -> Self {
        let format = MediaFormat::Pixel(surface.format());
        Self {
            data: FrameData::Hardware(surface),
            pts: None,
            time_base: None,
            format,
            width,
            height,
            samples: 0,
            discontinuity: false,
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_time_base(mut self, time_base: Option<TimeBase>) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity = discontinuity;
        self
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.pts = pts;
    }

    pub fn time_base(&self) -> Option<TimeBase> {
        self.time_base
    }

    pub fn set_time_base(&mut self, time_base: Option<TimeBase>) {
        self.time_base = time_base;
    }

    pub fn is_discontinuity(&self) -> bool {
        self.discontinuity
    }

    pub fn set_discontinuity(&mut self, discontinuity: bool) {
        self.discontinuity = discontinuity;
    }

    pub fn format(&self) -> MediaFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn is_video(&self) -> bool {
        matches!(self.format, MediaFormat::Pixel(_))
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self.data, FrameData::Hardware(_))
    }

    pub fn residency(&self) -> Residency {
        match &self.data {
            FrameData::Software(_) => Residency::Software,
            FrameData::Hardware(surface) => Residency::Hardware(surface.device().kind()),
        }
    }

    pub fn data(&self) -> &FrameData {
        &self.data
    }

    pub fn software_data(&self) -> Option<&Bytes> {
        match &self.data {
            FrameData::Software(data) => Some(data),
            FrameData::Hardware(_) => None,
        }
    }

    pub fn into_data(self) -> FrameData {
        self.data
    }

    /// Takes the device surface out of a hardware frame, or hands a software
    /// frame back unchanged.
    pub fn into_surface(self) -> Result<HwSurface, Frame> {
        match self.data {
            FrameData::Hardware(surface) => Ok(surface),
            data @ FrameData::Software(_) => Err(Frame { data, ..self }),
        }
    }

    /// Replaces the payload and format, keeping timing and geometry.
    pub fn with_software_data(self, data: Bytes, format: MediaFormat) -> Self {
        Self {
            data: FrameData::Software(data),
            format,
            ..self
        }
    }
}
