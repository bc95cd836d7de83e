//! Pixel and sample format identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, 12bpp
    Yuv420p,
    /// Semi-planar YUV 4:2:0, the usual hardware download format
    Nv12,
    Yuv422p,
    Yuv444p,
    Yuv420p10,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    /// Surface owned by a VideoToolbox device
    VideoToolbox,
    /// Surface owned by a CUDA device
    Cuda,
    /// Surface owned by a VA-API device
    Vaapi,
    /// Surface owned by a Quick Sync device
    Qsv,
    /// Device-private surface without a public layout
    Opaque,
}

impl PixelFormat {
    /// Hardware formats describe device memory, not a byte layout.
    pub const fn is_hardware(self) -> bool {
        matches!(
            self,
            Self::VideoToolbox | Self::Cuda | Self::Vaapi | Self::Qsv | Self::Opaque
        )
    }

    /// Byte size of one software frame, `None` for hardware formats.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        let size = match self {
            Self::Yuv420p | Self::Nv12 => pixels + 2 * (pixels / 4),
            Self::Yuv420p10 => (pixels + 2 * (pixels / 4)) * 2,
            Self::Yuv422p => pixels * 2,
            Self::Yuv444p | Self::Rgb24 | Self::Bgr24 => pixels * 3,
            Self::Rgba | Self::Bgra => pixels * 4,
            _ => return None,
        };
        Some(size)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Yuv422p => "yuv422p",
            Self::Yuv444p => "yuv444p",
            Self::Yuv420p10 => "yuv420p10",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::VideoToolbox => "videotoolbox",
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::Opaque => "opaque",
        }
    }

    const ALL: [PixelFormat; 14] = [
        Self::Yuv420p,
        Self::Nv12,
        Self::Yuv422p,
        Self::Yuv444p,
        Self::Yuv420p10,
        Self::Rgb24,
        Self::Bgr24,
        Self::Rgba,
        Self::Bgra,
        Self::VideoToolbox,
        Self::Cuda,
        Self::Vaapi,
        Self::Qsv,
        Self::Opaque,
    ];
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config(format!("unknown pixel format: {s}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    S16p,
    F32p,
}

impl SampleFormat {
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 | Self::S16p => 2,
            Self::S32 | Self::F32 | Self::F32p => 4,
            Self::F64 => 8,
        }
    }

    pub const fn is_planar(self) -> bool {
        matches!(self, Self::S16p | Self::F32p)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::S16p => "s16p",
            Self::F32p => "f32p",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Format carried by a frame: a pixel layout for video, a sample layout for audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Pixel(PixelFormat),
    Sample(SampleFormat),
}

impl MediaFormat {
    pub fn pixel(&self) -> Option<PixelFormat> {
        match self {
            MediaFormat::Pixel(format) => Some(*format),
            MediaFormat::Sample(_) => None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.pixel().is_some_and(PixelFormat::is_hardware)
    }
}

impl From<PixelFormat> for MediaFormat {
    fn from(value: PixelFormat) -> Self {
        MediaFormat::Pixel(value)
    }
}

impl From<SampleFormat> for MediaFormat {
    fn from(value: SampleFormat) -> Self {
        MediaFormat::Sample(value)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaFormat::Pixel(format) => fmt::Display::fmt(format, f),
            MediaFormat::Sample(format) => fmt::Display::fmt(format, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_formats_have_no_layout() {
        assert!(PixelFormat::VideoToolbox.is_hardware());
        assert_eq!(PixelFormat::Cuda.frame_size(64, 36), None);
        assert_eq!(PixelFormat::Yuv420p.frame_size(64, 36), Some(3456));
        assert!(!MediaFormat::Sample(SampleFormat::F32).is_hardware());
    }

    #[test]
    fn parse_pixel_format() {
        assert_eq!("NV12".parse::<PixelFormat>().ok(), Some(PixelFormat::Nv12));
        assert!("xyz".parse::<PixelFormat>().is_err());
    }
}
