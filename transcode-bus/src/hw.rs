//! Hardware devices, device-resident surfaces and the download stage.
//!
//! Also holds the hardware codec name tables used by the registry to try an
//! accelerated implementation (VideoToolbox/CUDA/VAAPI/QSV/V4L2M2M) before the
//! software one.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::frame::Frame;
use crate::rational::TimeBase;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwDeviceKind {
    VideoToolbox,
    Cuda,
    Vaapi,
    Qsv,
    /// In-process device that keeps surfaces in host memory.
    Loopback,
}

impl HwDeviceKind {
    /// Pixel format that identifies surfaces owned by this kind of device.
    pub const fn surface_format(self) -> PixelFormat {
        match self {
            Self::VideoToolbox => PixelFormat::VideoToolbox,
            Self::Cuda => PixelFormat::Cuda,
            Self::Vaapi => PixelFormat::Vaapi,
            Self::Qsv => PixelFormat::Qsv,
            Self::Loopback => PixelFormat::Opaque,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::VideoToolbox => "videotoolbox",
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::Loopback => "loopback",
        }
    }
}

impl fmt::Display for HwDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory provider behind a [`HwDevice`].
///
/// Surfaces are addressed by handles the provider hands out from `upload`.
/// Implementations must be safe to share between engines.
pub trait HwFrameProvider: Send + Sync {
    /// Software formats a surface can be downloaded into.
    fn transfer_formats(&self) -> Vec<PixelFormat>;

    /// First of `candidates` the device can download into.
    fn negotiate_format(&self, candidates: &[PixelFormat]) -> Option<PixelFormat> {
        let supported = self.transfer_formats();
        candidates
            .iter()
            .copied()
            .find(|format| supported.contains(format))
    }

    fn upload(&self, _data: Bytes, _format: PixelFormat) -> Result<u64> {
        Err(Error::transfer("device does not accept uploads"))
    }

    fn transfer_frame(&self, handle: u64, format: PixelFormat) -> Result<Bytes>;

    /// Returns a surface to the device pool.
    fn release(&self, _handle: u64) {}
}

pub struct HwDevice {
    kind: HwDeviceKind,
    provider: Box<dyn HwFrameProvider>,
}

impl HwDevice {
    pub fn new(kind: HwDeviceKind, provider: impl HwFrameProvider + 'static) -> Arc<Self> {
        Arc::new(Self {
            kind,
            provider: Box::new(provider),
        })
    }

    pub fn kind(&self) -> HwDeviceKind {
        self.kind
    }

    pub fn surface_format(&self) -> PixelFormat {
        self.kind.surface_format()
    }

    pub fn negotiate_format(&self, candidates: &[PixelFormat]) -> Option<PixelFormat> {
        self.provider.negotiate_format(candidates)
    }

    /// Copies software pixels into a new device surface.
    pub fn upload(self: &Arc<Self>, data: Bytes, format: PixelFormat) -> Result<HwSurface> {
        let handle = self.provider.upload(data, format)?;
        Ok(HwSurface {
            device: Arc::clone(self),
            handle,
        })
    }
}

impl fmt::Debug for HwDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwDevice").field("kind", &self.kind).finish()
    }
}

/// A frame's pixels living in device memory. Dropping it frees the slot.
pub struct HwSurface {
    device: Arc<HwDevice>,
    handle: u64,
}

impl HwSurface {
    pub fn device(&self) -> &Arc<HwDevice> {
        &self.device
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn format(&self) -> PixelFormat {
        self.device.surface_format()
    }

    pub fn download(&self, format: PixelFormat) -> Result<Bytes> {
        self.device.provider.transfer_frame(self.handle, format)
    }
}

impl Drop for HwSurface {
    fn drop(&mut self) {
        self.device.provider.release(self.handle);
    }
}

impl fmt::Debug for HwSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwSurface")
            .field("device", &self.device.kind)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Moves device-resident frames into host memory in the encoder's format.
///
/// Software frames pass through. Frames without a time base get the stream's.
#[derive(Debug, Clone)]
pub struct HwTransfer {
    target: PixelFormat,
    stream_time_base: TimeBase,
}

impl HwTransfer {
    pub fn new(target: PixelFormat, stream_time_base: TimeBase) -> Self {
        Self {
            target,
            stream_time_base,
        }
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    pub fn transfer(&self, frame: Frame) -> Result<Frame> {
        let time_base = frame.time_base().unwrap_or(self.stream_time_base);
        let frame = frame.with_time_base(Some(time_base));
        if frame.format().pixel() == Some(self.target) {
            return Ok(frame);
        }

        let (width, height, pts) = (frame.width(), frame.height(), frame.pts());
        let discontinuity = frame.is_discontinuity();
        let surface = match frame.into_surface() {
            Ok(surface) => surface,
            Err(software) => return Ok(software),
        };

        let format = surface
            .device()
            .negotiate_format(&[self.target])
            .ok_or_else(|| {
                Error::transfer(format!(
                    "{} device cannot download into {}",
                    surface.device().kind(),
                    self.target
                ))
            })?;

        let data = surface.download(format).map_err(|err| match err {
            Error::TransferFailed(msg) => Error::TransferFailed(msg),
            other => Error::transfer(other.to_string()),
        })?;
        drop(surface);

        Ok(Frame::video(data, format, width, height)
            .with_pts(pts)
            .with_time_base(Some(time_base))
            .with_discontinuity(discontinuity))
    }
}

/// Accelerated decoder names for a codec, most preferred first.
pub fn hw_decoder_names(codec: &str) -> &'static [&'static str] {
    match codec {
        "h264" => &[
            "h264_videotoolbox",
            "h264_cuvid",
            "h264_qsv",
            "h264_v4l2m2m",
        ],
        "hevc" | "h265" => &[
            "hevc_videotoolbox",
            "hevc_cuvid",
            "hevc_qsv",
            "hevc_v4l2m2m",
        ],
        "vp8" => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        "vp9" => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        "av1" => &["av1_cuvid", "av1_qsv"],
        "mpeg2video" => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        "mpeg4" => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        _ => &[],
    }
}

/// Accelerated encoder names for a software encoder or codec name.
pub fn hw_encoder_names(codec: &str) -> &'static [&'static str] {
    match codec {
        "libx264" | "h264" => &[
            "h264_videotoolbox",
            "h264_nvenc",
            "h264_vaapi",
            "h264_qsv",
            "h264_v4l2m2m",
        ],
        "libx265" | "hevc" | "h265" => &[
            "hevc_videotoolbox",
            "hevc_nvenc",
            "hevc_vaapi",
            "hevc_qsv",
            "hevc_v4l2m2m",
        ],
        "libvpx" | "libvpx-vp9" | "vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    }
}

pub fn is_hw_codec_name(name: &str) -> bool {
    ["videotoolbox", "nvenc", "cuvid", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| name.contains(suffix))
}

/// Pixel format an encoder should be fed. Packed RGB sources map to
/// YUV 4:2:0; hardware encoders get NV12.
pub fn pixel_format_for_encoder(source: PixelFormat, codec_name: &str) -> PixelFormat {
    let is_hw = is_hw_codec_name(codec_name);
    match source {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba | PixelFormat::Bgra => {
            if is_hw {
                PixelFormat::Nv12
            } else {
                PixelFormat::Yuv420p
            }
        }
        format if format.is_hardware() => PixelFormat::Nv12,
        format => format,
    }
}
