use crate::error::{Error, Result};
use crate::format::MediaFormat;
use crate::frame::Frame;

/// Converts a software frame into another pixel or sample layout.
pub trait FormatConverter: Send {
    fn convert(&mut self, frame: &Frame, target: MediaFormat) -> Result<Frame>;
}

/// Runs a converter between the transfer stage and the encoder.
pub struct Scaler {
    context: Box<dyn FormatConverter>,
    target: MediaFormat,
}

impl Scaler {
    pub fn new(context: Box<dyn FormatConverter>, target: MediaFormat) -> Self {
        Self { context, target }
    }

    pub fn target(&self) -> MediaFormat {
        self.target
    }

    pub fn run(&mut self, frame: Frame) -> Result<Frame> {
        if frame.format() == self.target {
            return Ok(frame);
        }
        if frame.is_hardware() {
            return Err(Error::FormatMismatch {
                expected: self.target,
                actual: frame.format(),
            });
        }
        let mut converted = self.context.convert(&frame, self.target)?;
        if converted.format() != self.target {
            return Err(Error::FormatMismatch {
                expected: self.target,
                actual: converted.format(),
            });
        }
        // Copy over timing from the source frame
        converted.set_pts(frame.pts());
        converted.set_time_base(frame.time_base());
        converted.set_discontinuity(frame.is_discontinuity());
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::format::PixelFormat;
    use crate::rational::TimeBase;

    /// Relabels the frame without touching its bytes.
    struct Relabel;

    impl FormatConverter for Relabel {
        fn convert(&mut self, frame: &Frame, target: MediaFormat) -> Result<Frame> {
            let data = frame.software_data().cloned().unwrap_or_default();
            let MediaFormat::Pixel(format) = target else {
                return Err(Error::codec("video only"));
            };
            Ok(Frame::video(data, format, frame.width(), frame.height()))
        }
    }

    #[test]
    fn converted_frame_keeps_timing() -> anyhow::Result<()> {
        let mut scaler = Scaler::new(Box::new(Relabel), PixelFormat::Yuv420p.into());
        let frame = Frame::video(Bytes::from_static(&[0; 6]), PixelFormat::Nv12, 2, 2)
            .with_pts(Some(9))
            .with_time_base(Some(TimeBase::MPEG_TS));
        let out = scaler.run(frame)?;
        assert_eq!(out.format(), MediaFormat::Pixel(PixelFormat::Yuv420p));
        assert_eq!(out.pts(), Some(9));
        assert_eq!(out.time_base(), Some(TimeBase::MPEG_TS));
        Ok(())
    }
}
