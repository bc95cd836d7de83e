use bytes::Bytes;

use crate::rational::{Rational, TimeBase};
use crate::timestamp::Rescaler;

/// A compressed access unit.
///
/// Packets are moved between stages, never cloned: whichever stage holds
/// one is its only owner.
#[derive(Debug)]
pub struct Packet {
    data: Bytes,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: Option<i64>,
    time_base: TimeBase,
    stream_index: usize,
    is_key: bool,
    discontinuity: bool,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, time_base: TimeBase) -> Self {
        Self {
            data: data.into(),
            pts: None,
            dts: None,
            duration: None,
            time_base,
            stream_index: 0,
            is_key: false,
            discontinuity: false,
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: Option<i64>) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_duration(mut self, duration: Option<i64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_stream_index(mut self, index: usize) -> Self {
        self.stream_index = index;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity = discontinuity;
        self
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn index(&self) -> usize {
        self.stream_index
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn is_discontinuity(&self) -> bool {
        self.discontinuity
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.pts = pts;
    }

    pub fn set_dts(&mut self, dts: Option<i64>) {
        self.dts = dts;
    }

    pub fn set_duration(&mut self, duration: Option<i64>) {
        self.duration = duration;
    }

    pub fn set_stream_index(&mut self, index: usize) {
        self.stream_index = index;
    }

    pub fn set_discontinuity(&mut self, discontinuity: bool) {
        self.discontinuity = discontinuity;
    }

    /// Replaces the payload, keeping timing and flags.
    pub fn set_data(&mut self, data: Bytes) {
        self.data = data;
    }

    /// Moves pts, dts and duration into `time_base`, each converted on its own.
    pub fn rescale_ts(&mut self, time_base: TimeBase) {
        if self.time_base == time_base {
            return;
        }
        let rescaler = Rescaler::new(self.time_base, time_base);
        self.pts = rescaler.rescale(self.pts);
        self.dts = rescaler.rescale(self.dts);
        self.duration = rescaler.rescale(self.duration);
        self.time_base = time_base;
    }

    /// Duration in seconds, if the packet carries one.
    pub fn duration_seconds(&self) -> Option<Rational> {
        self.duration
            .filter(|d| *d > 0)
            .and_then(|d| self.time_base.seconds(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_ts_converts_each_field() -> anyhow::Result<()> {
        let mut packet = Packet::new(Bytes::from_static(b"abc"), TimeBase::new(1, 30)?)
            .with_pts(Some(3))
            .with_dts(None)
            .with_duration(Some(1));
        packet.rescale_ts(TimeBase::MPEG_TS);
        assert_eq!(packet.pts(), Some(9000));
        assert_eq!(packet.dts(), None);
        assert_eq!(packet.duration(), Some(3000));
        assert_eq!(packet.time_base(), TimeBase::MPEG_TS);
        assert_eq!(packet.duration_seconds(), Some(Rational::new(1, 30)?));
        assert_eq!(packet.size(), 3);
        Ok(())
    }
}
