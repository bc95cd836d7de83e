//! Cuts the encoded packet stream into independently decodable segments.
//!
//! A segment is sealed at the first keyframe that arrives once the segment
//! already covers at least the target duration, so segments run long rather
//! than short and every segment after the first starts on a keyframe.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::packet::Packet;
use crate::rational::Rational;

/// What a playlist needs to know about a sealed segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: u64,
    pub duration_seconds: f64,
    pub byte_length: usize,
}

#[derive(Debug)]
pub struct Segment {
    index: u64,
    duration: Rational,
    packets: Vec<Packet>,
}

impl Segment {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Exact accumulated duration in seconds.
    pub fn duration(&self) -> Rational {
        self.duration
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration.to_f64()
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }

    pub fn byte_length(&self) -> usize {
        self.packets.iter().map(Packet::size).sum()
    }

    pub fn starts_with_keyframe(&self) -> bool {
        self.packets.first().is_some_and(Packet::is_key)
    }

    /// Packet payloads back to back.
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_length());
        for packet in &self.packets {
            buf.extend_from_slice(packet.data());
        }
        buf.freeze()
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            index: self.index,
            duration_seconds: self.duration_seconds(),
            byte_length: self.byte_length(),
        }
    }
}

#[derive(Debug)]
pub struct Segmenter {
    target: Rational,
    current: Vec<Packet>,
    accumulated: Rational,
    next_index: u64,
}

impl Segmenter {
    /// `target` is the minimum segment length in seconds.
    pub fn new(target: Rational) -> Self {
        Self {
            target,
            current: Vec::new(),
            accumulated: Rational::ZERO,
            next_index: 0,
        }
    }

    pub fn target(&self) -> Rational {
        self.target
    }

    /// Adds a packet lasting `duration` seconds. Returns the segment sealed
    /// by this packet, if any; the packet itself opens the next segment.
    pub fn absorb(&mut self, packet: Packet, duration: Rational) -> Option<Segment> {
        let sealed = if packet.is_key() && !self.current.is_empty() && self.accumulated >= self.target
        {
            self.seal()
        } else {
            None
        };

        if self.current.is_empty() && !packet.is_key() {
            log::warn!(
                "segment {} starts on a non-keyframe (pts {:?})",
                self.next_index,
                packet.pts()
            );
        }

        self.accumulated = match self.accumulated.checked_add(duration) {
            Some(sum) => sum,
            None => {
                log::debug!("segment duration overflowed exact arithmetic, rounding to microseconds");
                Rational::from_f64(self.accumulated.to_f64() + duration.to_f64(), 1_000_000)
                    .unwrap_or(self.accumulated)
            }
        };
        self.current.push(packet);
        sealed
    }

    /// Seals whatever has been absorbed. Returns `None` when nothing is
    /// pending, so calling it twice is harmless.
    pub fn flush(&mut self) -> Option<Segment> {
        self.seal()
    }

    fn seal(&mut self) -> Option<Segment> {
        if self.current.is_empty() {
            return None;
        }
        let segment = Segment {
            index: self.next_index,
            duration: std::mem::replace(&mut self.accumulated, Rational::ZERO),
            packets: std::mem::take(&mut self.current),
        };
        self.next_index += 1;
        log::debug!(
            "sealed segment {}: {} packets, {:.3}s",
            segment.index,
            segment.packets.len(),
            segment.duration_seconds()
        );
        Some(segment)
    }

    pub fn pending_packets(&self) -> usize {
        self.current.len()
    }

    pub fn accumulated(&self) -> Rational {
        self.accumulated
    }

    /// Index the next sealed segment will get.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}
