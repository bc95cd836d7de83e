use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::rational::TimeBase;

/// Packet-to-packet rewriter placed after the encoder.
///
/// Same send/receive protocol as the codec engines: `send_packet(None)`
/// signals end of input, after which `receive_packet` drains what is left.
pub trait BitstreamFilter: Send {
    fn name(&self) -> &str;

    fn input_time_base(&self) -> TimeBase;

    fn output_time_base(&self) -> TimeBase {
        self.input_time_base()
    }

    fn send_packet(&mut self, packet: Option<Packet>) -> Result<()>;

    fn receive_packet(&mut self) -> Result<Option<Packet>>;

    /// Drops buffered state, e.g. after a seek.
    fn flush(&mut self);
}

/// Sends one packet, or end of stream for `None`, and collects everything
/// the filter has ready afterwards.
pub fn filter_packet(filter: &mut dyn BitstreamFilter, packet: Option<Packet>) -> Result<Vec<Packet>> {
    filter.send_packet(packet)?;
    let mut out = Vec::new();
    while let Some(packet) = filter.receive_packet()? {
        out.push(packet);
    }
    Ok(out)
}

/// True for extradata holding an `avcC` record (length-prefixed NAL units).
pub fn needs_annexb_conversion(extradata: &[u8]) -> bool {
    if extradata.len() < 7 || is_annexb_packet(extradata) {
        return false;
    }
    // configurationVersion
    extradata[0] == 0x01
}

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    data.starts_with(&[0x00, 0x00, 0x00, 0x01]) || data.starts_with(&[0x00, 0x00, 0x01])
}

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Converts AVCC (4-byte length + NAL) to Annex B (start code + NAL).
pub fn convert_avcc_to_annexb(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    let mut i = 0;
    while i + 4 <= avcc.len() {
        let len = u32::from_be_bytes([avcc[i], avcc[i + 1], avcc[i + 2], avcc[i + 3]]) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// SPS and PPS units of an `avcC` record as an Annex B byte stream.
pub fn avcc_parameter_sets(extradata: &[u8]) -> Result<Bytes> {
    let truncated = || Error::codec("truncated avcC record");
    let mut out = BytesMut::new();
    let mut i = 5;

    let mut copy_sets = |count: usize, i: &mut usize| -> Result<()> {
        for _ in 0..count {
            let header = extradata.get(*i..*i + 2).ok_or_else(truncated)?;
            let len = u16::from_be_bytes([header[0], header[1]]) as usize;
            *i += 2;
            let unit = extradata.get(*i..*i + len).ok_or_else(truncated)?;
            out.extend_from_slice(START_CODE);
            out.extend_from_slice(unit);
            *i += len;
        }
        Ok(())
    };

    let sps_count = (*extradata.get(i).ok_or_else(truncated)? & 0x1f) as usize;
    i += 1;
    copy_sets(sps_count, &mut i)?;
    let pps_count = *extradata.get(i).ok_or_else(truncated)? as usize;
    i += 1;
    copy_sets(pps_count, &mut i)?;

    Ok(out.freeze())
}

/// Converts H.264 from AVCC (length-prefixed) to Annex B (start-code)
/// format. Parameter sets from the `avcC` record are repeated in front of
/// every keyframe so each segment can be decoded on its own.
///
/// Only the H.264 `avcC` layout is understood; HEVC `hvcC` records are not.
pub struct AvccToAnnexB {
    time_base: TimeBase,
    parameter_sets: Option<Bytes>,
    queue: VecDeque<Packet>,
    eof: bool,
}

impl AvccToAnnexB {
    pub fn new(extradata: Option<&[u8]>, time_base: TimeBase) -> Result<Self> {
        let parameter_sets = match extradata {
            Some(data) if needs_annexb_conversion(data) => Some(avcc_parameter_sets(data)?),
            _ => None,
        };
        Ok(Self {
            time_base,
            parameter_sets,
            queue: VecDeque::new(),
            eof: false,
        })
    }

    fn convert(&self, mut packet: Packet) -> Packet {
        let data = packet.data();
        if data.is_empty() || is_annexb_packet(data) {
            return packet;
        }
        let converted = convert_avcc_to_annexb(data);
        let data = match &self.parameter_sets {
            Some(sets) if packet.is_key() => {
                let mut buf = BytesMut::with_capacity(sets.len() + converted.len());
                buf.extend_from_slice(sets);
                buf.extend_from_slice(&converted);
                buf.freeze()
            }
            _ => converted,
        };
        packet.set_data(data);
        packet
    }
}

impl BitstreamFilter for AvccToAnnexB {
    fn name(&self) -> &str {
        "avcc_to_annexb"
    }

    fn input_time_base(&self) -> TimeBase {
        self.time_base
    }

    fn send_packet(&mut self, packet: Option<Packet>) -> Result<()> {
        match packet {
            Some(_) if self.eof => Err(Error::InvalidState {
                stage: "bitstream filter",
                op: "send_packet",
                state: "draining",
            }),
            Some(packet) => {
                let packet = self.convert(packet);
                self.queue.push_back(packet);
                Ok(())
            }
            None => {
                self.eof = true;
                Ok(())
            }
        }
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        Ok(self.queue.pop_front())
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.eof = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb_packet(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb_packet(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb_packet(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb_packet(&[0x00, 0x00]));
    }

    #[test]
    fn test_avcc_to_annexb() {
        // One NAL: length 4, then 4 bytes NAL
        let avcc = [0, 0, 0, 4, 0x65, 0x88, 0x81, 0x00];
        let out = convert_avcc_to_annexb(&avcc);
        assert_eq!(
            &out[..],
            &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x81, 0x00][..]
        );
    }

    #[test]
    fn keyframes_get_parameter_sets() -> anyhow::Result<()> {
        // avcC: version 1, profile, compat, level, 0xff, 1 SPS (len 2), 1 PPS (len 1)
        let avcc: [u8; 14] = [1, 0x64, 0, 0x1f, 0xff, 0xe1, 0, 2, 0x67, 0x64, 1, 0, 1, 0x68];
        assert!(needs_annexb_conversion(&avcc));
        let mut filter = AvccToAnnexB::new(Some(&avcc[..]), TimeBase::MPEG_TS)?;

        let key = Packet::new(vec![0u8, 0, 0, 2, 0x65, 0x88], TimeBase::MPEG_TS).with_key(true);
        let out = filter_packet(&mut filter, Some(key))?;
        assert_eq!(out.len(), 1);
        assert_eq!(
            &out[0].data()[..],
            &[0, 0, 0, 1, 0x67, 0x64, 0, 0, 0, 1, 0x68, 0, 0, 0, 1, 0x65, 0x88][..]
        );

        // already Annex B: left alone
        let inter = Packet::new(vec![0u8, 0, 0, 1, 0x41], TimeBase::MPEG_TS);
        let out = filter_packet(&mut filter, Some(inter))?;
        assert_eq!(&out[0].data()[..], &[0, 0, 0, 1, 0x41][..]);

        assert!(filter_packet(&mut filter, None)?.is_empty());
        assert!(filter.send_packet(Some(Packet::new(vec![1u8], TimeBase::MPEG_TS))).is_err());
        Ok(())
    }

    #[test]
    fn truncated_record_is_an_error() {
        let avcc: [u8; 9] = [1, 0x64, 0, 0x1f, 0xff, 0xe1, 0, 9, 0x67];
        assert!(AvccToAnnexB::new(Some(&avcc[..]), TimeBase::MPEG_TS).is_err());
    }
}
