use std::collections::VecDeque;

use crate::error::Result;
use crate::packet::Packet;
use crate::stream::{MediaType, StreamDescriptor, best_stream};

/// Source of compressed packets from a container.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamDescriptor];

    /// Next packet in container order, `Ok(None)` at end of input.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    fn stream(&self, index: usize) -> Option<&StreamDescriptor> {
        self.streams().iter().find(|s| s.index() == index)
    }

    fn best_stream(&self, media_type: MediaType) -> Option<&StreamDescriptor> {
        best_stream(self.streams(), media_type)
    }
}

/// Demuxer over packets already in memory.
pub struct PacketQueue {
    streams: Vec<StreamDescriptor>,
    packets: VecDeque<Packet>,
}

impl PacketQueue {
    pub fn new(streams: Vec<StreamDescriptor>) -> Self {
        Self {
            streams,
            packets: VecDeque::new(),
        }
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl Extend<Packet> for PacketQueue {
    fn extend<T: IntoIterator<Item = Packet>>(&mut self, iter: T) {
        self.packets.extend(iter);
    }
}

impl Demuxer for PacketQueue {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        Ok(self.packets.pop_front())
    }
}
