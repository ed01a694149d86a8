/*!
Ring messages of the token-coherence protocol.

A message is owned by exactly one ring buffer or process at any moment;
buffers carry slab indices (`MsgId`), the payload lives here. Token counts
on a message are in-flight tokens: the conservation invariant counts them
together with the tokens held in cache lines and at the root directories.
*/

use crate::kernel::serialize::{Archive, Persist};
use crate::mem::ring::NodeId;
use crate::mem::{MemAddr, WClientId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Read miss looking for data and tokens; carries no payload.
    ReadRequest,
    /// Write-miss read request carrying the writer's bytes; other caches
    /// merge newer data into it as it travels.
    RequestData,
    /// Read reply: data plus donated tokens, headed back to its sender.
    RequestDataToken,
    /// A line's tokens (and data) leaving a cache.
    Eviction,
    /// Write propagation: masked bytes applied by every holder; the home
    /// root directory commits them to backing storage in passing.
    Update,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub address: MemAddr,
    /// Originating cache (replies travel until they reach it again).
    pub sender: NodeId,
    pub tokens: u32,
    pub dirty: bool,
    /// Suppresses all protocol effects while the message is re-routed over
    /// a long path for deadlock avoidance.
    pub ignore: bool,
    pub data: Vec<u8>,
    pub mask: Vec<bool>,
    /// For `Update`: how many queued write acknowledgements at the sender
    /// this message covers when it returns.
    pub acks: u32,
}

impl Message {
    pub fn new(kind: MessageKind, address: MemAddr, sender: NodeId, line_size: usize) -> Self {
        Message {
            kind,
            address,
            sender,
            tokens: 0,
            dirty: false,
            ignore: false,
            data: vec![0; line_size],
            mask: vec![false; line_size],
            acks: 0,
        }
    }

    /// Copy `data` bytes under `mask` into this message and mark them
    /// valid.
    pub fn merge_bytes(&mut self, data: &[u8], mask: &[bool]) {
        for i in 0..data.len() {
            if mask[i] {
                self.data[i] = data[i];
                self.mask[i] = true;
            }
        }
    }

    /// Short form for protocol traces.
    pub fn describe(&self) -> String {
        let kind = match self.kind {
            MessageKind::ReadRequest => "RR",
            MessageKind::RequestData => "RD",
            MessageKind::RequestDataToken => "RDT",
            MessageKind::Eviction => "EV",
            MessageKind::Update => "UP",
        };
        format!(
            "{kind}[{:#x} from {} tokens={}{}{}]",
            self.address,
            self.sender,
            self.tokens,
            if self.dirty { " dirty" } else { "" },
            if self.ignore { " ignore" } else { "" },
        )
    }
}

impl Persist for Message {
    fn serialize(&mut self, ar: &mut dyn Archive) {
        let mut kind = self.kind as u32;
        ar.field_u32("kind", &mut kind);
        self.kind = match kind {
            0 => MessageKind::ReadRequest,
            1 => MessageKind::RequestData,
            2 => MessageKind::RequestDataToken,
            3 => MessageKind::Eviction,
            4 => MessageKind::Update,
            _ => panic!("corrupt message archive"),
        };
        ar.field_u64("address", &mut self.address);
        let mut sender = self.sender as u64;
        ar.field_u64("sender", &mut sender);
        self.sender = sender as NodeId;
        ar.field_u32("tokens", &mut self.tokens);
        ar.field_bool("dirty", &mut self.dirty);
        ar.field_bool("ignore", &mut self.ignore);
        ar.field_u32("acks", &mut self.acks);
        ar.field_bytes("data", &mut self.data);
        let mut mask: Vec<u8> = self.mask.iter().map(|&b| u8::from(b)).collect();
        ar.field_bytes("mask", &mut mask);
        for (m, b) in self.mask.iter_mut().zip(mask) {
            *m = b != 0;
        }
    }
}

/// A client request waiting on a cache's bus.
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub write: bool,
    pub address: MemAddr,
    pub data: crate::mem::MemData,
    pub client: usize,
    pub wid: WClientId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::serialize::{BinReader, BinWriter};

    #[test]
    fn merge_respects_mask() {
        let mut msg = Message::new(MessageKind::RequestData, 0, 0, 4);
        msg.merge_bytes(&[1, 2, 3, 4], &[true, false, true, false]);
        assert_eq!(msg.data, vec![1, 0, 3, 0]);
        assert_eq!(msg.mask, vec![true, false, true, false]);
        // A second merge does not clobber already-valid bytes unless the
        // source mask covers them.
        msg.merge_bytes(&[9, 9, 9, 9], &[false, true, false, false]);
        assert_eq!(msg.data, vec![1, 9, 3, 0]);
    }

    #[test]
    fn message_archive_round_trip() {
        let mut msg = Message::new(MessageKind::Eviction, 0x1c0, 3, 8);
        msg.tokens = 4;
        msg.dirty = true;
        msg.data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        msg.mask = vec![true; 8];
        let mut w = BinWriter::default();
        msg.serialize(&mut w);

        let mut restored = Message::new(MessageKind::ReadRequest, 0, 0, 8);
        let mut r = BinReader::new(w.out);
        restored.serialize(&mut r);
        assert_eq!(restored.kind, MessageKind::Eviction);
        assert_eq!(restored.address, 0x1c0);
        assert_eq!(restored.sender, 3);
        assert_eq!(restored.tokens, 4);
        assert!(restored.dirty);
        assert_eq!(restored.data, msg.data);
    }
}
