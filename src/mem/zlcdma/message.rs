/*!
Messages of the token-priority protocol variant.

On top of plain token counting this variant distinguishes one *priority*
token per line, used to linearize racing writers, and marks tokens riding
on a non-priority acquisition as *transient*: such tokens exist only in
flight and cannot be pocketed until the priority token converts them.

`LocalDirNotification` keeps the subring directories honest: directories
count only permanent tokens crossing their boundary, so whenever a cache
moves tokens between a line and a transient message it reports the delta
to its local directory, which consumes the notification.
*/

use crate::mem::ring::NodeId;
use crate::mem::{MemAddr, WClientId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Read request; becomes the reply in place once data and tokens are
    /// attached, and continues to its sender.
    Read,
    /// Write upgrade: gather every token, invalidating other copies.
    AcquireTokens,
    /// Tokens (and data) leaving a cache.
    Eviction,
    /// Token-accounting delta for the local directory; consumed there.
    LocalDirNotification,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub address: MemAddr,
    pub sender: NodeId,
    pub tokens: u32,
    /// The priority token is among this message's tokens.
    pub priority: bool,
    /// Tokens on board are transient: gathered without priority backing.
    pub transient: bool,
    /// An `AcquireTokens` that was absorbed by the priority holder; the
    /// sender acknowledges its write and stands down.
    pub merged: bool,
    pub dirty: bool,
    pub ignore: bool,
    /// For notifications: the delta reduces the counter instead of
    /// increasing it.
    pub debit: bool,
    pub data: Vec<u8>,
    pub mask: Vec<bool>,
}

impl Message {
    pub fn new(kind: MessageKind, address: MemAddr, sender: NodeId, line_size: usize) -> Self {
        Message {
            kind,
            address,
            sender,
            tokens: 0,
            priority: false,
            transient: false,
            merged: false,
            dirty: false,
            ignore: false,
            debit: false,
            data: vec![0; line_size],
            mask: vec![false; line_size],
        }
    }

    /// Tokens a line may pocket outright. Transient tokens are invisible
    /// to the directories and cannot be stored.
    pub fn permanent_tokens(&self) -> u32 {
        if self.transient { 0 } else { self.tokens }
    }

    /// Whether this `Read` already carries a complete reply.
    pub fn is_reply(&self) -> bool {
        self.tokens > 0
    }

    pub fn merge_bytes(&mut self, data: &[u8], mask: &[bool]) {
        for i in 0..data.len() {
            if mask[i] && !self.mask[i] {
                self.data[i] = data[i];
                self.mask[i] = true;
            }
        }
    }

    pub fn describe(&self) -> String {
        let kind = match self.kind {
            MessageKind::Read => "RR",
            MessageKind::AcquireTokens => "AT",
            MessageKind::Eviction => "EV",
            MessageKind::LocalDirNotification => "DN",
        };
        format!(
            "{kind}[{:#x} from {} tokens={}{}{}{}{}]",
            self.address,
            self.sender,
            self.tokens,
            if self.priority { "P" } else { "" },
            if self.transient { "t" } else { "" },
            if self.dirty { " dirty" } else { "" },
            if self.ignore { " ignore" } else { "" },
        )
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

    #[test]
    fn transient_tokens_are_not_permanent() {
        let mut msg = Message::new(MessageKind::AcquireTokens, 0x40, 1, 4);
        msg.tokens = 3;
        msg.transient = true;
        assert_eq!(msg.permanent_tokens(), 0);
        msg.transient = false;
        assert_eq!(msg.permanent_tokens(), 3);
    }

    #[test]
    fn read_with_tokens_is_a_reply() {
        let mut msg = Message::new(MessageKind::Read, 0x40, 1, 4);
        assert!(!msg.is_reply());
        msg.tokens = 1;
        assert!(msg.is_reply());
    }
}
