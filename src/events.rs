use std::collections::VecDeque;
use std::time::Duration;

use crate::error::PeerError;
use crate::wire::message::{
    AddrEntry, Block, BlockHeader, BlockTxnRequest, EncAckPacket, EncInitPacket, InvItem,
    MerkleBlockPacket, RejectPacket, SendCmpctPacket, Tx, UtxosPacket, VersionPacket,
};

/// Everything a session reports upward to its pool.
///
/// The session never touches pool state directly; cross-peer effects
/// (banning, host reputation, broadcast bookkeeping) are driven by the
/// pool reacting to these events. The set is closed: unknown wire
/// commands surface as [`Event::Unknown`], never as new variants at
/// runtime.
#[derive(Debug)]
pub enum Event {
    /// Transport is up; the handshake is starting.
    Connect,
    /// Version/verack exchange finished; the session is fully duplex.
    Ack,
    /// Terminal. Emitted exactly once, by `destroy`.
    Close,
    Error(PeerError),
    /// The peer misbehaved; `total` is the accumulated ban score the
    /// pool should act on at the ban threshold.
    Misbehaving { score: u32, total: u32 },

    Version(VersionPacket),
    Verack,
    /// Inbound ping (nonce echoed back automatically).
    Ping(Option<u64>),
    /// Matched pong; carries the measured round trip.
    Pong(Duration),
    /// Deduplicated addresses from an `addr` message.
    Addr(Vec<AddrEntry>),
    /// The raw announcement, followed by per-kind splits.
    Inv(Vec<InvItem>),
    Blocks(Vec<[u8; 32]>),
    Txs(Vec<[u8; 32]>),
    Block(Block),
    Tx(Tx),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    /// A reassembled filtered block: the merkleblock plus every matched
    /// transaction that followed it.
    MerkleBlock {
        packet: MerkleBlockPacket,
        txs: Vec<Tx>,
    },
    FeeFilter(i64),
    Reject(RejectPacket),
    Alert(Vec<u8>),
    NotFound(Vec<InvItem>),
    Utxos(UtxosPacket),
    HaveWitness,
    SendCmpct(SendCmpctPacket),
    GetBlockTxn(BlockTxnRequest),
    EncInit(EncInitPacket),
    EncAck(EncAckPacket),
    AuthChallenge([u8; 32]),
    AuthReply(Box<[u8; 64]>),
    AuthPropose([u8; 32]),
    Unknown { command: String },
}

/// The session's event sink.
///
/// The session owns the queue and pushes into it; the driving loop
/// drains it after every dispatch and forwards to the pool. Keeping it
/// a plain queue (instead of an emitter the session inherits from)
/// makes event order explicit and testable.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_emission_order() {
        let mut queue = EventQueue::new();
        queue.push(Event::Connect);
        queue.push(Event::Verack);
        queue.push(Event::Ack);

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0], Event::Connect));
        assert!(matches!(drained[1], Event::Verack));
        assert!(matches!(drained[2], Event::Ack));
        assert!(queue.is_empty());
    }
}
