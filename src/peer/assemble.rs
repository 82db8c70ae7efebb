//! Inbound reassembly: filtered blocks and compact blocks.
//!
//! A `merkleblock` is followed on the wire by its matched transactions;
//! the session collects them into a single upward event, flushing early
//! if any other packet interleaves. A `cmpctblock` is filled from the
//! mempool and, when that falls short, completed through a
//! `getblocktxn`/`blocktxn` round trip with a 10 s eviction timer.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::compact::CompactBlock;
use crate::events::Event;
use crate::merkle;
use crate::wire::message::{
    hash_hex, BlockTxnPacket, BlockTxnRequest, CompactBlockPacket, InvItem, MerkleBlockPacket,
    Packet, Tx,
};

use super::Peer;

/// How long a compact block slot waits for its `blocktxn`.
pub const COMPACT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct CompactSlot {
    pub block: CompactBlock,
    pub deadline: Instant,
}

/// The single in-flight merkleblock and the transactions collected for
/// it so far.
pub(crate) struct MerkleSlot {
    packet: MerkleBlockPacket,
    /// Matched txids still expected.
    want: Vec<[u8; 32]>,
    txs: Vec<Tx>,
}

impl Peer {
    // --- merkleblock --------------------------------------------------------

    pub(crate) fn handle_merkle_block(&mut self, packet: MerkleBlockPacket, _now: Instant) {
        if !self.options.spv {
            debug!(peer = %self.options.addr, "unsolicited merkleblock");
            return;
        }

        let matches = match merkle::extract(&packet) {
            Ok(matches) => matches,
            Err(err) => {
                debug!(peer = %self.options.addr, %err, "bad merkleblock");
                self.violation("invalid partial merkle tree", 100);
                return;
            }
        };

        self.requests.response(&Packet::MerkleBlock(packet.clone()));

        let want: Vec<[u8; 32]> = matches.into_iter().map(|(_, hash)| hash).collect();
        self.merkle_slot = Some(MerkleSlot {
            packet,
            want,
            txs: vec![],
        });

        if self.merkle_slot.as_ref().is_some_and(|slot| slot.want.is_empty()) {
            self.flush_merkle();
        }
    }

    /// Routes a tx either into the active merkle slot or upward.
    pub(crate) fn handle_tx(&mut self, tx: Tx) {
        if let Some(slot) = self.merkle_slot.as_mut() {
            let hash = tx.hash();
            if let Some(position) = slot.want.iter().position(|want| *want == hash) {
                slot.want.swap_remove(position);
                slot.txs.push(tx);

                if slot.want.is_empty() {
                    self.flush_merkle();
                }
                return;
            }
        }

        self.requests.response(&Packet::Tx(tx.clone()));
        self.events.push(Event::Tx(tx));
    }

    /// Emits the collected filtered block exactly once. Called when the
    /// last matched tx arrives or when any non-tx packet interleaves.
    pub(crate) fn flush_merkle(&mut self) {
        let Some(slot) = self.merkle_slot.take() else {
            return;
        };

        if !slot.want.is_empty() {
            debug!(
                peer = %self.options.addr,
                missing = slot.want.len(),
                "flushing merkleblock before all matched txs arrived"
            );
        }

        self.events.push(Event::MerkleBlock {
            packet: slot.packet,
            txs: slot.txs,
        });
    }

    // --- compact blocks -----------------------------------------------------

    pub(crate) fn handle_cmpct_block(&mut self, packet: CompactBlockPacket, now: Instant) {
        if self.compact_mode.is_none() {
            debug!(peer = %self.options.addr, "cmpctblock without sendcmpct negotiation");
            return;
        }
        let Some(mempool) = self.mempool.clone() else {
            debug!(peer = %self.options.addr, "cannot reconstruct compact blocks without a mempool");
            return;
        };

        let hash = packet.header.hash();
        if self.compact_slots.contains_key(&hash) {
            debug!(peer = %self.options.addr, block = %hash_hex(&hash), "duplicate compact block");
            return;
        }

        let Some(mut partial) = CompactBlock::from_packet(&packet) else {
            warn!(
                peer = %self.options.addr,
                block = %hash_hex(&hash),
                "short id collision; requesting the full block"
            );
            self.send(Packet::GetData(vec![InvItem::block(hash)]), now);
            return;
        };

        let candidates = mempool
            .snapshot()
            .into_iter()
            .filter_map(|txid| mempool.get_tx(&txid));
        if partial.fill_candidates(candidates) {
            let block = partial.into_block().expect("filled compact block");
            debug!(peer = %self.options.addr, block = %hash_hex(&hash), "compact block filled from mempool");
            self.events.push(Event::Block(block));
            return;
        }

        let indexes = partial.missing_indexes();
        debug!(
            peer = %self.options.addr,
            block = %hash_hex(&hash),
            missing = indexes.len(),
            "requesting missing compact block txs"
        );
        self.compact_slots.insert(
            hash,
            CompactSlot {
                block: partial,
                deadline: now + COMPACT_TIMEOUT,
            },
        );
        self.send(Packet::GetBlockTxn(BlockTxnRequest { hash, indexes }), now);
    }

    pub(crate) fn handle_block_txn(&mut self, packet: BlockTxnPacket, _now: Instant) {
        let Some(slot) = self.compact_slots.remove(&packet.hash) else {
            debug!(peer = %self.options.addr, block = %hash_hex(&packet.hash), "unsolicited blocktxn");
            return;
        };

        let mut partial = slot.block;
        if !partial.fill_missing(packet.txs) {
            self.violation("blocktxn failed to complete its compact block", 100);
            return;
        }

        let block = partial.into_block().expect("filled compact block");
        debug!(peer = %self.options.addr, block = %hash_hex(&packet.hash), "compact block completed");
        self.events.push(Event::Block(block));
    }
}
