//! BIP152 compact blocks, version 1 (txid-based short ids).
//!
//! An announcing peer sends a `cmpctblock` carrying the header, a
//! nonce, 6-byte short ids for most transactions and a few prefilled
//! ones (always at least the coinbase). The receiver matches short ids
//! against its mempool and requests whatever is left via `getblocktxn`.
//!
//! Short ids are SipHash-2-4 of the txid, keyed by the first 16 bytes
//! of SHA256(header ‖ nonce), truncated to 48 bits.
//!
//! https://github.com/bitcoin/bips/blob/master/bip-0152.mediawiki

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;

use crate::wire::message::{Block, BlockHeader, BlockTxnPacket, CompactBlockPacket, Encode, Tx};

const SHORT_ID_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Derives the SipHash key pair for a header/nonce combination.
fn sip_key(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut preimage = Vec::with_capacity(88);
    header.encode(&mut preimage);
    preimage.extend(&nonce.to_le_bytes());

    let digest = Sha256::digest(&preimage);
    let k0 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
    let k1 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
    (k0, k1)
}

fn short_id(key: (u64, u64), txid: &[u8; 32]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(key.0, key.1);
    hasher.write(txid);
    hasher.finish() & SHORT_ID_MASK
}

/// Builds the announce packet for a block.
///
/// The coinbase is always prefilled. Returns `None` when two
/// transactions collide on a short id under this nonce; the caller
/// retries with a fresh nonce.
pub fn build_packet(block: &Block, nonce: u64) -> Option<CompactBlockPacket> {
    let key = sip_key(&block.header, nonce);

    let mut short_ids = Vec::with_capacity(block.txs.len().saturating_sub(1));
    let mut seen = HashMap::with_capacity(block.txs.len());

    for (index, tx) in block.txs.iter().enumerate() {
        if index == 0 {
            continue;
        }
        let id = short_id(key, &tx.hash());
        if seen.insert(id, index).is_some() {
            return None;
        }
        short_ids.push(id);
    }

    Some(CompactBlockPacket {
        header: block.header.clone(),
        nonce,
        short_ids,
        prefilled: block
            .txs
            .first()
            .map(|coinbase| (0, coinbase.clone()))
            .into_iter()
            .collect(),
    })
}

/// Serves a `getblocktxn` request from a full block. `None` when an
/// index is out of range.
pub fn txn_response(block: &Block, indexes: &[u64]) -> Option<BlockTxnPacket> {
    let mut txs = Vec::with_capacity(indexes.len());
    for &index in indexes {
        txs.push(block.txs.get(index as usize)?.clone());
    }
    Some(BlockTxnPacket {
        hash: block.hash(),
        txs,
    })
}

/// A partially reconstructed compact block.
pub struct CompactBlock {
    pub header: BlockHeader,
    key: (u64, u64),
    /// short id -> slot, for the slots still waiting on a mempool hit.
    id_map: HashMap<u64, usize>,
    available: Vec<Option<Tx>>,
    filled: usize,
}

impl CompactBlock {
    /// Indexes the packet's short ids. `None` on a short-id collision
    /// inside the packet or a prefilled index out of range; either way
    /// the packet cannot be reconstructed.
    pub fn from_packet(packet: &CompactBlockPacket) -> Option<Self> {
        let total = packet.short_ids.len() + packet.prefilled.len();
        let mut available: Vec<Option<Tx>> = vec![None; total];
        let mut filled = 0;

        for (index, tx) in &packet.prefilled {
            let slot = available.get_mut(*index as usize)?;
            if slot.is_some() {
                return None;
            }
            *slot = Some(tx.clone());
            filled += 1;
        }

        let key = sip_key(&packet.header, packet.nonce);

        let mut id_map = HashMap::with_capacity(packet.short_ids.len());
        let mut cursor = 0;
        for &id in &packet.short_ids {
            // Skip over prefilled slots to find this id's position.
            while cursor < available.len() && available[cursor].is_some() {
                cursor += 1;
            }
            if cursor >= available.len() || id_map.insert(id, cursor).is_some() {
                return None;
            }
            cursor += 1;
        }

        Some(CompactBlock {
            header: packet.header.clone(),
            key,
            id_map,
            available,
            filled,
        })
    }

    pub fn hash(&self) -> [u8; 32] {
        self.header.hash()
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.available.len()
    }

    /// Matches candidate transactions (normally a mempool snapshot)
    /// against the outstanding short ids. Returns completeness.
    ///
    /// Two candidates mapping to one short id cannot be told apart, so
    /// the slot is cleared and left for `getblocktxn` (the BIP152
    /// collision rule).
    pub fn fill_candidates(&mut self, txs: impl Iterator<Item = Arc<Tx>>) -> bool {
        for tx in txs {
            let id = short_id(self.key, &tx.hash());
            let Some(&slot) = self.id_map.get(&id) else {
                continue;
            };

            match &self.available[slot] {
                None => {
                    self.available[slot] = Some((*tx).clone());
                    self.filled += 1;
                }
                Some(existing) if existing.hash() == tx.hash() => {}
                Some(_) => {
                    // Ambiguous short id; fetch this one explicitly.
                    self.available[slot] = None;
                    self.filled -= 1;
                    self.id_map.remove(&id);
                }
            }
        }

        self.is_complete()
    }

    /// Absolute indexes still missing, for a `getblocktxn` request.
    pub fn missing_indexes(&self) -> Vec<u64> {
        self.available
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u64)
            .collect()
    }

    /// Fills the remaining slots from a `blocktxn` response, in order.
    /// Returns false when the response has too few or too many
    /// transactions.
    pub fn fill_missing(&mut self, txs: Vec<Tx>) -> bool {
        let mut supplied = txs.into_iter();

        for slot in self.available.iter_mut() {
            if slot.is_some() {
                continue;
            }
            match supplied.next() {
                Some(tx) => {
                    *slot = Some(tx);
                    self.filled += 1;
                }
                None => return false,
            }
        }

        supplied.next().is_none() && self.is_complete()
    }

    /// Consumes the reconstruction into a full block; `None` when slots
    /// are still empty.
    pub fn into_block(self) -> Option<Block> {
        let txs: Option<Vec<Tx>> = self.available.into_iter().collect();
        Some(Block {
            header: self.header,
            txs: txs?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::{Decode, OutPoint};

    fn tx_with_marker(marker: u8) -> Tx {
        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&[marker; 32]);
        raw.extend(&0u32.to_le_bytes());
        raw.push(0);
        raw.extend(&0xFFFFFFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend(&(marker as u64 * 100).to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend(&0u32.to_le_bytes());
        Tx::decode(&raw).unwrap()
    }

    fn coinbase() -> Tx {
        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&OutPoint::null().to_bytes());
        raw.push(0);
        raw.extend(&0xFFFFFFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend(&5_000_000_000u64.to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend(&0u32.to_le_bytes());
        Tx::decode(&raw).unwrap()
    }

    fn sample_block(tx_count: u8) -> Block {
        let mut txs = vec![coinbase()];
        for marker in 1..tx_count {
            txs.push(tx_with_marker(marker));
        }
        Block {
            header: BlockHeader {
                version: 1,
                prev_blockhash: [0x10; 32],
                merkle_root: [0x20; 32],
                time: 1234567890,
                bits: 0x1d00ffff,
                nonce: 7,
            },
            txs,
        }
    }

    #[test]
    fn short_ids_are_48_bits_and_nonce_dependent() {
        let block = sample_block(4);
        let a = build_packet(&block, 1).unwrap();
        let b = build_packet(&block, 2).unwrap();

        for id in a.short_ids.iter().chain(b.short_ids.iter()) {
            assert!(*id <= SHORT_ID_MASK);
        }
        assert_ne!(a.short_ids, b.short_ids);
    }

    #[test]
    fn coinbase_is_prefilled() {
        let block = sample_block(4);
        let packet = build_packet(&block, 5).unwrap();

        assert_eq!(packet.prefilled.len(), 1);
        assert_eq!(packet.prefilled[0].0, 0);
        assert!(packet.prefilled[0].1.is_coinbase());
        assert_eq!(packet.short_ids.len(), 3);
    }

    #[test]
    fn full_mempool_reconstruction() {
        let block = sample_block(5);
        let packet = build_packet(&block, 11).unwrap();

        let mut partial = CompactBlock::from_packet(&packet).unwrap();
        assert!(!partial.is_complete());

        let mempool: Vec<Arc<Tx>> = block.txs[1..].iter().cloned().map(Arc::new).collect();
        assert!(partial.fill_candidates(mempool.into_iter()));

        let rebuilt = partial.into_block().unwrap();
        assert_eq!(rebuilt, block);
    }

    #[test]
    fn missing_txs_are_requested_and_filled() {
        let block = sample_block(5);
        let packet = build_packet(&block, 11).unwrap();

        let mut partial = CompactBlock::from_packet(&packet).unwrap();

        // Mempool knows everything except tx 2 and 4.
        let mempool: Vec<Arc<Tx>> = vec![Arc::new(block.txs[1].clone()), Arc::new(block.txs[3].clone())];
        assert!(!partial.fill_candidates(mempool.into_iter()));

        assert_eq!(partial.missing_indexes(), vec![2, 4]);

        let response = txn_response(&block, &[2, 4]).unwrap();
        assert!(partial.fill_missing(response.txs));

        assert_eq!(partial.into_block().unwrap(), block);
    }

    #[test]
    fn fill_missing_rejects_wrong_count() {
        let block = sample_block(4);
        let packet = build_packet(&block, 3).unwrap();

        let mut partial = CompactBlock::from_packet(&packet).unwrap();
        assert!(!partial.fill_missing(vec![block.txs[1].clone()]));
    }

    #[test]
    fn duplicate_short_ids_in_packet_are_a_collision() {
        let block = sample_block(3);
        let mut packet = build_packet(&block, 3).unwrap();
        packet.short_ids[1] = packet.short_ids[0];

        assert!(CompactBlock::from_packet(&packet).is_none());
    }

    #[test]
    fn unrelated_mempool_txs_do_not_fill_slots() {
        let block = sample_block(3);
        let packet = build_packet(&block, 9).unwrap();

        let mut partial = CompactBlock::from_packet(&packet).unwrap();
        let strangers: Vec<Arc<Tx>> =
            (100..110).map(|m| Arc::new(tx_with_marker(m))).collect();

        assert!(!partial.fill_candidates(strangers.into_iter()));
        assert_eq!(partial.missing_indexes().len(), 2);
    }

    #[test]
    fn txn_response_rejects_out_of_range_index() {
        let block = sample_block(3);
        assert!(txn_response(&block, &[0, 7]).is_none());
    }
}
