//! BIP37 partial merkle trees.
//!
//! A `merkleblock` proves which transactions of a block matched a bloom
//! filter without shipping the whole block. The serving side builds the
//! partial tree from the full txid list plus a match bitvec; the
//! receiving side extracts the matched txids and checks the recomputed
//! root against the block header.
//!
//! The traversal is the fixed depth-first walk from the BIP: one flag
//! bit per visited node, one hash per node whose subtree is not
//! descended into (and per matched leaf).
//!
//! https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki

use thiserror::Error;

use crate::wire::message::{double_sha256, MerkleBlockPacket};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("partial tree has no transactions")]
    Empty,
    #[error("partial tree ran out of {0}")]
    Truncated(&'static str),
    #[error("partial tree has unconsumed {0}")]
    Excess(&'static str),
    #[error("duplicate subtree hashes")]
    Duplicate,
    #[error("computed root does not match the header")]
    BadRoot,
}

/// Row width at the given height; height 0 is the txid row.
fn width(total: u32, height: u32) -> u32 {
    (total + (1 << height) - 1) >> height
}

/// Height of the row that contains exactly one node (the root).
fn tree_height(total: u32) -> u32 {
    let mut height = 0;
    while width(total, height) > 1 {
        height += 1;
    }
    height
}

/// Builds the partial tree for a block: returns (hashes, flag bytes)
/// ready for a `merkleblock` packet.
///
/// `matches` must be one flag per transaction.
pub fn build(txids: &[[u8; 32]], matches: &[bool]) -> (Vec<[u8; 32]>, Vec<u8>) {
    assert_eq!(txids.len(), matches.len());
    assert!(!txids.is_empty());

    let mut builder = Builder {
        txids,
        matches,
        bits: vec![],
        hashes: vec![],
    };

    let total = txids.len() as u32;
    builder.traverse(tree_height(total), 0);

    let mut flags = vec![0u8; (builder.bits.len() + 7) / 8];
    for (i, bit) in builder.bits.iter().enumerate() {
        if *bit {
            flags[i / 8] |= 1 << (i % 8);
        }
    }

    (builder.hashes, flags)
}

struct Builder<'a> {
    txids: &'a [[u8; 32]],
    matches: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<[u8; 32]>,
}

impl Builder<'_> {
    fn subtree_hash(&self, height: u32, pos: u32) -> [u8; 32] {
        if height == 0 {
            return self.txids[pos as usize];
        }

        let left = self.subtree_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < width(self.txids.len() as u32, height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1)
        } else {
            // Odd rows promote by pairing the last node with itself.
            left
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        double_sha256(&concat)
    }

    fn subtree_matches(&self, height: u32, pos: u32) -> bool {
        let start = (pos << height) as usize;
        let end = (((pos + 1) << height) as usize).min(self.matches.len());
        self.matches[start..end].iter().any(|&m| m)
    }

    fn traverse(&mut self, height: u32, pos: u32) {
        let parent_of_match = self.subtree_matches(height, pos);
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            self.hashes.push(self.subtree_hash(height, pos));
            return;
        }

        self.traverse(height - 1, pos * 2);
        if pos * 2 + 1 < width(self.txids.len() as u32, height - 1) {
            self.traverse(height - 1, pos * 2 + 1);
        }
    }
}

/// Walks a received partial tree, verifying the recomputed root against
/// the packet's header, and returns the matched (index, txid) pairs in
/// block order.
pub fn extract(packet: &MerkleBlockPacket) -> Result<Vec<(u32, [u8; 32])>, MerkleError> {
    if packet.total == 0 {
        return Err(MerkleError::Empty);
    }

    let mut bits = Vec::with_capacity(packet.flags.len() * 8);
    for byte in &packet.flags {
        for i in 0..8 {
            bits.push(byte & (1 << i) != 0);
        }
    }

    let mut extractor = Extractor {
        total: packet.total,
        bits: &bits,
        hashes: &packet.hashes,
        bit_cursor: 0,
        hash_cursor: 0,
        matches: vec![],
    };

    let root = extractor.traverse(tree_height(packet.total), 0)?;

    if extractor.hash_cursor != packet.hashes.len() {
        return Err(MerkleError::Excess("hashes"));
    }
    // Only padding bits inside the final byte may remain unused.
    if (extractor.bit_cursor + 7) / 8 != (bits.len() + 7) / 8 {
        return Err(MerkleError::Excess("flag bits"));
    }
    if root != packet.header.merkle_root {
        return Err(MerkleError::BadRoot);
    }

    Ok(extractor.matches)
}

struct Extractor<'a> {
    total: u32,
    bits: &'a [bool],
    hashes: &'a [[u8; 32]],
    bit_cursor: usize,
    hash_cursor: usize,
    matches: Vec<(u32, [u8; 32])>,
}

impl Extractor<'_> {
    fn next_bit(&mut self) -> Result<bool, MerkleError> {
        let bit = *self
            .bits
            .get(self.bit_cursor)
            .ok_or(MerkleError::Truncated("flag bits"))?;
        self.bit_cursor += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> Result<[u8; 32], MerkleError> {
        let hash = *self
            .hashes
            .get(self.hash_cursor)
            .ok_or(MerkleError::Truncated("hashes"))?;
        self.hash_cursor += 1;
        Ok(hash)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<[u8; 32], MerkleError> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matches.push((pos, hash));
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < width(self.total, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            // CVE-2012-2459: identical left/right subtrees allow two
            // distinct serializations of one root.
            if right == left {
                return Err(MerkleError::Duplicate);
            }
            right
        } else {
            left
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        Ok(double_sha256(&concat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::BlockHeader;

    fn txids(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[0] = i as u8;
                hash[1] = 0xA5;
                hash
            })
            .collect()
    }

    fn root_of(ids: &[[u8; 32]]) -> [u8; 32] {
        // Straight merkle root computation, independent of the partial
        // tree code paths under test.
        let mut row: Vec<[u8; 32]> = ids.to_vec();
        while row.len() > 1 {
            let mut next = vec![];
            for pair in row.chunks(2) {
                let left = pair[0];
                let right = if pair.len() == 2 { pair[1] } else { pair[0] };
                let mut concat = [0u8; 64];
                concat[..32].copy_from_slice(&left);
                concat[32..].copy_from_slice(&right);
                next.push(double_sha256(&concat));
            }
            row = next;
        }
        row[0]
    }

    fn packet_for(ids: &[[u8; 32]], matches: &[bool]) -> MerkleBlockPacket {
        let (hashes, flags) = build(ids, matches);
        MerkleBlockPacket {
            header: BlockHeader {
                version: 1,
                prev_blockhash: [0u8; 32],
                merkle_root: root_of(ids),
                time: 0,
                bits: 0x1d00ffff,
                nonce: 0,
            },
            total: ids.len() as u32,
            hashes,
            flags,
        }
    }

    #[test]
    fn single_tx_block_round_trips() {
        let ids = txids(1);
        let packet = packet_for(&ids, &[true]);

        let matches = extract(&packet).unwrap();
        assert_eq!(matches, vec![(0, ids[0])]);
    }

    #[test]
    fn build_then_extract_recovers_matched_txids() {
        for total in [2usize, 3, 5, 7, 8, 13] {
            let ids = txids(total);
            let mut matches = vec![false; total];
            matches[0] = true;
            matches[total / 2] = true;
            matches[total - 1] = true;

            let packet = packet_for(&ids, &matches);
            let extracted = extract(&packet).unwrap();

            let expected: Vec<(u32, [u8; 32])> = matches
                .iter()
                .enumerate()
                .filter(|(_, m)| **m)
                .map(|(i, _)| (i as u32, ids[i]))
                .collect();
            assert_eq!(extracted, expected, "total={}", total);
        }
    }

    #[test]
    fn no_matches_yields_empty_set_and_valid_root() {
        let ids = txids(6);
        let packet = packet_for(&ids, &[false; 6]);

        assert_eq!(extract(&packet).unwrap(), vec![]);
        // A no-match tree collapses to a single root hash.
        assert_eq!(packet.hashes.len(), 1);
    }

    #[test]
    fn wrong_root_is_rejected() {
        let ids = txids(4);
        let mut packet = packet_for(&ids, &[true, false, false, false]);
        packet.header.merkle_root = [0xEE; 32];

        assert_eq!(extract(&packet), Err(MerkleError::BadRoot));
    }

    #[test]
    fn truncated_hash_list_is_rejected() {
        let ids = txids(4);
        let mut packet = packet_for(&ids, &[true, false, true, false]);
        packet.hashes.pop();

        assert_eq!(extract(&packet), Err(MerkleError::Truncated("hashes")));
    }

    #[test]
    fn extra_hash_is_rejected() {
        let ids = txids(4);
        let mut packet = packet_for(&ids, &[true, false, false, false]);
        packet.hashes.push([0x77; 32]);

        assert_eq!(extract(&packet), Err(MerkleError::Excess("hashes")));
    }

    #[test]
    fn duplicate_subtree_attack_is_rejected() {
        // Hand-build a tree over 2 transactions where left == right,
        // the CVE-2012-2459 shape.
        let leaf = [0x42u8; 32];
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&leaf);
        concat[32..].copy_from_slice(&leaf);
        let root = double_sha256(&concat);

        let packet = MerkleBlockPacket {
            header: BlockHeader {
                version: 1,
                prev_blockhash: [0u8; 32],
                merkle_root: root,
                time: 0,
                bits: 0x1d00ffff,
                nonce: 0,
            },
            total: 2,
            hashes: vec![leaf, leaf],
            // root bit 1, then two leaves: one matched, one not
            flags: vec![0b0000_0011],
        };

        assert_eq!(extract(&packet), Err(MerkleError::Duplicate));
    }

    #[test]
    fn empty_tree_is_rejected() {
        let packet = MerkleBlockPacket {
            header: BlockHeader {
                version: 1,
                prev_blockhash: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            total: 0,
            hashes: vec![],
            flags: vec![],
        };
        assert_eq!(extract(&packet), Err(MerkleError::Empty));
    }
}
