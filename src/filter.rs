//! BIP37 bloom filtering and the rolling dedup filters.
//!
//! The peer keeps two rolling filters of its own (address and inventory
//! dedup) and holds at most one [`BloomFilter`] installed by an SPV
//! remote via `filterload`. BIP37 fixes the hash construction exactly:
//! murmur3-32 with seed `n * 0xFBA4C795 + tweak` for the n-th hash
//! function.
//!
//! https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki

use crate::wire::constants::{MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS};
use crate::wire::message::{FilterLoadPacket, Tx};

const LN2: f64 = std::f64::consts::LN_2;

/// The BIP37 seed multiplier.
const SEED_MULT: u32 = 0xFBA4C795;

/// Murmur3 32-bit, the hash BIP37 prescribes.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().unwrap());
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k1 ^= (b as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;

    h1
}

/// A BIP37 bloom filter.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    data: Vec<u8>,
    n_hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Sizes a filter for `items` elements at the given false positive
    /// rate, using the BIP37 formulas and caps.
    pub fn from_rate(items: usize, rate: f64, tweak: u32, flags: u8) -> Self {
        let n = items.max(1) as f64;

        let bits = -n * rate.ln() / (LN2 * LN2);
        let size = ((bits / 8.0) as usize)
            .clamp(1, MAX_BLOOM_FILTER_SIZE);

        let n_hash_funcs = ((size as f64 * 8.0 / n * LN2) as u32)
            .clamp(1, MAX_BLOOM_HASH_FUNCS);

        BloomFilter {
            data: vec![0u8; size],
            n_hash_funcs,
            tweak,
            flags,
        }
    }

    /// Adopts a filter exactly as a remote peer declared it. The caller
    /// is responsible for checking [`BloomFilter::is_within_constraints`]
    /// first.
    pub fn from_packet(packet: &FilterLoadPacket) -> Self {
        BloomFilter {
            data: packet.data.clone(),
            n_hash_funcs: packet.n_hash_funcs,
            tweak: packet.tweak,
            flags: packet.flags,
        }
    }

    pub fn to_packet(&self) -> FilterLoadPacket {
        FilterLoadPacket {
            data: self.data.clone(),
            n_hash_funcs: self.n_hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }

    /// BIP37 size constraints; a `filterload` outside them is a
    /// bannable violation.
    pub fn is_within_constraints(packet: &FilterLoadPacket) -> bool {
        packet.data.len() <= MAX_BLOOM_FILTER_SIZE
            && packet.n_hash_funcs <= MAX_BLOOM_HASH_FUNCS
            && !packet.data.is_empty()
            && packet.n_hash_funcs > 0
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = n.wrapping_mul(SEED_MULT).wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for n in 0..self.n_hash_funcs {
            let bit = self.bit_index(n, data);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.n_hash_funcs).all(|n| {
            let bit = self.bit_index(n, data);
            self.data[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    /// BIP37 relevance test: does this transaction touch anything the
    /// filter watches?
    ///
    /// Tested elements, in the order light clients rely on: the txid,
    /// each output script's data pushes, each input's prevout, and each
    /// input script's data pushes.
    pub fn matches_tx(&self, tx: &Tx) -> bool {
        if self.contains(&tx.hash()) {
            return true;
        }

        for output in &tx.outputs {
            for push in script_pushes(&output.script) {
                if !push.is_empty() && self.contains(push) {
                    return true;
                }
            }
        }

        for input in &tx.inputs {
            if self.contains(&input.prevout.to_bytes()) {
                return true;
            }
            for push in script_pushes(&input.script) {
                if !push.is_empty() && self.contains(push) {
                    return true;
                }
            }
        }

        false
    }
}

/// Extracts every data element pushed by a script, tolerating trailing
/// garbage (scanning stops at the first malformed push, matching how
/// filter matching treats unparseable scripts).
fn script_pushes(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = vec![];
    let mut i = 0;

    while i < script.len() {
        let op = script[i];
        i += 1;

        let len = match op {
            1..=75 => op as usize,
            // OP_PUSHDATA1/2/4
            76 => {
                let Some(&l) = script.get(i) else { break };
                i += 1;
                l as usize
            }
            77 => {
                let Some(bytes) = script.get(i..i + 2) else {
                    break;
                };
                i += 2;
                u16::from_le_bytes(bytes.try_into().unwrap()) as usize
            }
            78 => {
                let Some(bytes) = script.get(i..i + 4) else {
                    break;
                };
                i += 4;
                u32::from_le_bytes(bytes.try_into().unwrap()) as usize
            }
            _ => continue,
        };

        let Some(push) = script.get(i..i + len) else {
            break;
        };
        i += len;
        pushes.push(push);
    }

    pushes
}

/// A two-generation rolling bloom filter.
///
/// Used for per-peer dedup of addr and inv announcements, where the set
/// is unbounded but only recent membership matters. Once the active
/// generation has seen `capacity` new elements it displaces the previous
/// generation, so an element is remembered for at least `capacity` and
/// at most `2 * capacity` inserts.
#[derive(Debug, Clone)]
pub struct RollingFilter {
    capacity: usize,
    count: usize,
    current: BloomFilter,
    previous: BloomFilter,
}

impl RollingFilter {
    pub fn new(items: usize, rate: f64) -> Self {
        use rand::Rng;

        let tweak: u32 = rand::thread_rng().r#gen();
        let fresh = BloomFilter::from_rate(items, rate, tweak, 0);

        RollingFilter {
            capacity: items.max(1),
            count: 0,
            current: fresh.clone(),
            previous: fresh,
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        self.current.contains(data) || self.previous.contains(data)
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.count >= self.capacity {
            std::mem::swap(&mut self.current, &mut self.previous);
            self.current.data.fill(0);
            self.count = 0;
        }
        self.current.insert(data);
        self.count += 1;
    }

    /// Inserts `data` and reports whether it was new. The dedup
    /// primitive the session uses everywhere.
    pub fn added(&mut self, data: &[u8]) -> bool {
        if self.contains(data) {
            return false;
        }
        self.insert(data);
        true
    }

    pub fn reset(&mut self) {
        self.current.data.fill(0);
        self.previous.data.fill(0);
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::{Encode, OutPoint, TxIn, TxOut};

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // --- murmur3 ------------------------------------------------------------
    //
    // Vectors from the reference implementation's verification suite.

    #[test]
    fn murmur3_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514E28B7);
        assert_eq!(murmur3_32(b"", 0xFFFF_FFFF), 0x81F16F39);
        assert_eq!(murmur3_32(&hex("21436587"), 0), 0xF55B516B);
        assert_eq!(murmur3_32(&hex("21436587"), 0x5082EDEE), 0x2362F9DE);
        assert_eq!(murmur3_32(&hex("214365"), 0), 0x7E4A8634);
        assert_eq!(murmur3_32(&hex("2143"), 0), 0xA0F7B07A);
        assert_eq!(murmur3_32(&hex("21"), 0), 0x72661CF4);
        assert_eq!(murmur3_32(&hex("ffffffff"), 0), 0x76293B50);
    }

    // --- bloom filter -------------------------------------------------------

    #[test]
    fn bloom_insert_and_contains() {
        let mut filter = BloomFilter::from_rate(3, 0.01, 0, 0);

        let a = hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8");
        filter.insert(&a);
        assert!(filter.contains(&a));

        // One bit different from `a`.
        let b = hex("19108ad8ed9bb6274d3980bab5a85c048f0950c8");
        assert!(!filter.contains(&b));
    }

    /// Bitcoin Core's serialization vector: three elements at rate 0.01,
    /// tweak 0, flags 1 serialize to 03614e9b050000000000000001.
    #[test]
    fn bloom_matches_core_serialization_vector() {
        let mut filter = BloomFilter::from_rate(3, 0.01, 0, 1);

        filter.insert(&hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8"));
        filter.insert(&hex("b5a2c786d9ef4658287ced5914b37a1b4aa32eee"));
        filter.insert(&hex("b9300670b4c5366e95b2699e8b18bc75e5f729c5"));

        assert_eq!(
            filter.to_packet().to_bytes(),
            hex("03614e9b050000000000000001")
        );
    }

    #[test]
    fn bloom_constraint_check() {
        let ok = FilterLoadPacket {
            data: vec![0u8; 100],
            n_hash_funcs: 10,
            tweak: 0,
            flags: 0,
        };
        assert!(BloomFilter::is_within_constraints(&ok));

        let oversized = FilterLoadPacket {
            data: vec![0u8; MAX_BLOOM_FILTER_SIZE + 1],
            n_hash_funcs: 10,
            tweak: 0,
            flags: 0,
        };
        assert!(!BloomFilter::is_within_constraints(&oversized));

        let too_many_hashes = FilterLoadPacket {
            data: vec![0u8; 100],
            n_hash_funcs: MAX_BLOOM_HASH_FUNCS + 1,
            tweak: 0,
            flags: 0,
        };
        assert!(!BloomFilter::is_within_constraints(&too_many_hashes));
    }

    // --- tx matching --------------------------------------------------------

    fn tx_paying(script: Vec<u8>) -> Tx {
        let input = TxIn {
            prevout: OutPoint {
                hash: [0xAB; 32],
                index: 2,
            },
            script: vec![],
            sequence: 0xFFFF_FFFF,
            witness: vec![],
        };
        let output = TxOut {
            value: 1000,
            script,
        };

        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&input.prevout.to_bytes());
        raw.push(0);
        raw.extend(&input.sequence.to_le_bytes());
        raw.push(1);
        raw.extend(&output.value.to_le_bytes());
        raw.push(output.script.len() as u8);
        raw.extend(&output.script);
        raw.extend(&0u32.to_le_bytes());

        Tx::from_parts(1, vec![input], vec![output], 0, raw)
    }

    #[test]
    fn matches_tx_by_txid() {
        let tx = tx_paying(vec![0x51]);
        let mut filter = BloomFilter::from_rate(10, 0.000001, 0, 0);
        filter.insert(&tx.hash());
        assert!(filter.matches_tx(&tx));
    }

    #[test]
    fn matches_tx_by_output_script_push() {
        // P2PKH-shaped: OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let pubkey_hash = hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8");
        let mut script = vec![0x76, 0xA9, 0x14];
        script.extend(&pubkey_hash);
        script.extend(&[0x88, 0xAC]);

        let tx = tx_paying(script);
        let mut filter = BloomFilter::from_rate(10, 0.000001, 0, 0);
        filter.insert(&pubkey_hash);
        assert!(filter.matches_tx(&tx));
    }

    #[test]
    fn matches_tx_by_prevout() {
        let tx = tx_paying(vec![0x51]);
        let mut filter = BloomFilter::from_rate(10, 0.000001, 0, 0);
        filter.insert(&tx.inputs[0].prevout.to_bytes());
        assert!(filter.matches_tx(&tx));
    }

    #[test]
    fn unrelated_tx_does_not_match() {
        let tx = tx_paying(vec![0x51]);
        let mut filter = BloomFilter::from_rate(10, 0.000001, 0, 0);
        filter.insert(b"something else entirely");
        assert!(!filter.matches_tx(&tx));
    }

    #[test]
    fn script_pushes_handles_pushdata_forms() {
        // direct push (2), OP_PUSHDATA1 (3), opcode noise between
        let mut script = vec![0x02, 0xAA, 0xBB];
        script.push(0x76); // OP_DUP, not a push
        script.extend(&[0x4C, 0x03, 0x01, 0x02, 0x03]);

        let pushes = script_pushes(&script);
        assert_eq!(pushes, vec![&[0xAA, 0xBB][..], &[0x01, 0x02, 0x03][..]]);
    }

    #[test]
    fn script_pushes_stops_at_truncated_push() {
        // claims 5 bytes, provides 2
        let script = vec![0x05, 0xAA, 0xBB];
        assert!(script_pushes(&script).is_empty());
    }

    // --- rolling filter -----------------------------------------------------

    #[test]
    fn rolling_added_reports_new_elements_once() {
        let mut filter = RollingFilter::new(100, 0.000001);
        assert!(filter.added(b"hash-1"));
        assert!(!filter.added(b"hash-1"));
        assert!(filter.added(b"hash-2"));
    }

    #[test]
    fn rolling_filter_forgets_after_two_generations() {
        let mut filter = RollingFilter::new(2, 0.000001);

        filter.insert(b"a");
        filter.insert(b"b"); // generation full
        filter.insert(b"c"); // rotates: {c} current, {a, b} previous
        assert!(filter.contains(b"a"));
        filter.insert(b"d"); // generation full again
        filter.insert(b"e"); // rotates: {a, b} dropped

        assert!(!filter.contains(b"a"));
        assert!(filter.contains(b"d"));
        assert!(filter.contains(b"e"));
    }

    #[test]
    fn rolling_reset_clears_everything() {
        let mut filter = RollingFilter::new(10, 0.001);
        filter.insert(b"x");
        filter.reset();
        assert!(!filter.contains(b"x"));
    }
}
