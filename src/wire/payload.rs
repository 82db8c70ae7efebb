use byteorder::{LittleEndian, WriteBytesExt};
use std::net::IpAddr;

use crate::wire::message::{
    AddrEntry, Block, BlockHeader, BlockTxnPacket, BlockTxnRequest, Coin, CompactBlockPacket,
    EncAckPacket, EncInitPacket, Encode, FilterLoadPacket, GetUtxosPacket, InvItem,
    LocatorPacket, MerkleBlockPacket, NetAddr, Packet, RejectPacket, SendCmpctPacket, Tx,
    UtxosPacket, VersionPacket,
};

/// Writes a Bitcoin `CompactSize` (varint) to output.
///
/// This matches wire encoding used by inventory counts, vector lengths,
/// and many transaction/block fields.
///
/// Reference:
/// https://developer.bitcoin.org/reference/transactions.html#compactsize-unsigned-integers
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend(&value.to_le_bytes());
        }
    }
}

fn write_varbytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_varint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn write_varstr(s: &str, out: &mut Vec<u8>) {
    write_varbytes(s.as_bytes(), out);
}

/// Encodes the 26-byte NetAddr field used in version / addr payloads.
///
/// IPv4 addresses use the standard `::ffff:` mapping inside the 16-byte
/// IP field.
fn write_net_addr(addr: &NetAddr, out: &mut Vec<u8>) {
    out.extend(&addr.services.to_le_bytes());

    match addr.ip {
        IpAddr::V4(v4) => {
            out.extend(&[0u8; 10]);
            out.extend(&[0xFF, 0xFF]);
            out.extend(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.extend(&v6.octets());
        }
    }

    out.extend(&addr.port.to_be_bytes());
}

impl Encode for VersionPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.write_i32::<LittleEndian>(self.version).unwrap();
        out.write_u64::<LittleEndian>(self.services.bits()).unwrap();
        out.write_i64::<LittleEndian>(self.timestamp).unwrap();
        write_net_addr(&self.addr_recv, out);
        write_net_addr(&self.addr_from, out);
        out.write_u64::<LittleEndian>(self.nonce).unwrap();
        write_varstr(&self.user_agent, out);
        out.write_i32::<LittleEndian>(self.start_height).unwrap();
        if let Some(relay) = self.relay {
            out.push(relay as u8);
        }
    }
}

impl Encode for Vec<AddrEntry> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.len() as u64, out);
        for entry in self {
            out.extend(&entry.timestamp.to_le_bytes());
            write_net_addr(&entry.addr, out);
        }
    }
}

impl Encode for Vec<InvItem> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.len() as u64, out);
        for item in self {
            out.extend(&item.inv_type.to_le_bytes());
            out.extend(&item.hash);
        }
    }
}

impl Encode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.version.to_le_bytes());
        out.extend(&self.prev_blockhash);
        out.extend(&self.merkle_root);
        out.extend(&self.time.to_le_bytes());
        out.extend(&self.bits.to_le_bytes());
        out.extend(&self.nonce.to_le_bytes());
    }
}

impl Encode for Vec<BlockHeader> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.len() as u64, out);
        for header in self {
            header.encode(out);
            // txn_count, always zero in a headers message
            out.push(0);
        }
    }
}

impl Encode for LocatorPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.version.to_le_bytes());
        write_varint(self.locator.len() as u64, out);
        for hash in &self.locator {
            out.extend(hash);
        }
        out.extend(&self.stop);
    }
}

impl Encode for Tx {
    fn encode(&self, out: &mut Vec<u8>) {
        // The decoded raw bytes are the canonical serialization; no need
        // to rebuild them field by field.
        out.extend_from_slice(&self.raw);
    }
}

impl Encode for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        write_varint(self.txs.len() as u64, out);
        for tx in &self.txs {
            tx.encode(out);
        }
    }
}

impl Encode for RejectPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varstr(&self.message, out);
        out.push(self.code as u8);
        write_varstr(&self.reason, out);
        if let Some(hash) = self.hash {
            out.extend(&hash);
        }
    }
}

impl Encode for FilterLoadPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varbytes(&self.data, out);
        out.extend(&self.n_hash_funcs.to_le_bytes());
        out.extend(&self.tweak.to_le_bytes());
        out.push(self.flags);
    }
}

impl Encode for SendCmpctPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.mode);
        out.extend(&self.version.to_le_bytes());
    }
}

impl Encode for CompactBlockPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        out.extend(&self.nonce.to_le_bytes());

        write_varint(self.short_ids.len() as u64, out);
        for id in &self.short_ids {
            out.extend(&id.to_le_bytes()[..6]);
        }

        write_varint(self.prefilled.len() as u64, out);
        write_differential(
            self.prefilled.iter().map(|(index, _)| *index),
            out,
            |out, i| {
                let (_, tx) = &self.prefilled[i];
                tx.encode(out);
            },
        );
    }
}

impl Encode for BlockTxnRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.hash);
        write_varint(self.indexes.len() as u64, out);
        write_differential(self.indexes.iter().copied(), out, |_, _| {});
    }
}

impl Encode for BlockTxnPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.hash);
        write_varint(self.txs.len() as u64, out);
        for tx in &self.txs {
            tx.encode(out);
        }
    }
}

impl Encode for GetUtxosPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.check_mempool as u8);
        write_varint(self.prevouts.len() as u64, out);
        for prevout in &self.prevouts {
            out.extend(&prevout.to_bytes());
        }
    }
}

impl Encode for UtxosPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.height.to_le_bytes());
        out.extend(&self.tip);
        write_varbytes(&self.hits, out);
        write_varint(self.coins.len() as u64, out);
        for coin in &self.coins {
            coin.encode(out);
        }
    }
}

impl Encode for Coin {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.version.to_le_bytes());
        out.extend(&self.height.to_le_bytes());
        out.extend(&self.value.to_le_bytes());
        write_varbytes(&self.script, out);
    }
}

impl Encode for MerkleBlockPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        out.extend(&self.total.to_le_bytes());
        write_varint(self.hashes.len() as u64, out);
        for hash in &self.hashes {
            out.extend(hash);
        }
        write_varbytes(&self.flags, out);
    }
}

impl Encode for EncInitPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.pubkey);
        out.push(self.cipher);
    }
}

impl Encode for EncAckPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.pubkey);
    }
}

/// BIP152 differential index encoding: the first stored value is the
/// first index, each later one is the gap to the previous index minus
/// one. `trailer` lets cmpctblock interleave the prefilled transaction
/// after each index.
fn write_differential<I>(indexes: I, out: &mut Vec<u8>, mut trailer: impl FnMut(&mut Vec<u8>, usize))
where
    I: Iterator<Item = u64>,
{
    let mut last: Option<u64> = None;
    for (i, index) in indexes.enumerate() {
        let diff = match last {
            None => index,
            Some(prev) => index - prev - 1,
        };
        last = Some(index);
        write_varint(diff, out);
        trailer(out, i);
    }
}

impl Packet {
    /// Serializes this packet's payload (the bytes that follow the
    /// 24-byte frame header).
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::Version(p) => p.encode(&mut out),
            Packet::Verack => {}
            Packet::Ping(None) => {}
            Packet::Ping(Some(nonce)) => out.extend(&nonce.to_le_bytes()),
            Packet::Pong(nonce) => out.extend(&nonce.to_le_bytes()),
            Packet::GetAddr => {}
            Packet::Addr(entries) => entries.encode(&mut out),
            Packet::Inv(items) => items.encode(&mut out),
            Packet::GetData(items) => items.encode(&mut out),
            Packet::NotFound(items) => items.encode(&mut out),
            Packet::GetBlocks(p) => p.encode(&mut out),
            Packet::GetHeaders(p) => p.encode(&mut out),
            Packet::Headers(headers) => headers.encode(&mut out),
            Packet::SendHeaders => {}
            Packet::Block(block) => block.encode(&mut out),
            Packet::Tx(tx) => tx.encode(&mut out),
            Packet::Reject(p) => p.encode(&mut out),
            Packet::Mempool => {}
            Packet::FilterLoad(p) => p.encode(&mut out),
            Packet::FilterAdd(data) => write_varbytes(data, &mut out),
            Packet::FilterClear => {}
            Packet::FeeFilter(rate) => out.extend(&rate.to_le_bytes()),
            Packet::SendCmpct(p) => p.encode(&mut out),
            Packet::CmpctBlock(p) => p.encode(&mut out),
            Packet::GetBlockTxn(p) => p.encode(&mut out),
            Packet::BlockTxn(p) => p.encode(&mut out),
            Packet::GetUtxos(p) => p.encode(&mut out),
            Packet::Utxos(p) => p.encode(&mut out),
            Packet::HaveWitness => {}
            Packet::MerkleBlock(p) => p.encode(&mut out),
            Packet::Alert(payload) => out.extend_from_slice(payload),
            Packet::EncInit(p) => p.encode(&mut out),
            Packet::EncAck(p) => p.encode(&mut out),
            Packet::AuthChallenge(hash) => out.extend(hash),
            Packet::AuthReply(sig) => out.extend(sig.iter()),
            Packet::AuthPropose(hash) => out.extend(hash),
            Packet::Unknown { payload, .. } => out.extend_from_slice(payload),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::{Command, Decode, InventoryType, RawMessage, RejectCode, Services};

    fn round_trip(packet: Packet) -> Packet {
        let raw = RawMessage {
            command: packet.command(),
            raw_command: packet.command().as_bytes(),
            payload: packet.payload_bytes(),
            magic: [0xF9, 0xBE, 0xB4, 0xD9],
            checksum: [0; 4],
        };
        Packet::try_from(raw).unwrap()
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1234567890,
            bits: 0x1d00ffff,
            nonce: 42,
        }
    }

    fn sample_tx() -> Tx {
        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&[0x77; 32]);
        raw.extend(&0u32.to_le_bytes());
        raw.push(0);
        raw.extend(&0xFFFFFFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend(&5000u64.to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend(&0u32.to_le_bytes());
        Tx::decode(&raw).unwrap()
    }

    #[test]
    fn version_round_trips_with_ipv4_mapping() {
        let packet = Packet::Version(VersionPacket {
            version: 70015,
            services: Services::NODE_NETWORK | Services::NODE_WITNESS,
            timestamp: 1700000000,
            addr_recv: NetAddr {
                services: 1,
                ip: "93.184.216.34".parse().unwrap(),
                port: 8333,
            },
            addr_from: NetAddr {
                services: 9,
                ip: "2001:db8::1".parse().unwrap(),
                port: 8333,
            },
            nonce: 0xABCD,
            user_agent: "/btc-peer:0.1.0/".to_string(),
            start_height: 820000,
            relay: Some(true),
        });

        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn inv_and_getdata_round_trip() {
        let items = vec![
            InvItem::tx([0xAA; 32]),
            InvItem {
                inv_type: InventoryType::WitnessBlock,
                hash: [0xBB; 32],
            },
        ];

        assert_eq!(
            round_trip(Packet::Inv(items.clone())),
            Packet::Inv(items.clone())
        );
        assert_eq!(
            round_trip(Packet::GetData(items.clone())),
            Packet::GetData(items)
        );
    }

    #[test]
    fn locator_round_trips() {
        let packet = Packet::GetHeaders(LocatorPacket {
            version: 70015,
            locator: vec![[0x01; 32], [0x02; 32]],
            stop: [0u8; 32],
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn headers_round_trip() {
        let packet = Packet::Headers(vec![sample_header(), sample_header()]);
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn block_and_tx_round_trip() {
        let block = Block {
            header: sample_header(),
            txs: vec![sample_tx(), sample_tx()],
        };
        assert_eq!(
            round_trip(Packet::Block(block.clone())),
            Packet::Block(block)
        );
        assert_eq!(
            round_trip(Packet::Tx(sample_tx())),
            Packet::Tx(sample_tx())
        );
    }

    #[test]
    fn cmpctblock_round_trips_differential_indexes() {
        let packet = Packet::CmpctBlock(CompactBlockPacket {
            header: sample_header(),
            nonce: 99,
            short_ids: vec![1, 0xFFFF_FFFF_FFFF, 77],
            prefilled: vec![(0, sample_tx()), (3, sample_tx()), (7, sample_tx())],
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn getblocktxn_round_trips_indexes() {
        let packet = Packet::GetBlockTxn(BlockTxnRequest {
            hash: [0xEE; 32],
            indexes: vec![0, 1, 5, 20],
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn merkleblock_round_trips() {
        let packet = Packet::MerkleBlock(MerkleBlockPacket {
            header: sample_header(),
            total: 7,
            hashes: vec![[0x0A; 32], [0x0B; 32]],
            flags: vec![0b1011_0000],
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn reject_round_trips() {
        let packet = Packet::Reject(RejectPacket {
            message: "tx".to_string(),
            code: RejectCode::InsufficientFee,
            reason: "fee below feefilter".to_string(),
            hash: Some([0x99; 32]),
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn control_packets_have_empty_payloads() {
        for packet in [
            Packet::Verack,
            Packet::GetAddr,
            Packet::SendHeaders,
            Packet::Mempool,
            Packet::FilterClear,
            Packet::HaveWitness,
            Packet::Ping(None),
        ] {
            assert!(packet.payload_bytes().is_empty(), "{:?}", packet);
        }
    }

    #[test]
    fn ping_pong_round_trip() {
        assert_eq!(
            round_trip(Packet::Ping(Some(0xDEAD))),
            Packet::Ping(Some(0xDEAD))
        );
        assert_eq!(round_trip(Packet::Pong(0xBEEF)), Packet::Pong(0xBEEF));
    }

    #[test]
    fn filterload_and_feefilter_round_trip() {
        let filter = Packet::FilterLoad(FilterLoadPacket {
            data: vec![0xFF, 0x00, 0xAA],
            n_hash_funcs: 11,
            tweak: 7,
            flags: 0,
        });
        assert_eq!(round_trip(filter.clone()), filter);
        assert_eq!(
            round_trip(Packet::FeeFilter(1000)),
            Packet::FeeFilter(1000)
        );
    }

    #[test]
    fn getutxos_round_trips() {
        let packet = Packet::GetUtxos(GetUtxosPacket {
            check_mempool: true,
            prevouts: vec![crate::wire::message::OutPoint {
                hash: [0x21; 32],
                index: 4,
            }],
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn bip151_packets_round_trip() {
        let encinit = Packet::EncInit(EncInitPacket {
            pubkey: [0x02; 33],
            cipher: 0,
        });
        assert_eq!(round_trip(encinit.clone()), encinit);

        let encack = Packet::EncAck(EncAckPacket { pubkey: [0x03; 33] });
        assert_eq!(round_trip(encack.clone()), encack);

        let challenge = Packet::AuthChallenge([0x44; 32]);
        assert_eq!(round_trip(challenge.clone()), challenge);

        let reply = Packet::AuthReply(Box::new([0x55; 64]));
        assert_eq!(round_trip(reply.clone()), reply);
    }
}
