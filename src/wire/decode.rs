use std::io::{self};

use crate::wire::constants::{MAX_ADDRS, MAX_HEADERS, MAX_INV};
use crate::wire::message::{
    AddrEntry, Block, BlockHeader, BlockTxnPacket, BlockTxnRequest, Coin, Command,
    CompactBlockPacket, Decode, EncAckPacket, EncInitPacket, FilterLoadPacket, GetUtxosPacket,
    InvItem, InventoryType, LocatorPacket, MerkleBlockPacket, NetAddr, OutPoint, Packet,
    RawMessage, RejectCode, RejectPacket, SendCmpctPacket, Services, Tx, TxIn, TxOut,
    UtxosPacket, VersionPacket,
};

impl TryFrom<RawMessage> for Packet {
    type Error = io::Error;

    fn try_from(raw: RawMessage) -> io::Result<Self> {
        let p = &raw.payload[..];
        match raw.command {
            Command::Version => Ok(Packet::Version(VersionPacket::decode(p)?)),
            Command::Verack => Ok(Packet::Verack),
            Command::Addr => Ok(Packet::Addr(Vec::<AddrEntry>::decode(p)?)),
            Command::GetAddr => Ok(Packet::GetAddr),
            Command::Ping => Ok(Packet::Ping(decode_ping(p)?)),
            Command::Pong => Ok(Packet::Pong(read_u64(p, &mut 0)?)),
            Command::SendHeaders => Ok(Packet::SendHeaders),
            Command::SendCmpct => Ok(Packet::SendCmpct(SendCmpctPacket::decode(p)?)),
            Command::FeeFilter => Ok(Packet::FeeFilter(read_i64(p, &mut 0)?)),
            Command::Reject => Ok(Packet::Reject(RejectPacket::decode(p)?)),
            Command::Alert => Ok(Packet::Alert(raw.payload)),
            Command::Inv => Ok(Packet::Inv(Vec::<InvItem>::decode(p)?)),
            Command::GetData => Ok(Packet::GetData(Vec::<InvItem>::decode(p)?)),
            Command::NotFound => Ok(Packet::NotFound(Vec::<InvItem>::decode(p)?)),
            Command::GetBlocks => Ok(Packet::GetBlocks(LocatorPacket::decode(p)?)),
            Command::GetHeaders => Ok(Packet::GetHeaders(LocatorPacket::decode(p)?)),
            Command::Headers => Ok(Packet::Headers(Vec::<BlockHeader>::decode(p)?)),
            Command::Block => Ok(Packet::Block(Block::decode(p)?)),
            Command::Tx => Ok(Packet::Tx(Tx::decode(p)?)),
            Command::GetBlockTxn => Ok(Packet::GetBlockTxn(BlockTxnRequest::decode(p)?)),
            Command::BlockTxn => Ok(Packet::BlockTxn(BlockTxnPacket::decode(p)?)),
            Command::CmpctBlock => Ok(Packet::CmpctBlock(CompactBlockPacket::decode(p)?)),
            Command::Mempool => Ok(Packet::Mempool),
            Command::MerkleBlock => Ok(Packet::MerkleBlock(MerkleBlockPacket::decode(p)?)),
            Command::GetUtxos => Ok(Packet::GetUtxos(GetUtxosPacket::decode(p)?)),
            Command::Utxos => Ok(Packet::Utxos(UtxosPacket::decode(p)?)),
            Command::HaveWitness => Ok(Packet::HaveWitness),
            Command::FilterLoad => Ok(Packet::FilterLoad(FilterLoadPacket::decode(p)?)),
            Command::FilterAdd => Ok(Packet::FilterAdd(read_varbytes(p, &mut 0, "filteradd")?)),
            Command::FilterClear => Ok(Packet::FilterClear),
            Command::EncInit => Ok(Packet::EncInit(EncInitPacket::decode(p)?)),
            Command::EncAck => Ok(Packet::EncAck(EncAckPacket::decode(p)?)),
            Command::AuthChallenge => Ok(Packet::AuthChallenge(read_hash(p, &mut 0, "authchallenge")?)),
            Command::AuthReply => {
                let sig: [u8; 64] = p
                    .get(..64)
                    .ok_or_else(|| eof("authreply: signature"))?
                    .try_into()
                    .unwrap();
                Ok(Packet::AuthReply(Box::new(sig)))
            }
            Command::AuthPropose => Ok(Packet::AuthPropose(read_hash(p, &mut 0, "authpropose")?)),
            Command::Unknown => {
                let command = std::str::from_utf8(&raw.raw_command)
                    .unwrap_or("")
                    .trim_matches(char::from(0))
                    .to_string();
                Ok(Packet::Unknown {
                    command,
                    payload: raw.payload,
                })
            }
        }
    }
}

/// An empty `ping` payload is the pre-BIP31 form; otherwise the payload
/// carries an 8-byte nonce.
fn decode_ping(payload: &[u8]) -> io::Result<Option<u64>> {
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(read_u64(payload, &mut 0)?))
}

impl Decode for VersionPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let version = read_i32(payload, &mut c)?;
        let services = Services::from(read_u64(payload, &mut c)?);
        let timestamp = read_i64(payload, &mut c)?;
        let addr_recv = decode_net_addr(payload, &mut c)?;
        let addr_from = decode_net_addr(payload, &mut c)?;
        let nonce = read_u64(payload, &mut c)?;

        let ua_len = read_varint(payload, &mut c)? as usize;
        let user_agent = std::str::from_utf8(
            payload
                .get(c..c + ua_len)
                .ok_or_else(|| eof("version: user_agent"))?,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_string();
        c += ua_len;

        let start_height = read_i32(payload, &mut c)?;
        let relay = payload.get(c).map(|&b| b != 0);

        Ok(VersionPacket {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

impl Decode for Vec<AddrEntry> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        if count > MAX_ADDRS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "addr: exceeds 1000-entry limit",
            ));
        }

        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let timestamp = read_u32(payload, &mut c)?;
            let addr = decode_net_addr(payload, &mut c)?;
            entries.push(AddrEntry { timestamp, addr });
        }

        Ok(entries)
    }
}

impl Decode for Vec<InvItem> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        // One item past the protocol limit is still decoded so the
        // session can attribute the oversize to the peer and score it;
        // anything beyond that cannot be a good-faith message.
        if count > MAX_INV * 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "inv: absurd item count",
            ));
        }

        let mut items = Vec::with_capacity(count.min(MAX_INV + 1));

        for _ in 0..count {
            let type_raw = read_u32(payload, &mut c)?;
            // Unknown inventory types are carried through as Error so
            // the handler can log and skip them without dropping the
            // whole message.
            let inv_type = InventoryType::from_u32(type_raw).unwrap_or(InventoryType::Error);
            let hash = read_hash(payload, &mut c, "inv: hash")?;
            items.push(InvItem { inv_type, hash });
        }

        Ok(items)
    }
}

impl Decode for Vec<BlockHeader> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut cursor = 0;

        let count = read_varint(payload, &mut cursor)? as usize;

        // Same rationale as inv: decode one past the limit, reject the
        // absurd.
        if count > MAX_HEADERS * 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "headers: absurd entry count",
            ));
        }

        let mut headers = Vec::with_capacity(count.min(MAX_HEADERS + 1));

        // Each header consumes exactly 80 bytes (fixed-size structure),
        // followed by a CompactSize transaction count (always 0 in a
        // `headers` message). We advance the cursor accordingly.
        for _ in 0..count {
            headers.push(decode_block_header(payload, &mut cursor)?);

            // txn_count (always 0 in headers message)
            let _ = read_varint(payload, &mut cursor)?;
        }

        Ok(headers)
    }
}

impl Decode for LocatorPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let version = read_u32(payload, &mut c)?;
        let count = read_varint(payload, &mut c)? as usize;

        // A locator is logarithmic in chain height; ~64 covers any
        // conceivable chain and anything larger is hostile.
        if count > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "locator: too many hashes",
            ));
        }

        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(read_hash(payload, &mut c, "locator: hash")?);
        }

        let stop = read_hash(payload, &mut c, "locator: stop")?;

        Ok(LocatorPacket {
            version,
            locator,
            stop,
        })
    }
}

impl Decode for Tx {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let tx = decode_tx(payload, &mut c)?;
        Ok(tx)
    }
}

impl Decode for Block {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let header = decode_block_header(payload, &mut c)?;
        let count = read_varint(payload, &mut c)? as usize;

        let mut txs = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            txs.push(decode_tx(payload, &mut c)?);
        }

        Ok(Block { header, txs })
    }
}

impl Decode for SendCmpctPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let mode = read_u8(payload, &mut c, "sendcmpct: mode")?;
        let version = read_u64(payload, &mut c)?;
        Ok(SendCmpctPacket { mode, version })
    }
}

impl Decode for RejectPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let message = read_varstr(payload, &mut c, "reject: message")?;
        let code_raw = read_u8(payload, &mut c, "reject: code")?;
        let code = RejectCode::from_u8(code_raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "reject: unknown code"))?;
        let reason = read_varstr(payload, &mut c, "reject: reason")?;

        // `reject` carries the offending hash only when rejecting an
        // object-bearing command.
        let hash = if payload.len() - c >= 32 {
            Some(read_hash(payload, &mut c, "reject: hash")?)
        } else {
            None
        };

        Ok(RejectPacket {
            message,
            code,
            reason,
            hash,
        })
    }
}

impl Decode for FilterLoadPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        // No size cap here: the session scores peers that exceed the
        // BIP37 constraints, which requires seeing the declared size.
        let data = read_varbytes(payload, &mut c, "filterload: data")?;
        let n_hash_funcs = read_u32(payload, &mut c)?;
        let tweak = read_u32(payload, &mut c)?;
        let flags = read_u8(payload, &mut c, "filterload: flags")?;

        Ok(FilterLoadPacket {
            data,
            n_hash_funcs,
            tweak,
            flags,
        })
    }
}

impl Decode for MerkleBlockPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let header = decode_block_header(payload, &mut c)?;
        let total = read_u32(payload, &mut c)?;

        let count = read_varint(payload, &mut c)? as usize;
        if count > total as usize && count > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "merkleblock: more hashes than transactions",
            ));
        }

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(read_hash(payload, &mut c, "merkleblock: hash")?);
        }

        let flags = read_varbytes(payload, &mut c, "merkleblock: flags")?;

        Ok(MerkleBlockPacket {
            header,
            total,
            hashes,
            flags,
        })
    }
}

impl Decode for CompactBlockPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let header = decode_block_header(payload, &mut c)?;
        let nonce = read_u64(payload, &mut c)?;

        let id_count = read_varint(payload, &mut c)? as usize;
        let mut short_ids = Vec::with_capacity(id_count.min(1 << 16));
        for _ in 0..id_count {
            // 6-byte little-endian short id, widened to u64.
            let bytes = payload
                .get(c..c + 6)
                .ok_or_else(|| eof("cmpctblock: short id"))?;
            c += 6;
            let mut id = 0u64;
            for (i, &b) in bytes.iter().enumerate() {
                id |= (b as u64) << (8 * i);
            }
            short_ids.push(id);
        }

        let prefilled_count = read_varint(payload, &mut c)? as usize;
        let mut prefilled = Vec::with_capacity(prefilled_count.min(1 << 16));
        // Prefilled indexes are differential: each stored index is the
        // gap since the previous absolute index plus one.
        let mut last: Option<u64> = None;
        for _ in 0..prefilled_count {
            let diff = read_varint(payload, &mut c)?;
            let index = match last {
                None => diff,
                Some(prev) => prev
                    .checked_add(diff)
                    .and_then(|v| v.checked_add(1))
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "cmpctblock: index overflow")
                    })?,
            };
            last = Some(index);
            let tx = decode_tx(payload, &mut c)?;
            prefilled.push((index, tx));
        }

        Ok(CompactBlockPacket {
            header,
            nonce,
            short_ids,
            prefilled,
        })
    }
}

impl Decode for BlockTxnRequest {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let hash = read_hash(payload, &mut c, "getblocktxn: hash")?;
        let count = read_varint(payload, &mut c)? as usize;

        let mut indexes = Vec::with_capacity(count.min(1 << 16));
        let mut last: Option<u64> = None;
        for _ in 0..count {
            let diff = read_varint(payload, &mut c)?;
            let index = match last {
                None => diff,
                Some(prev) => prev
                    .checked_add(diff)
                    .and_then(|v| v.checked_add(1))
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "getblocktxn: index overflow")
                    })?,
            };
            last = Some(index);
            indexes.push(index);
        }

        Ok(BlockTxnRequest { hash, indexes })
    }
}

impl Decode for BlockTxnPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let hash = read_hash(payload, &mut c, "blocktxn: hash")?;
        let count = read_varint(payload, &mut c)? as usize;

        let mut txs = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            txs.push(decode_tx(payload, &mut c)?);
        }

        Ok(BlockTxnPacket { hash, txs })
    }
}

impl Decode for GetUtxosPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let check_mempool = read_u8(payload, &mut c, "getutxos: check_mempool")? != 0;
        let count = read_varint(payload, &mut c)? as usize;

        // The serve-side cap is 15; decode generously so the handler can
        // observe (and ignore) oversized queries.
        if count > 4096 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "getutxos: absurd prevout count",
            ));
        }

        let mut prevouts = Vec::with_capacity(count);
        for _ in 0..count {
            let hash = read_hash(payload, &mut c, "getutxos: prevout hash")?;
            let index = read_u32(payload, &mut c)?;
            prevouts.push(OutPoint { hash, index });
        }

        Ok(GetUtxosPacket {
            check_mempool,
            prevouts,
        })
    }
}

impl Decode for UtxosPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let height = read_u32(payload, &mut c)?;
        let tip = read_hash(payload, &mut c, "utxos: tip")?;
        let hits = read_varbytes(payload, &mut c, "utxos: bitmap")?;

        let count = read_varint(payload, &mut c)? as usize;
        let mut coins = Vec::with_capacity(count.min(1 << 10));
        for _ in 0..count {
            let version = read_i32(payload, &mut c)?;
            let coin_height = read_u32(payload, &mut c)?;
            let value = read_u64(payload, &mut c)?;
            let script = read_varbytes(payload, &mut c, "utxos: script")?;
            coins.push(Coin {
                version,
                height: coin_height,
                value,
                script,
            });
        }

        Ok(UtxosPacket {
            height,
            tip,
            hits,
            coins,
        })
    }
}

impl Decode for EncInitPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let pubkey: [u8; 33] = payload
            .get(c..c + 33)
            .ok_or_else(|| eof("encinit: pubkey"))?
            .try_into()
            .unwrap();
        c += 33;
        let cipher = read_u8(payload, &mut c, "encinit: cipher")?;

        Ok(EncInitPacket { pubkey, cipher })
    }
}

impl Decode for EncAckPacket {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let pubkey: [u8; 33] = payload
            .get(..33)
            .ok_or_else(|| eof("encack: pubkey"))?
            .try_into()
            .unwrap();
        Ok(EncAckPacket { pubkey })
    }
}

/// Decodes one transaction at the cursor, including BIP144 witness
/// serialization, and caches its txid.
pub fn decode_tx(p: &[u8], c: &mut usize) -> io::Result<Tx> {
    let start = *c;

    let version = read_i32(p, c)?;

    let mut count = read_varint(p, c)?;
    let mut segwit = false;

    // BIP144: a zero input count here is the segwit marker; the real
    // input count follows the 0x01 flag byte.
    if count == 0 {
        let flag = read_u8(p, c, "tx: segwit flag")?;
        if flag != 0x01 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "tx: invalid segwit flag",
            ));
        }
        segwit = true;
        count = read_varint(p, c)?;
    }

    if count > 1 << 16 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tx: absurd input count",
        ));
    }

    let mut inputs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let hash = read_hash(p, c, "tx: prevout hash")?;
        let index = read_u32(p, c)?;
        let script = read_varbytes(p, c, "tx: input script")?;
        let sequence = read_u32(p, c)?;
        inputs.push(TxIn {
            prevout: OutPoint { hash, index },
            script,
            sequence,
            witness: vec![],
        });
    }

    let out_count = read_varint(p, c)?;
    if out_count > 1 << 16 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tx: absurd output count",
        ));
    }

    let mut outputs = Vec::with_capacity(out_count as usize);
    for _ in 0..out_count {
        let value = read_u64(p, c)?;
        let script = read_varbytes(p, c, "tx: output script")?;
        outputs.push(TxOut { value, script });
    }

    if segwit {
        for input in &mut inputs {
            let items = read_varint(p, c)? as usize;
            let mut witness = Vec::with_capacity(items.min(1 << 8));
            for _ in 0..items {
                witness.push(read_varbytes(p, c, "tx: witness item")?);
            }
            input.witness = witness;
        }
    }

    let locktime = read_u32(p, c)?;

    let raw = p[start..*c].to_vec();

    Ok(Tx::from_parts(version, inputs, outputs, locktime, raw))
}

pub fn decode_block_header(p: &[u8], c: &mut usize) -> io::Result<BlockHeader> {
    let version = read_i32(p, c)?;
    let prev_blockhash = read_hash(p, c, "header: prev_blockhash")?;
    let merkle_root = read_hash(p, c, "header: merkle_root")?;
    let time = read_u32(p, c)?;
    let bits = read_u32(p, c)?;
    let nonce = read_u32(p, c)?;

    Ok(BlockHeader {
        version,
        prev_blockhash,
        merkle_root,
        time,
        bits,
        nonce,
    })
}

fn decode_net_addr(p: &[u8], c: &mut usize) -> io::Result<NetAddr> {
    let services = read_u64(p, c)?;

    let ip_bytes: [u8; 16] = p
        .get(*c..*c + 16)
        .ok_or_else(|| eof("net_addr: ip"))?
        .try_into()
        .unwrap();
    *c += 16;

    let port = u16::from_be_bytes(slice2(p, c, "net_addr: port")?);

    // IPv4 travels inside the 16-byte field either as the standard
    // ::ffff: mapping (10 zeros + 0xFF 0xFF) or, from sloppy peers, as
    // 12 leading zeros.
    let ip = if ip_bytes[..12] == [0u8; 12]
        || (ip_bytes[..10] == [0u8; 10] && ip_bytes[10] == 0xFF && ip_bytes[11] == 0xFF)
    {
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(
            ip_bytes[12],
            ip_bytes[13],
            ip_bytes[14],
            ip_bytes[15],
        ))
    } else {
        std::net::IpAddr::V6(std::net::Ipv6Addr::from(ip_bytes))
    };

    Ok(NetAddr { services, ip, port })
}

fn eof(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, context)
}

pub fn read_varint(p: &[u8], c: &mut usize) -> io::Result<u64> {
    let first = *p.get(*c).ok_or_else(|| eof("varint"))?;
    *c += 1;
    match first {
        0xFD => {
            let v = u16::from_le_bytes(slice2(p, c, "varint:fd")?);
            Ok(v as u64)
        }
        0xFE => {
            let v = u32::from_le_bytes(slice4(p, c, "varint:fe")?);
            Ok(v as u64)
        }
        0xFF => {
            let v = u64::from_le_bytes(slice8(p, c, "varint:ff")?);
            Ok(v)
        }
        n => Ok(n as u64),
    }
}

fn read_u8(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<u8> {
    let b = *p.get(*c).ok_or_else(|| eof(ctx))?;
    *c += 1;
    Ok(b)
}

fn read_i32(p: &[u8], c: &mut usize) -> io::Result<i32> {
    Ok(i32::from_le_bytes(slice4(p, c, "i32")?))
}
fn read_i64(p: &[u8], c: &mut usize) -> io::Result<i64> {
    Ok(i64::from_le_bytes(slice8(p, c, "i64")?))
}
fn read_u32(p: &[u8], c: &mut usize) -> io::Result<u32> {
    Ok(u32::from_le_bytes(slice4(p, c, "u32")?))
}
fn read_u64(p: &[u8], c: &mut usize) -> io::Result<u64> {
    Ok(u64::from_le_bytes(slice8(p, c, "u64")?))
}

fn read_hash(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 32]> {
    let b: [u8; 32] = p
        .get(*c..*c + 32)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 32;
    Ok(b)
}

fn read_varbytes(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<Vec<u8>> {
    let len = read_varint(p, c)? as usize;
    let bytes = p.get(*c..*c + len).ok_or_else(|| eof(ctx))?.to_vec();
    *c += len;
    Ok(bytes)
}

fn read_varstr(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<String> {
    let bytes = read_varbytes(p, c, ctx)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn slice2(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 2]> {
    let b = p
        .get(*c..*c + 2)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 2;
    Ok(b)
}

fn slice4(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 4]> {
    let b = p
        .get(*c..*c + 4)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 4;
    Ok(b)
}

fn slice8(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 8]> {
    let b = p
        .get(*c..*c + 8)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 8;
    Ok(b)
}
