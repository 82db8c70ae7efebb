use sha2::{Digest, Sha256};
use std::fmt::{Debug, Formatter, Result};
use std::io::{self};

/// Double SHA256 as used for block ids, txids, merkle nodes and frame
/// checksums.
///
/// Bitcoin uses double SHA256 to reduce structural weaknesses in
/// single-round SHA256 and to harden against length-extension attacks.
/// This construction is consensus-critical and cannot be changed.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(Sha256::digest(data));
    let mut out = [0u8; 32];
    out.copy_from_slice(&hash);
    out
}

/// Renders a hash the way block explorers do: byte-reversed hex.
pub fn hash_hex(hash: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in hash.iter().rev() {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// A raw Bitcoin P2P message frame.
///
/// This struct represents a message as transmitted on the wire
/// according to the Bitcoin P2P protocol (https://developer.bitcoin.org/reference/p2p_networking.html#message-headers).
///
/// A Bitcoin message frame consists of:
/// - 4-byte magic value (network identifier)
/// - 12-byte command
/// - 4-byte payload length
/// - 4-byte checksum
/// - variable-length payload (up to 32MB)
///
/// `RawMessage` contains the decoded header fields and payload,
/// but does not yet interpret the payload.
#[derive(Debug)]
pub struct RawMessage {
    pub command: Command,
    /// The original 12-byte command field; kept so unknown commands can
    /// be reported upward by name.
    pub raw_command: [u8; 12],
    pub payload: Vec<u8>,
    pub magic: [u8; 4],
    pub checksum: [u8; 4],
}

/// Implemented by types that can be decoded from a raw Bitcoin message payload.
pub trait Decode: Sized {
    fn decode(payload: &[u8]) -> io::Result<Self>;
}

/// Implemented by types that serialize into a Bitcoin message payload.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Every command the session dispatches on.
///
/// See:
/// https://developer.bitcoin.org/reference/p2p_networking.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Control
    Version,
    Verack,
    Addr,
    GetAddr,
    Ping,
    Pong,
    SendHeaders,
    SendCmpct,
    FeeFilter,
    Reject,
    Alert,
    // Data
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    Block,
    Tx,
    GetBlockTxn,
    BlockTxn,
    CmpctBlock,
    Mempool,
    MerkleBlock,
    GetUtxos,
    Utxos,
    HaveWitness,
    // Bloom filter
    FilterLoad,
    FilterAdd,
    FilterClear,
    // Encrypted transport (BIP151) and peer auth (BIP150)
    EncInit,
    EncAck,
    AuthChallenge,
    AuthReply,
    AuthPropose,

    Unknown,
}

impl From<&[u8; 12]> for Command {
    fn from(bytes: &[u8; 12]) -> Self {
        let cmd = std::str::from_utf8(bytes)
            .unwrap_or("")
            .trim_matches(char::from(0));

        match cmd {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "addr" => Command::Addr,
            "getaddr" => Command::GetAddr,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "sendheaders" => Command::SendHeaders,
            "sendcmpct" => Command::SendCmpct,
            "feefilter" => Command::FeeFilter,
            "reject" => Command::Reject,
            "alert" => Command::Alert,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "notfound" => Command::NotFound,
            "getblocks" => Command::GetBlocks,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "block" => Command::Block,
            "tx" => Command::Tx,
            "getblocktxn" => Command::GetBlockTxn,
            "blocktxn" => Command::BlockTxn,
            "cmpctblock" => Command::CmpctBlock,
            "mempool" => Command::Mempool,
            "merkleblock" => Command::MerkleBlock,
            "getutxos" => Command::GetUtxos,
            "utxos" => Command::Utxos,
            "havewitness" => Command::HaveWitness,
            "filterload" => Command::FilterLoad,
            "filteradd" => Command::FilterAdd,
            "filterclear" => Command::FilterClear,
            "encinit" => Command::EncInit,
            "encack" => Command::EncAck,
            // "authchallenge" is 13 ASCII bytes; the 12-byte command
            // field truncates it on the wire.
            "authchalleng" => Command::AuthChallenge,
            "authreply" => Command::AuthReply,
            "authpropose" => Command::AuthPropose,
            _ => Command::Unknown,
        }
    }
}

impl Command {
    /// Returns the 12-byte command field as defined by the Bitcoin P2P protocol.
    ///
    /// The command string is ASCII and padded with zero bytes.
    pub fn as_bytes(&self) -> [u8; 12] {
        let name: &[u8] = match self {
            Command::Version => b"version",
            Command::Verack => b"verack",
            Command::Addr => b"addr",
            Command::GetAddr => b"getaddr",
            Command::Ping => b"ping",
            Command::Pong => b"pong",
            Command::SendHeaders => b"sendheaders",
            Command::SendCmpct => b"sendcmpct",
            Command::FeeFilter => b"feefilter",
            Command::Reject => b"reject",
            Command::Alert => b"alert",
            Command::Inv => b"inv",
            Command::GetData => b"getdata",
            Command::NotFound => b"notfound",
            Command::GetBlocks => b"getblocks",
            Command::GetHeaders => b"getheaders",
            Command::Headers => b"headers",
            Command::Block => b"block",
            Command::Tx => b"tx",
            Command::GetBlockTxn => b"getblocktxn",
            Command::BlockTxn => b"blocktxn",
            Command::CmpctBlock => b"cmpctblock",
            Command::Mempool => b"mempool",
            Command::MerkleBlock => b"merkleblock",
            Command::GetUtxos => b"getutxos",
            Command::Utxos => b"utxos",
            Command::HaveWitness => b"havewitness",
            Command::FilterLoad => b"filterload",
            Command::FilterAdd => b"filteradd",
            Command::FilterClear => b"filterclear",
            Command::EncInit => b"encinit",
            Command::EncAck => b"encack",
            Command::AuthChallenge => &b"authchallenge"[..12],
            Command::AuthReply => b"authreply",
            Command::AuthPropose => b"authpropose",
            Command::Unknown => b"",
        };

        let mut padded = [0u8; 12];
        padded[..name.len()].copy_from_slice(name);
        padded
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub services: u64,
    pub ip: std::net::IpAddr,
    pub port: u16,
}

/// Decoded `version` payload.
///
/// https://developer.bitcoin.org/reference/p2p_networking.html#version
#[derive(Debug, Clone, PartialEq)]
pub struct VersionPacket {
    pub version: i32,
    pub services: Services,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddrEntry {
    pub timestamp: u32,
    pub addr: NetAddr,
}

/// A Bitcoin block header (exactly 80 bytes on the wire).
///
/// The header is defined by the Bitcoin P2P protocol and is transmitted
/// inside `block` and `headers` messages.
///
/// Layout (little-endian fields unless otherwise noted):
///
/// ```text
/// 4  bytes  version
/// 32 bytes  previous block hash
/// 32 bytes  merkle root
/// 4  bytes  timestamp (Unix epoch)
/// 4  bytes  nBits (compact target encoding)
/// 4  bytes  nonce
/// ```
///
/// Total: 80 bytes
///
/// Reference:
/// https://developer.bitcoin.org/reference/block_chain.html#block-headers
///
/// In `headers` messages, each header is followed by a CompactSize
/// transaction count (always zero). The transaction data is NOT included.
/// See:
/// https://developer.bitcoin.org/reference/p2p_networking.html#headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Computes the block header hash (block ID).
    ///
    /// The block hash is defined as: SHA256(SHA256(header_bytes))
    ///
    /// The returned hash is in little-endian byte order, matching the
    /// internal representation used on the wire. For human-readable
    /// display (block explorers), the bytes must be reversed.
    pub fn hash(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(80);

        bytes.extend(&self.version.to_le_bytes());
        bytes.extend(&self.prev_blockhash);
        bytes.extend(&self.merkle_root);
        bytes.extend(&self.time.to_le_bytes());
        bytes.extend(&self.bits.to_le_bytes());
        bytes.extend(&self.nonce.to_le_bytes());

        double_sha256(&bytes)
    }
}

/// Reference to one output of a prior transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub hash: [u8; 32],
    pub index: u32,
}

impl OutPoint {
    /// The all-zero prevout only coinbase inputs carry.
    pub fn null() -> Self {
        OutPoint {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash == [0u8; 32]
    }

    /// 36-byte wire serialization, also used as a bloom filter element.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.hash);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
    /// Witness stack (BIP144); empty for legacy inputs.
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script: Vec<u8>,
}

/// A decoded Bitcoin transaction.
///
/// The txid is computed once at decode/build time over the
/// witness-stripped serialization (BIP141) and cached, because the
/// session reuses it constantly: inv dedup, merkleblock matching,
/// compact block short ids, and the frame checksum of outgoing `tx`
/// packets (the checksum of a tx payload is the first four bytes of its
/// txid).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
    /// The full wire serialization, witness included when present.
    pub raw: Vec<u8>,
    hash: [u8; 32],
    witness_hash: [u8; 32],
}

impl Tx {
    pub fn from_parts(
        version: i32,
        inputs: Vec<TxIn>,
        outputs: Vec<TxOut>,
        locktime: u32,
        raw: Vec<u8>,
    ) -> Self {
        let mut tx = Tx {
            version,
            inputs,
            outputs,
            locktime,
            raw,
            hash: [0u8; 32],
            witness_hash: [0u8; 32],
        };
        tx.witness_hash = double_sha256(&tx.raw);
        tx.hash = if tx.has_witness() {
            double_sha256(&tx.stripped_bytes())
        } else {
            tx.witness_hash
        };
        tx
    }

    /// Cached txid (little-endian byte order).
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Cached wtxid: the double SHA256 of the full serialization. Equal
    /// to [`Tx::hash`] for legacy transactions. The first four bytes are
    /// the frame checksum of an outgoing `tx` packet.
    pub fn witness_hash(&self) -> [u8; 32] {
        self.witness_hash
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Serialization without the segwit marker, flag and witness stacks;
    /// the txid preimage.
    fn stripped_bytes(&self) -> Vec<u8> {
        use crate::wire::payload::write_varint;

        if !self.has_witness() {
            return self.raw.clone();
        }

        let mut out = Vec::with_capacity(self.raw.len());
        out.extend(&self.version.to_le_bytes());
        write_varint(self.inputs.len() as u64, &mut out);
        for input in &self.inputs {
            out.extend(&input.prevout.to_bytes());
            write_varint(input.script.len() as u64, &mut out);
            out.extend(&input.script);
            out.extend(&input.sequence.to_le_bytes());
        }
        write_varint(self.outputs.len() as u64, &mut out);
        for output in &self.outputs {
            out.extend(&output.value.to_le_bytes());
            write_varint(output.script.len() as u64, &mut out);
            out.extend(&output.script);
        }
        out.extend(&self.locktime.to_le_bytes());
        out
    }
}

/// A block as carried by the `block` message: header plus the full
/// transaction list.
///
/// Reference (serialized block format):
/// https://developer.bitcoin.org/reference/block_chain.html#serialized-blocks
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn hash(&self) -> [u8; 32] {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<[u8; 32]> {
        self.txs.iter().map(|tx| tx.hash()).collect()
    }
}

/// Service flags as defined by the Bitcoin P2P protocol.
///
/// This is a bitfield (`u64`) transmitted in the `version` message.
/// Each bit represents a capability supported by the node.
///
/// Official reference:
/// https://developer.bitcoin.org/reference/p2p_networking.html#version
///
/// The flags are forward-compatible: unknown bits must be preserved.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Services(u64);

impl Services {
    /// Creates a new `Services` from raw bits.
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bitfield value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true if all bits in `other` are set.
    pub const fn contains(self, other: Services) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    // ---- Assigned Service Flags ----

    /// 0x00 — Unnamed
    ///
    /// This node is not a full node.
    /// It may not be able to provide any data except for transactions it originates.
    pub const NONE: Services = Services(0x00);

    /// 0x01 — NODE_NETWORK
    ///
    /// This is a full node and can be asked for full blocks.
    /// It should implement all protocol features available in
    /// its self-reported protocol version.
    pub const NODE_NETWORK: Services = Services(0x01);

    /// 0x02 — NODE_GETUTXO
    ///
    /// This node can respond to `getutxos` requests.
    /// Defined in BIP64.
    pub const NODE_GETUTXO: Services = Services(0x02);

    /// 0x04 — NODE_BLOOM
    ///
    /// Supports bloom-filtered connections.
    /// Defined in BIP111.
    pub const NODE_BLOOM: Services = Services(0x04);

    /// 0x08 — NODE_WITNESS
    ///
    /// Can provide blocks and transactions including witness data.
    /// Defined in BIP144.
    pub const NODE_WITNESS: Services = Services(0x08);

    /// 0x0400 — NODE_NETWORK_LIMITED
    ///
    /// Same as NODE_NETWORK but guarantees at least the last 288 blocks
    /// (~2 days).
    /// Defined in BIP159.
    pub const NODE_NETWORK_LIMITED: Services = Services(0x0400);

    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();

        if self.is_empty() {
            names.push("NONE");
            return names;
        }

        if self.contains(Self::NODE_NETWORK) {
            names.push("NODE_NETWORK");
        }
        if self.contains(Self::NODE_GETUTXO) {
            names.push("NODE_GETUTXO");
        }
        if self.contains(Self::NODE_BLOOM) {
            names.push("NODE_BLOOM");
        }
        if self.contains(Self::NODE_WITNESS) {
            names.push("NODE_WITNESS");
        }
        if self.contains(Self::NODE_NETWORK_LIMITED) {
            names.push("NODE_NETWORK_LIMITED");
        }

        names
    }
}

impl From<u64> for Services {
    fn from(value: u64) -> Self {
        Services::new(value)
    }
}

impl std::ops::BitOr for Services {
    type Output = Services;

    fn bitor(self, rhs: Services) -> Services {
        Services(self.0 | rhs.0)
    }
}

impl Debug for Services {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if self.is_empty() {
            return write!(f, "Services(NONE)");
        }

        let names = self.names().join(" | ");

        write!(f, "Services({}) [0x{:016x}]", names, self.bits())
    }
}

/// Inventory object types used in `inv`, `getdata`, and `notfound` messages.
///
/// Defined by the Bitcoin P2P protocol:
/// https://developer.bitcoin.org/reference/p2p_networking.html#data-messages
///
/// These values are serialized as little-endian 32-bit unsigned integers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryType {
    /// Error / undefined type.
    Error = 0,

    /// Transaction (legacy txid-based).
    Tx = 1,

    /// Full block.
    Block = 2,

    /// Filtered block (BIP37).
    FilteredBlock = 3,

    /// Compact block (BIP152).
    CompactBlock = 4,

    /// Witness transaction (BIP144).
    WitnessTx = 0x40000001,

    /// Witness block (BIP144).
    WitnessBlock = 0x40000002,

    /// Witness filtered block (BIP144).
    WitnessFilteredBlock = 0x40000003,
}

impl InventoryType {
    /// Serialize the inventory type to little-endian bytes for wire usage.
    pub fn to_le_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(InventoryType::Error),
            1 => Some(InventoryType::Tx),
            2 => Some(InventoryType::Block),
            3 => Some(InventoryType::FilteredBlock),
            4 => Some(InventoryType::CompactBlock),
            0x40000001 => Some(InventoryType::WitnessTx),
            0x40000002 => Some(InventoryType::WitnessBlock),
            0x40000003 => Some(InventoryType::WitnessFilteredBlock),
            _ => None,
        }
    }
}

/// One (type, hash) announcement as carried by `inv`, `getdata` and
/// `notfound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InventoryType,
    pub hash: [u8; 32],
}

impl InvItem {
    pub fn tx(hash: [u8; 32]) -> Self {
        InvItem {
            inv_type: InventoryType::Tx,
            hash,
        }
    }

    pub fn block(hash: [u8; 32]) -> Self {
        InvItem {
            inv_type: InventoryType::Block,
            hash,
        }
    }

    pub fn is_tx(&self) -> bool {
        matches!(
            self.inv_type,
            InventoryType::Tx | InventoryType::WitnessTx
        )
    }

    pub fn is_block(&self) -> bool {
        matches!(
            self.inv_type,
            InventoryType::Block
                | InventoryType::FilteredBlock
                | InventoryType::CompactBlock
                | InventoryType::WitnessBlock
                | InventoryType::WitnessFilteredBlock
        )
    }
}

/// BIP61 reject categories.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    NonStandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

impl RejectCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(RejectCode::Malformed),
            0x10 => Some(RejectCode::Invalid),
            0x11 => Some(RejectCode::Obsolete),
            0x12 => Some(RejectCode::Duplicate),
            0x40 => Some(RejectCode::NonStandard),
            0x41 => Some(RejectCode::Dust),
            0x42 => Some(RejectCode::InsufficientFee),
            0x43 => Some(RejectCode::Checkpoint),
            _ => None,
        }
    }
}

/// Decoded `reject` payload (BIP61).
#[derive(Debug, Clone, PartialEq)]
pub struct RejectPacket {
    /// Command being rejected ("tx", "block", ...).
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Hash of the rejected object, when the rejected command names one.
    pub hash: Option<[u8; 32]>,
}

/// Block locator plus stop hash, shared by `getblocks` and `getheaders`.
///
/// Semantics:
/// The serving peer:
/// 1. Finds the first locator hash it recognizes in its active chain.
/// 2. Returns objects *after* that block in forward chronological order.
/// 3. Stops at the per-command cap or when reaching `stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorPacket {
    pub version: u32,
    pub locator: Vec<[u8; 32]>,
    pub stop: [u8; 32],
}

/// Decoded `filterload` payload (BIP37).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterLoadPacket {
    pub data: Vec<u8>,
    pub n_hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

/// Decoded `sendcmpct` payload (BIP152).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendCmpctPacket {
    /// 0 = announce via inv/headers, 1 = announce via cmpctblock.
    pub mode: u8,
    pub version: u64,
}

/// Decoded `cmpctblock` payload (BIP152): header, short-id key nonce,
/// 6-byte short ids and prefilled transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactBlockPacket {
    pub header: BlockHeader,
    pub nonce: u64,
    /// 48-bit short ids, widened to u64.
    pub short_ids: Vec<u64>,
    /// (absolute index, tx) pairs; indexes are differentially encoded on
    /// the wire.
    pub prefilled: Vec<(u64, Tx)>,
}

/// Decoded `getblocktxn` payload (BIP152).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTxnRequest {
    pub hash: [u8; 32],
    /// Absolute indexes into the block's transaction list.
    pub indexes: Vec<u64>,
}

/// Decoded `blocktxn` payload (BIP152).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTxnPacket {
    pub hash: [u8; 32],
    pub txs: Vec<Tx>,
}

/// Decoded `merkleblock` payload (BIP37): header plus the partial merkle
/// tree proving which transactions matched the peer's filter.
#[derive(Debug, Clone, PartialEq)]
pub struct MerkleBlockPacket {
    pub header: BlockHeader,
    pub total: u32,
    pub hashes: Vec<[u8; 32]>,
    pub flags: Vec<u8>,
}

/// Decoded `getutxos` payload (BIP64).
#[derive(Debug, Clone, PartialEq)]
pub struct GetUtxosPacket {
    pub check_mempool: bool,
    pub prevouts: Vec<OutPoint>,
}

/// One unspent output in a `utxos` response.
#[derive(Debug, Clone, PartialEq)]
pub struct Coin {
    pub version: i32,
    /// Confirmation height; `Coin::MEMPOOL_HEIGHT` for mempool coins.
    pub height: u32,
    pub value: u64,
    pub script: Vec<u8>,
}

impl Coin {
    pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;
}

/// Decoded `utxos` payload (BIP64).
#[derive(Debug, Clone, PartialEq)]
pub struct UtxosPacket {
    pub height: u32,
    pub tip: [u8; 32],
    /// One bit per queried prevout; set = coin present, in query order.
    pub hits: Vec<u8>,
    pub coins: Vec<Coin>,
}

/// Decoded `encinit` payload (BIP151): the sender's ephemeral public key
/// and proposed cipher suite.
#[derive(Debug, Clone, PartialEq)]
pub struct EncInitPacket {
    pub pubkey: [u8; 33],
    pub cipher: u8,
}

/// Decoded `encack` payload (BIP151).
#[derive(Debug, Clone, PartialEq)]
pub struct EncAckPacket {
    pub pubkey: [u8; 33],
}

/// A fully-decoded Bitcoin P2P message, ready for dispatch.
///
/// Each variant corresponds to a known Bitcoin protocol command.
/// Unknown commands are preserved in [`Packet::Unknown`] together with
/// the command name from the frame header.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Version(VersionPacket),
    Verack,
    /// `None` for pre-BIP31 nonce-less pings.
    Ping(Option<u64>),
    Pong(u64),
    GetAddr,
    Addr(Vec<AddrEntry>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(LocatorPacket),
    GetHeaders(LocatorPacket),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    Block(Block),
    Tx(Tx),
    Reject(RejectPacket),
    Mempool,
    FilterLoad(FilterLoadPacket),
    FilterAdd(Vec<u8>),
    FilterClear,
    FeeFilter(i64),
    SendCmpct(SendCmpctPacket),
    CmpctBlock(CompactBlockPacket),
    GetBlockTxn(BlockTxnRequest),
    BlockTxn(BlockTxnPacket),
    GetUtxos(GetUtxosPacket),
    Utxos(UtxosPacket),
    HaveWitness,
    MerkleBlock(MerkleBlockPacket),
    Alert(Vec<u8>),
    EncInit(EncInitPacket),
    EncAck(EncAckPacket),
    AuthChallenge([u8; 32]),
    AuthReply(Box<[u8; 64]>),
    AuthPropose([u8; 32]),
    Unknown { command: String, payload: Vec<u8> },
}

impl Packet {
    /// The command this packet travels under; the dispatch and request
    /// tracker key.
    pub fn command(&self) -> Command {
        match self {
            Packet::Version(_) => Command::Version,
            Packet::Verack => Command::Verack,
            Packet::Ping(_) => Command::Ping,
            Packet::Pong(_) => Command::Pong,
            Packet::GetAddr => Command::GetAddr,
            Packet::Addr(_) => Command::Addr,
            Packet::Inv(_) => Command::Inv,
            Packet::GetData(_) => Command::GetData,
            Packet::NotFound(_) => Command::NotFound,
            Packet::GetBlocks(_) => Command::GetBlocks,
            Packet::GetHeaders(_) => Command::GetHeaders,
            Packet::Headers(_) => Command::Headers,
            Packet::SendHeaders => Command::SendHeaders,
            Packet::Block(_) => Command::Block,
            Packet::Tx(_) => Command::Tx,
            Packet::Reject(_) => Command::Reject,
            Packet::Mempool => Command::Mempool,
            Packet::FilterLoad(_) => Command::FilterLoad,
            Packet::FilterAdd(_) => Command::FilterAdd,
            Packet::FilterClear => Command::FilterClear,
            Packet::FeeFilter(_) => Command::FeeFilter,
            Packet::SendCmpct(_) => Command::SendCmpct,
            Packet::CmpctBlock(_) => Command::CmpctBlock,
            Packet::GetBlockTxn(_) => Command::GetBlockTxn,
            Packet::BlockTxn(_) => Command::BlockTxn,
            Packet::GetUtxos(_) => Command::GetUtxos,
            Packet::Utxos(_) => Command::Utxos,
            Packet::HaveWitness => Command::HaveWitness,
            Packet::MerkleBlock(_) => Command::MerkleBlock,
            Packet::Alert(_) => Command::Alert,
            Packet::EncInit(_) => Command::EncInit,
            Packet::EncAck(_) => Command::EncAck,
            Packet::AuthChallenge(_) => Command::AuthChallenge,
            Packet::AuthReply(_) => Command::AuthReply,
            Packet::AuthPropose(_) => Command::AuthPropose,
            Packet::Unknown { .. } => Command::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_wire_bytes() {
        let commands = [
            Command::Version,
            Command::Verack,
            Command::Ping,
            Command::Inv,
            Command::GetBlockTxn,
            Command::MerkleBlock,
            Command::GetUtxos,
            Command::HaveWitness,
            Command::EncInit,
            Command::AuthChallenge,
            Command::AuthPropose,
        ];

        for cmd in commands {
            assert_eq!(Command::from(&cmd.as_bytes()), cmd, "{:?}", cmd);
        }
    }

    #[test]
    fn unknown_command_maps_to_unknown() {
        let mut bytes = [0u8; 12];
        bytes[..10].copy_from_slice(b"wtfmessage");
        assert_eq!(Command::from(&bytes), Command::Unknown);
    }

    #[test]
    fn authchallenge_command_field_is_truncated_to_twelve_bytes() {
        // "authchallenge" is 13 ASCII bytes; the wire field carries the
        // first 12, which is still unambiguous in the command table.
        let bytes = Command::AuthChallenge.as_bytes();
        assert_eq!(&bytes, b"authchalleng");
        assert_eq!(Command::from(&bytes), Command::AuthChallenge);
    }

    #[test]
    fn services_debug_names_flags() {
        let services = Services::NODE_NETWORK | Services::NODE_WITNESS;
        assert_eq!(services.names(), vec!["NODE_NETWORK", "NODE_WITNESS"]);
        assert!(services.contains(Services::NODE_NETWORK));
        assert!(!services.contains(Services::NODE_BLOOM));
    }

    #[test]
    fn outpoint_null_detection() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint {
            hash: [1u8; 32],
            index: 0
        }
        .is_null());
    }

    fn legacy_tx(script: Vec<u8>) -> Tx {
        // version 1, one input spending a fixed prevout, one output.
        let input = TxIn {
            prevout: OutPoint {
                hash: [0xAA; 32],
                index: 1,
            },
            script: vec![],
            sequence: 0xFFFF_FFFF,
            witness: vec![],
        };
        let output = TxOut {
            value: 50_000,
            script,
        };

        let mut raw = Vec::new();
        raw.extend(&1i32.to_le_bytes());
        raw.push(1); // input count
        raw.extend(&input.prevout.to_bytes());
        raw.push(0); // script length
        raw.extend(&input.sequence.to_le_bytes());
        raw.push(1); // output count
        raw.extend(&output.value.to_le_bytes());
        raw.push(output.script.len() as u8);
        raw.extend(&output.script);
        raw.extend(&0u32.to_le_bytes());

        Tx::from_parts(1, vec![input], vec![output], 0, raw)
    }

    #[test]
    fn legacy_txid_is_double_sha_of_raw_bytes() {
        let tx = legacy_tx(vec![0x51]);
        assert_eq!(tx.hash(), double_sha256(&tx.raw));
    }

    #[test]
    fn witness_txid_ignores_witness_data() {
        let legacy = legacy_tx(vec![0x51]);

        // Same tx re-serialized with a marker/flag and one witness item.
        let mut witness_tx = legacy.clone();
        witness_tx.inputs[0].witness = vec![vec![0xBE, 0xEF]];
        let mut raw = Vec::new();
        raw.extend(&1i32.to_le_bytes());
        raw.push(0x00); // segwit marker
        raw.push(0x01); // segwit flag
        raw.push(1);
        raw.extend(&witness_tx.inputs[0].prevout.to_bytes());
        raw.push(0);
        raw.extend(&witness_tx.inputs[0].sequence.to_le_bytes());
        raw.push(1);
        raw.extend(&witness_tx.outputs[0].value.to_le_bytes());
        raw.push(witness_tx.outputs[0].script.len() as u8);
        raw.extend(&witness_tx.outputs[0].script);
        raw.push(1); // witness stack size
        raw.push(2); // item length
        raw.extend(&[0xBE, 0xEF]);
        raw.extend(&0u32.to_le_bytes());

        let witness_tx = Tx::from_parts(
            1,
            witness_tx.inputs,
            witness_tx.outputs,
            0,
            raw,
        );

        assert_eq!(witness_tx.hash(), legacy.hash());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = legacy_tx(vec![]);
        assert!(!tx.is_coinbase());
        tx.inputs[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn hash_hex_reverses_byte_order() {
        let mut hash = [0u8; 32];
        hash[31] = 0xAB;
        assert!(hash_hex(&hash).starts_with("ab"));
        assert!(hash_hex(&hash).ends_with("00"));
    }
}
