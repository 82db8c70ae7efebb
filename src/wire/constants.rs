/// Network magic value used in the Bitcoin P2P message header.
///
/// The first 4 bytes of every Bitcoin P2P message identify the
/// network (mainnet, testnet, regtest, signet) and act as a
/// message boundary marker in the TCP stream.
///
/// For mainnet, the magic value is `0xD9B4BEF9` (F9 BE B4 D9 in bytes).
///
/// You can also see how Bitcoin Core maps magic values to networks
/// in `GetNetworkForMagic`:
/// https://github.com/bitcoin/bitcoin/blob/master/src/kernel/chainparams.cpp#L703-L723
///
/// Other network magic values:
/// - Mainnet:  0xD9B4BEF9
/// - Testnet3: 0x0709110B
/// - Regtest:  0xDAB5BFFA
/// - Signet:   0x40CF030A
pub const MAIN_NET_MAGIC: u32 = 0xD9B4BEF9;

/// Protocol version this crate speaks.
///
/// Sent in the `version` message during handshake and used for peer
/// capability negotiation and feature gating. 70015 is the version that
/// introduced compact blocks v1 (BIP152), the newest feature the session
/// negotiates.
///
/// Notable versions: https://developer.bitcoin.org/reference/p2p_networking.html#protocol-versions
pub const PROTOCOL_VERSION: i32 = 70015;

/// Oldest protocol version the session will talk to.
///
/// Peers below this are disconnected during the version handshake.
pub const MIN_PROTOCOL_VERSION: i32 = 70001;

/// Peers at or below this version speak pre-BIP31 pings: no nonce in
/// `ping`, and no `pong` reply at all.
pub const PONG_VERSION: i32 = 60000;

/// First protocol version that answers `getheaders`.
///
/// When headers-first sync is requested, peers below this version are
/// rejected during the version handshake.
pub const HEADERS_VERSION: i32 = 31800;

/// First protocol version that understands `sendheaders` (BIP130).
pub const SENDHEADERS_VERSION: i32 = 70012;

/// First protocol version that understands `sendcmpct` (BIP152).
pub const COMPACT_VERSION: i32 = 70014;

/// Hard cap on `inv`, `getdata` and `notfound` item counts.
///
/// https://developer.bitcoin.org/reference/p2p_networking.html#inv
pub const MAX_INV: usize = 50_000;

/// Hard cap on entries in a `headers` message.
pub const MAX_HEADERS: usize = 2_000;

/// Hard cap on entries in an `addr` message.
pub const MAX_ADDRS: usize = 1_000;

/// Hard cap on hashes served for one `getblocks` sweep. Longer sweeps
/// continue through the hash-continue mechanism.
pub const MAX_GETBLOCKS: usize = 500;

/// Hard cap on prevouts in a `getutxos` query (BIP64).
pub const MAX_UTXO_QUERY: usize = 15;

/// Largest accepted payload for a single message frame (32 MB).
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// BIP37 limit on the serialized bloom filter, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// BIP37 limit on bloom filter hash functions.
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;

/// Largest data push a script may carry; `filteradd` payloads above this
/// are a protocol violation.
pub const MAX_SCRIPT_PUSH: usize = 520;

/// Total bitcoin supply in satoshis; the upper bound for a sane
/// `feefilter` rate.
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Blocks deeper than this below the tip are never served as compact
/// blocks; the peer falls back to a full `block` (BIP152 suggestion).
pub const CMPCT_SERVE_DEPTH: u32 = 10;

/// `getblocktxn` requests for blocks deeper than this below the tip are
/// silently dropped.
pub const BLOCKTXN_DEPTH: u32 = 15;

/// Ban score at which the pool is expected to drop the peer.
pub const BAN_THRESHOLD: u32 = 100;

/// The genesis block hash for Bitcoin mainnet. This is the hash of block height 0 (the first block in the chain).
///
/// Source (Bitcoin Core):
/// https://github.com/bitcoin/bitcoin/blob/707ad466968b947b364cfc25bcb4d6895e799418/src/kernel/chainparams.cpp#L136
///
/// Important:
/// - This value is encoded in little-endian byte order, matching the
///   internal representation used on the Bitcoin wire protocol.
/// - When displayed in human-readable form (e.g. block explorers),
///   the bytes must be reversed.
///
/// Human-readable (big-endian) form:
///
/// ```text
/// 000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f
/// ```
///
/// The genesis block has:
/// - No parent (`prev_blockhash` = 0)
/// - Height = 0
pub const GENESIS_BLOCK_HASH_MAINNET: [u8; 32] = [
    0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7, 0x4f,
    0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// DNS seed nodes for Bitcoin mainnet.
///
/// These hostnames are hardcoded bootstrap entry points used for initial peer discovery. When a node starts without known peers,
/// it queries one or more DNS seeds to obtain a list of reachable
/// Bitcoin nodes.
///
/// Each seed operates a DNS server that returns IP addresses of active nodes it has recently observed on the network. The client
/// then connects directly to those peers over TCP (port 8333).
///
/// These seeds are defined in Bitcoin Core chain parameters: https://github.com/bitcoin/bitcoin/blob/master/src/kernel/chainparams.cpp#L139-L151
///
/// This list corresponds to Bitcoin mainnet.
pub const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be:8333",
    "dnsseed.bluematt.me:8333",
    "seed.bitcoin.jonasschnelli.ch:8333",
    "seed.btc.petertodd.net:8333",
    "seed.bitcoin.sprovoost.nl:8333",
    "dnsseed.emzy.de:8333",
    "seed.bitcoin.wiz.biz:8333",
    "seed.mainnet.achownodes.xyz:8333",
];
