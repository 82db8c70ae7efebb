//! Narrow contracts for the session's external collaborators.
//!
//! The peer session never owns chain state, a mempool, or the pool's
//! broadcast inventory; it calls through these traits and treats every
//! implementation as an asynchronous, concurrent-safe store. Chain
//! lookups can fail (disk, corruption) and surface as [`StoreError`];
//! mempool and pool views are infallible by contract.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::wire::message::{AddrEntry, Block, BlockHeader, Coin, InvItem, OutPoint, Tx};

pub type StoreResult<T> = Result<T, StoreError>;

/// Hash/height pair for one block in the active chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: [u8; 32],
    pub height: u32,
}

/// Read view of the active chain.
pub trait Chain: Send + Sync {
    fn height(&self) -> u32;
    fn tip_hash(&self) -> [u8; 32];
    /// Whether initial sync has finished; serving is refused before
    /// that.
    fn is_synced(&self) -> bool;
    fn get_entry(&self, hash: &[u8; 32]) -> StoreResult<Option<ChainEntry>>;
    fn get_header(&self, hash: &[u8; 32]) -> StoreResult<Option<BlockHeader>>;
    fn get_block(&self, hash: &[u8; 32]) -> StoreResult<Option<Arc<Block>>>;
    /// The main-chain block following `hash`.
    fn get_next_hash(&self, hash: &[u8; 32]) -> StoreResult<Option<[u8; 32]>>;
    /// Resolves a locator to the best known common ancestor, falling
    /// back to genesis when nothing matches.
    fn find_locator(&self, locator: &[[u8; 32]]) -> StoreResult<[u8; 32]>;
    /// Builds our own locator from the tip backwards.
    fn get_locator(&self) -> StoreResult<Vec<[u8; 32]>>;
    fn get_coin(&self, prevout: &OutPoint) -> StoreResult<Option<Coin>>;
}

/// Read view of the mempool.
pub trait Mempool: Send + Sync {
    fn get_tx(&self, hash: &[u8; 32]) -> Option<Arc<Tx>>;
    fn get_coin(&self, prevout: &OutPoint) -> Option<Coin>;
    fn is_spent(&self, prevout: &OutPoint) -> bool;
    /// Every txid currently in the pool.
    fn snapshot(&self) -> Vec<[u8; 32]>;
    /// Fee rate of an entry in satoshis per kilobyte.
    fn rate(&self, hash: &[u8; 32]) -> Option<u64>;
}

/// The slice of pool state a single session may read: the broadcast
/// inventory and the address book. Everything else crosses the boundary
/// as events.
pub trait PoolView: Send + Sync {
    fn broadcast_items(&self) -> Vec<InvItem>;
    fn get_broadcast_tx(&self, hash: &[u8; 32]) -> Option<Arc<Tx>>;
    fn get_broadcast_block(&self, hash: &[u8; 32]) -> Option<Arc<Block>>;
    fn addresses(&self, max: usize) -> Vec<AddrEntry>;
}

/// The hardcoded mainnet genesis block, coinbase included.
///
/// Used as the root of a fresh [`MemoryChain`]; its hash matches
/// [`crate::wire::constants::GENESIS_BLOCK_HASH_MAINNET`], which also
/// makes it a handy end-to-end check of the transaction decoder and
/// header hashing.
pub fn mainnet_genesis() -> Block {
    use crate::wire::message::Decode;

    // The famous coinbase: "The Times 03/Jan/2009 Chancellor on brink
    // of second bailout for banks".
    const COINBASE_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000\
                                000000000000ffffffff4d04ffff001d0104455468652054696d6573203033\
                                2f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f\
                                66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff01\
                                00f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828\
                                e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384d\
                                f7ba0b8d578a4c702b6bf11d5fac00000000";

    let raw: Vec<u8> = {
        let compact: String = COINBASE_HEX.split_whitespace().collect();
        (0..compact.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&compact[i..i + 2], 16).expect("genesis hex"))
            .collect()
    };
    let coinbase = Tx::decode(&raw).expect("genesis coinbase");

    Block {
        header: BlockHeader {
            version: 1,
            prev_blockhash: [0u8; 32],
            merkle_root: coinbase.hash(),
            time: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        },
        txs: vec![coinbase],
    }
}

/// An append-only in-memory chain, enough to drive the binaries and
/// exercise the serve-side handlers in tests.
pub struct MemoryChain {
    inner: RwLock<MemoryChainInner>,
}

struct MemoryChainInner {
    by_hash: HashMap<[u8; 32], (Arc<Block>, u32)>,
    by_height: Vec<[u8; 32]>,
    coins: HashMap<OutPoint, Coin>,
    synced: bool,
}

impl MemoryChain {
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, (Arc::new(genesis), 0));

        MemoryChain {
            inner: RwLock::new(MemoryChainInner {
                by_hash,
                by_height: vec![hash],
                coins: HashMap::new(),
                synced: false,
            }),
        }
    }

    /// Appends a block on top of the current tip.
    pub fn push(&self, block: Block) {
        let mut inner = self.inner.write();
        let hash = block.hash();
        let height = inner.by_height.len() as u32;
        inner.by_hash.insert(hash, (Arc::new(block), height));
        inner.by_height.push(hash);
    }

    pub fn set_synced(&self, synced: bool) {
        self.inner.write().synced = synced;
    }

    pub fn add_coin(&self, prevout: OutPoint, coin: Coin) {
        self.inner.write().coins.insert(prevout, coin);
    }
}

impl Chain for MemoryChain {
    fn height(&self) -> u32 {
        self.inner.read().by_height.len() as u32 - 1
    }

    fn tip_hash(&self) -> [u8; 32] {
        *self.inner.read().by_height.last().unwrap()
    }

    fn is_synced(&self) -> bool {
        self.inner.read().synced
    }

    fn get_entry(&self, hash: &[u8; 32]) -> StoreResult<Option<ChainEntry>> {
        Ok(self
            .inner
            .read()
            .by_hash
            .get(hash)
            .map(|(_, height)| ChainEntry {
                hash: *hash,
                height: *height,
            }))
    }

    fn get_header(&self, hash: &[u8; 32]) -> StoreResult<Option<BlockHeader>> {
        Ok(self
            .inner
            .read()
            .by_hash
            .get(hash)
            .map(|(block, _)| block.header.clone()))
    }

    fn get_block(&self, hash: &[u8; 32]) -> StoreResult<Option<Arc<Block>>> {
        Ok(self
            .inner
            .read()
            .by_hash
            .get(hash)
            .map(|(block, _)| block.clone()))
    }

    fn get_next_hash(&self, hash: &[u8; 32]) -> StoreResult<Option<[u8; 32]>> {
        let inner = self.inner.read();
        let Some((_, height)) = inner.by_hash.get(hash) else {
            return Ok(None);
        };
        Ok(inner.by_height.get(*height as usize + 1).copied())
    }

    fn find_locator(&self, locator: &[[u8; 32]]) -> StoreResult<[u8; 32]> {
        let inner = self.inner.read();
        for hash in locator {
            if inner.by_hash.contains_key(hash) {
                return Ok(*hash);
            }
        }
        Ok(inner.by_height[0])
    }

    fn get_locator(&self) -> StoreResult<Vec<[u8; 32]>> {
        let inner = self.inner.read();
        let mut locator = vec![];
        let mut step = 1usize;
        let mut index = inner.by_height.len() as i64 - 1;

        // Dense near the tip, exponentially sparser towards genesis.
        while index > 0 {
            locator.push(inner.by_height[index as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            index -= step as i64;
        }
        locator.push(inner.by_height[0]);

        Ok(locator)
    }

    fn get_coin(&self, prevout: &OutPoint) -> StoreResult<Option<Coin>> {
        Ok(self.inner.read().coins.get(prevout).cloned())
    }
}

/// An in-memory mempool for the binaries and tests.
#[derive(Default)]
pub struct MemoryMempool {
    inner: RwLock<MemoryMempoolInner>,
}

#[derive(Default)]
struct MemoryMempoolInner {
    txs: HashMap<[u8; 32], Arc<Tx>>,
    order: Vec<[u8; 32]>,
    rates: HashMap<[u8; 32], u64>,
    spents: HashMap<OutPoint, [u8; 32]>,
}

impl MemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: Tx, rate: u64) {
        let mut inner = self.inner.write();
        let hash = tx.hash();
        for input in &tx.inputs {
            inner.spents.insert(input.prevout, hash);
        }
        inner.rates.insert(hash, rate);
        if inner.txs.insert(hash, Arc::new(tx)).is_none() {
            inner.order.push(hash);
        }
    }
}

impl Mempool for MemoryMempool {
    fn get_tx(&self, hash: &[u8; 32]) -> Option<Arc<Tx>> {
        self.inner.read().txs.get(hash).cloned()
    }

    fn get_coin(&self, prevout: &OutPoint) -> Option<Coin> {
        let inner = self.inner.read();
        let tx = inner.txs.get(&prevout.hash)?;
        let output = tx.outputs.get(prevout.index as usize)?;
        Some(Coin {
            version: tx.version,
            height: Coin::MEMPOOL_HEIGHT,
            value: output.value,
            script: output.script.clone(),
        })
    }

    fn is_spent(&self, prevout: &OutPoint) -> bool {
        self.inner.read().spents.contains_key(prevout)
    }

    fn snapshot(&self) -> Vec<[u8; 32]> {
        self.inner.read().order.clone()
    }

    fn rate(&self, hash: &[u8; 32]) -> Option<u64> {
        self.inner.read().rates.get(hash).copied()
    }
}

/// A pool view with nothing to broadcast and an empty address book.
#[derive(Default)]
pub struct EmptyPool;

impl PoolView for EmptyPool {
    fn broadcast_items(&self) -> Vec<InvItem> {
        vec![]
    }

    fn get_broadcast_tx(&self, _hash: &[u8; 32]) -> Option<Arc<Tx>> {
        None
    }

    fn get_broadcast_block(&self, _hash: &[u8; 32]) -> Option<Arc<Block>> {
        None
    }

    fn addresses(&self, _max: usize) -> Vec<AddrEntry> {
        vec![]
    }
}
