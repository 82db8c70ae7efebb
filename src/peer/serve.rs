//! Serve-side handlers: the peer answering `getheaders`, `getblocks`,
//! `getdata`, `getutxos`, `mempool` and `getblocktxn`.
//!
//! These are the only handlers that read the chain and mempool stores,
//! and they are mutually exclusive under the per-peer serve lock. The
//! lock never queues: a request arriving while another is being served
//! is dropped.

use std::time::Instant;

use rand::Rng;
use tracing::{debug, warn};

use crate::compact;
use crate::error::StoreError;
use crate::events::Event;
use crate::merkle;
use crate::wire::constants::{
    BLOCKTXN_DEPTH, CMPCT_SERVE_DEPTH, MAX_ADDRS, MAX_GETBLOCKS, MAX_HEADERS, MAX_INV,
    MAX_UTXO_QUERY,
};
use crate::wire::message::{
    Block, BlockTxnRequest, GetUtxosPacket, InvItem, InventoryType, LocatorPacket,
    MerkleBlockPacket, Packet, UtxosPacket,
};

use super::Peer;

/// Nonce attempts before compact construction falls back to a full
/// block.
const COMPACT_NONCE_RETRIES: usize = 16;

impl Peer {
    /// Whether chain-serving requests may be answered at all.
    fn can_serve_chain(&self) -> bool {
        self.chain.is_synced()
            && !self.options.selfish
            && !self.options.spv
            && !self.options.prune
    }

    // --- getaddr ------------------------------------------------------------

    pub(crate) fn handle_get_addr(&mut self, now: Instant) {
        if self.sent_addr {
            debug!(peer = %self.options.addr, "refusing to relay addrs twice");
            return;
        }
        self.sent_addr = true;

        let addrs = self.pool.addresses(MAX_ADDRS);
        if addrs.is_empty() {
            return;
        }
        self.send(Packet::Addr(addrs), now);
    }

    // --- getheaders ---------------------------------------------------------

    pub(crate) fn handle_get_headers(&mut self, locator: LocatorPacket, now: Instant) {
        if !self.can_serve_chain() {
            return;
        }
        if !self.serve_lock() {
            debug!(peer = %self.options.addr, "busy serving; dropping getheaders");
            return;
        }
        let result = self.serve_get_headers(locator, now);
        self.serve_unlock();
        if let Err(err) = result {
            self.events.push(Event::Error(err.into()));
        }
    }

    fn serve_get_headers(
        &mut self,
        locator: LocatorPacket,
        now: Instant,
    ) -> Result<(), StoreError> {
        // An empty locator asks for the stop header itself; otherwise
        // we walk forward from the best common ancestor.
        let mut hash = if locator.locator.is_empty() {
            self.chain.get_header(&locator.stop)?.map(|_| locator.stop)
        } else {
            let ancestor = self.chain.find_locator(&locator.locator)?;
            self.chain.get_next_hash(&ancestor)?
        };

        let mut headers = vec![];
        while let Some(current) = hash {
            let Some(header) = self.chain.get_header(&current)? else {
                break;
            };
            headers.push(header);

            if current == locator.stop || headers.len() == MAX_HEADERS {
                break;
            }
            hash = self.chain.get_next_hash(&current)?;
        }

        debug!(peer = %self.options.addr, count = headers.len(), "serving headers");
        self.send_headers(headers, now);
        Ok(())
    }

    // --- getblocks ----------------------------------------------------------

    pub(crate) fn handle_get_blocks(&mut self, locator: LocatorPacket, now: Instant) {
        if !self.can_serve_chain() {
            return;
        }
        if !self.serve_lock() {
            debug!(peer = %self.options.addr, "busy serving; dropping getblocks");
            return;
        }
        let result = self.serve_get_blocks(locator, now);
        self.serve_unlock();
        if let Err(err) = result {
            self.events.push(Event::Error(err.into()));
        }
    }

    fn serve_get_blocks(
        &mut self,
        locator: LocatorPacket,
        now: Instant,
    ) -> Result<(), StoreError> {
        let ancestor = self.chain.find_locator(&locator.locator)?;
        let mut hash = self.chain.get_next_hash(&ancestor)?;

        let mut items = vec![];
        while let Some(current) = hash {
            if current == locator.stop {
                break;
            }
            items.push(InvItem::block(current));

            if items.len() == MAX_GETBLOCKS {
                // The sweep continues when the peer getdatas this hash.
                debug!(peer = %self.options.addr, "getblocks sweep capped; arming continuation");
                self.hash_continue = Some(current);
                break;
            }
            hash = self.chain.get_next_hash(&current)?;
        }

        self.send_inv(items, now);
        Ok(())
    }

    // --- getdata ------------------------------------------------------------

    pub(crate) fn handle_get_data(&mut self, items: Vec<InvItem>, now: Instant) {
        if items.len() > MAX_INV {
            self.violation("oversized getdata", 100);
            return;
        }
        if !self.serve_lock() {
            debug!(peer = %self.options.addr, "busy serving; dropping getdata");
            return;
        }
        let result = self.serve_get_data(items, now);
        self.serve_unlock();
        if let Err(err) = result {
            self.events.push(Event::Error(err.into()));
        }
    }

    fn serve_get_data(&mut self, items: Vec<InvItem>, now: Instant) -> Result<(), StoreError> {
        let mut notfound = vec![];

        for item in items {
            if item.is_tx() {
                self.serve_tx_item(item, &mut notfound, now);
            } else {
                self.serve_block_item(item, &mut notfound, now)?;
            }

            // A getblocks sweep continues from its checkpoint hash.
            if Some(item.hash) == self.hash_continue {
                let tip = self.chain.tip_hash();
                self.send(Packet::Inv(vec![InvItem::block(tip)]), now);
                self.hash_continue = None;
            }
        }

        if !notfound.is_empty() {
            self.send(Packet::NotFound(notfound), now);
        }
        Ok(())
    }

    fn serve_tx_item(&mut self, item: InvItem, notfound: &mut Vec<InvItem>, now: Instant) {
        let tx = self.pool.get_broadcast_tx(&item.hash).or_else(|| {
            if self.options.selfish {
                return None;
            }
            self.mempool.as_ref().and_then(|mempool| mempool.get_tx(&item.hash))
        });

        match tx {
            Some(tx) if tx.is_coinbase() => {
                // Should be unreachable through any store, but never
                // relay a coinbase on request.
                warn!(peer = %self.options.addr, "peer requested a coinbase");
                notfound.push(item);
            }
            Some(tx) => self.send(Packet::Tx((*tx).clone()), now),
            None => notfound.push(item),
        }
    }

    fn serve_block_item(
        &mut self,
        item: InvItem,
        notfound: &mut Vec<InvItem>,
        now: Instant,
    ) -> Result<(), StoreError> {
        let block = match self.pool.get_broadcast_block(&item.hash) {
            Some(block) => Some(block),
            None if self.options.selfish || self.options.spv || self.options.prune => None,
            None => self.chain.get_block(&item.hash)?,
        };

        let Some(block) = block else {
            notfound.push(item);
            return Ok(());
        };

        match item.inv_type {
            InventoryType::Block | InventoryType::WitnessBlock => {
                self.send(Packet::Block((*block).clone()), now);
            }
            InventoryType::FilteredBlock | InventoryType::WitnessFilteredBlock => {
                let Some(filter) = &self.spv_filter else {
                    notfound.push(item);
                    return Ok(());
                };

                let matches: Vec<bool> =
                    block.txs.iter().map(|tx| filter.matches_tx(tx)).collect();
                let txids = block.txids();
                let (hashes, flags) = merkle::build(&txids, &matches);

                self.send(
                    Packet::MerkleBlock(MerkleBlockPacket {
                        header: block.header.clone(),
                        total: txids.len() as u32,
                        hashes,
                        flags,
                    }),
                    now,
                );
                // Matched transactions follow the merkleblock as plain
                // tx packets.
                for (tx, matched) in block.txs.iter().zip(&matches) {
                    if *matched {
                        self.send(Packet::Tx(tx.clone()), now);
                    }
                }
            }
            InventoryType::CompactBlock => {
                let entry = self.chain.get_entry(&item.hash)?;
                let depth = entry
                    .map_or(u32::MAX, |entry| {
                        self.chain.height().saturating_sub(entry.height)
                    });

                if depth > CMPCT_SERVE_DEPTH {
                    // Deep blocks are outside the peer's mempool
                    // horizon; send the full block.
                    self.send(Packet::Block((*block).clone()), now);
                } else {
                    match build_compact(&block) {
                        Some(packet) => self.send(Packet::CmpctBlock(packet), now),
                        None => {
                            warn!(peer = %self.options.addr, "compact nonce retries exhausted");
                            self.send(Packet::Block((*block).clone()), now);
                        }
                    }
                }
            }
            _ => notfound.push(item),
        }

        Ok(())
    }

    // --- getutxos (BIP64) ---------------------------------------------------

    pub(crate) fn handle_get_utxos(&mut self, query: GetUtxosPacket, now: Instant) {
        if self.options.selfish || self.options.spv || self.options.prune {
            return;
        }
        if query.prevouts.len() > MAX_UTXO_QUERY {
            debug!(peer = %self.options.addr, count = query.prevouts.len(), "oversized getutxos; ignoring");
            return;
        }
        if !self.serve_lock() {
            debug!(peer = %self.options.addr, "busy serving; dropping getutxos");
            return;
        }
        let result = self.serve_get_utxos(query, now);
        self.serve_unlock();
        if let Err(err) = result {
            self.events.push(Event::Error(err.into()));
        }
    }

    fn serve_get_utxos(
        &mut self,
        query: GetUtxosPacket,
        now: Instant,
    ) -> Result<(), StoreError> {
        let mut hits = vec![0u8; (query.prevouts.len() + 7) / 8];
        let mut coins = vec![];

        for (i, prevout) in query.prevouts.iter().enumerate() {
            let coin = if query.check_mempool {
                match &self.mempool {
                    Some(mempool) if mempool.is_spent(prevout) => None,
                    Some(mempool) => match mempool.get_coin(prevout) {
                        Some(coin) => Some(coin),
                        None => self.chain.get_coin(prevout)?,
                    },
                    None => self.chain.get_coin(prevout)?,
                }
            } else {
                self.chain.get_coin(prevout)?
            };

            if let Some(coin) = coin {
                hits[i / 8] |= 1 << (i % 8);
                coins.push(coin);
            }
        }

        self.send(
            Packet::Utxos(UtxosPacket {
                height: self.chain.height(),
                tip: self.chain.tip_hash(),
                hits,
                coins,
            }),
            now,
        );
        Ok(())
    }

    // --- mempool ------------------------------------------------------------

    pub(crate) fn handle_mempool(&mut self, now: Instant) {
        let Some(mempool) = self.mempool.clone() else {
            debug!(peer = %self.options.addr, "mempool request without a mempool");
            return;
        };
        if !self.chain.is_synced() || self.options.selfish {
            return;
        }
        if !self.serve_lock() {
            debug!(peer = %self.options.addr, "busy serving; dropping mempool");
            return;
        }

        let items: Vec<InvItem> = mempool.snapshot().into_iter().map(InvItem::tx).collect();
        self.serve_unlock();

        debug!(peer = %self.options.addr, count = items.len(), "serving mempool snapshot");
        self.send_inv(items, now);
    }

    // --- getblocktxn (BIP152) -----------------------------------------------

    pub(crate) fn handle_get_block_txn(&mut self, request: BlockTxnRequest, now: Instant) {
        if self.options.selfish || self.options.spv || self.options.prune {
            return;
        }
        if !self.serve_lock() {
            debug!(peer = %self.options.addr, "busy serving; dropping getblocktxn");
            return;
        }
        let result = self.serve_get_block_txn(request, now);
        self.serve_unlock();
        if let Err(err) = result {
            self.events.push(Event::Error(err.into()));
        }
    }

    fn serve_get_block_txn(
        &mut self,
        request: BlockTxnRequest,
        now: Instant,
    ) -> Result<(), StoreError> {
        let Some(block) = self.chain.get_block(&request.hash)? else {
            self.violation("getblocktxn for an unknown block", 100);
            return Ok(());
        };

        let entry = self.chain.get_entry(&request.hash)?;
        let depth = entry.map_or(u32::MAX, |entry| {
            self.chain.height().saturating_sub(entry.height)
        });
        if depth > BLOCKTXN_DEPTH {
            debug!(peer = %self.options.addr, depth, "getblocktxn for a deep block; ignoring");
            return Ok(());
        }

        let Some(response) = compact::txn_response(&block, &request.indexes) else {
            self.violation("getblocktxn index out of range", 100);
            return Ok(());
        };

        self.events.push(Event::GetBlockTxn(request));
        self.send(Packet::BlockTxn(response), now);
        Ok(())
    }
}

/// Compact construction with bounded nonce retries on short-id
/// collisions.
fn build_compact(block: &Block) -> Option<crate::wire::message::CompactBlockPacket> {
    let mut rng = rand::thread_rng();
    for _ in 0..COMPACT_NONCE_RETRIES {
        let nonce: u64 = rng.r#gen();
        if let Some(packet) = compact::build_packet(block, nonce) {
            return Some(packet);
        }
    }
    None
}
