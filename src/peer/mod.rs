//! The peer session state machine.
//!
//! One [`Peer`] owns every piece of state for a single remote node:
//! handshake phases, negotiated features, the request tracker, dedup
//! filters, reassembly slots and timers. It is deliberately free of
//! I/O: inputs arrive as decoded [`Packet`]s plus an explicit monotonic
//! `Instant`, outputs accumulate in an outbound packet queue and the
//! upward [`Event`] queue. The driving loop (`net`) owns the socket and
//! the clock; tests drive the machine directly.
//!
//! Dispatch is strictly serial: no two entry points run concurrently
//! for the same peer.

pub mod assemble;
pub mod handshake;
pub mod requests;
pub mod serve;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::events::{Event, EventQueue};
use crate::filter::{BloomFilter, RollingFilter};
use crate::store::{Chain, Mempool, PoolView};
use crate::wire::constants::{
    BAN_THRESHOLD, COMPACT_VERSION, HEADERS_VERSION, MAX_ADDRS, MAX_HEADERS, MAX_INV, MAX_MONEY,
    MAX_SCRIPT_PUSH, MIN_PROTOCOL_VERSION, PONG_VERSION, PROTOCOL_VERSION, SENDHEADERS_VERSION,
};
use crate::wire::message::{
    AddrEntry, Block, BlockHeader, Command, FilterLoadPacket, InvItem, InventoryType, NetAddr,
    Packet, RejectCode, RejectPacket, SendCmpctPacket, Services, Tx, VersionPacket,
};

use self::assemble::{CompactSlot, MerkleSlot};
use self::handshake::{AuthDriver, EncryptionDriver, HANDSHAKE_TIMEOUT};
use self::requests::RequestTracker;

/// Keep-alive ping cadence once the session is ready.
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

/// Rolling address filter shape: ~5k entries at 1e-3.
const ADDR_FILTER_ITEMS: usize = 5_000;
const ADDR_FILTER_RATE: f64 = 0.001;

/// Rolling inventory filter shape: ~50k entries at 1e-6.
const INV_FILTER_ITEMS: usize = 50_000;
const INV_FILTER_RATE: f64 = 0.000001;

/// Static configuration for one session, fixed at construction.
pub struct PeerOptions {
    pub id: u32,
    pub addr: SocketAddr,
    pub outbound: bool,
    pub user_agent: String,
    pub protocol_version: i32,
    /// Services we advertise.
    pub services: Services,
    /// Nonce the pool put in our own `version`; matching it inbound
    /// means we connected to ourselves.
    pub local_nonce: u64,
    /// Whether we want the remote to relay transactions to us.
    pub relay: bool,
    pub spv: bool,
    pub selfish: bool,
    pub prune: bool,
    pub witness: bool,
    pub compact: bool,
    /// Headers-first sync preference.
    pub headers: bool,
    pub bip151: bool,
    pub bip150: bool,
    /// Permit connecting to ourselves (tests, loopback setups).
    pub self_connect: bool,
    /// Legacy pre-service-bit segwit network: probe witness support
    /// with a `havewitness` exchange instead of the service bit.
    pub old_segwit: bool,
    /// Fee filter to push on ready.
    pub fee_rate: Option<i64>,
    /// SPV filter to push on ready.
    pub spv_filter: Option<BloomFilter>,
}

impl PeerOptions {
    pub fn new(id: u32, addr: SocketAddr, outbound: bool) -> Self {
        PeerOptions {
            id,
            addr,
            outbound,
            user_agent: concat!("/btc-peer:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            protocol_version: PROTOCOL_VERSION,
            services: Services::NODE_NETWORK | Services::NODE_WITNESS | Services::NODE_BLOOM,
            local_nonce: rand::thread_rng().r#gen(),
            relay: true,
            spv: false,
            selfish: false,
            prune: false,
            witness: true,
            compact: true,
            headers: true,
            bip151: false,
            bip150: false,
            self_connect: false,
            old_segwit: false,
            fee_rate: None,
            spv_filter: None,
        }
    }
}

/// Something the pool wants announced to this peer.
pub enum AnnounceItem {
    Block(Arc<Block>),
    Tx(Arc<Tx>),
}

/// One peer session.
pub struct Peer {
    pub options: PeerOptions,
    chain: Arc<dyn Chain>,
    mempool: Option<Arc<dyn Mempool>>,
    pool: Arc<dyn PoolView>,

    // lifecycle
    connected: bool,
    destroyed: bool,

    // negotiation
    version: Option<VersionPacket>,
    version_sent: bool,
    verack_received: bool,
    ack: bool,
    have_witness: bool,
    prefer_headers: bool,
    /// Whether the remote wants tx announcements from us.
    relay: bool,
    /// Minimum fee rate the remote accepts (their `feefilter`).
    fee_rate: Option<i64>,
    /// BIP152 announce mode the remote negotiated (`Some(0)` = mode 0).
    compact_mode: Option<u8>,
    sent_addr: bool,
    sent_get_addr: bool,
    sync_sent: bool,
    hash_continue: Option<[u8; 32]>,
    ban_score: u32,

    // filters
    addr_filter: RollingFilter,
    inv_filter: RollingFilter,
    /// The remote's BIP37 filter, when it loaded one.
    spv_filter: Option<BloomFilter>,

    // timing
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    min_ping: Option<Duration>,
    challenge: Option<u64>,
    next_ping: Option<Instant>,

    // handshakes
    enc: Option<Box<dyn EncryptionDriver>>,
    enc_deadline: Option<Instant>,
    auth: Option<Box<dyn AuthDriver>>,
    auth_deadline: Option<Instant>,

    // request/response
    requests: RequestTracker,

    // reassembly
    compact_slots: HashMap<[u8; 32], CompactSlot>,
    merkle_slot: Option<MerkleSlot>,

    // serve-side non-queueing lock
    serving: AtomicBool,

    out: std::collections::VecDeque<Packet>,
    events: EventQueue,
}

impl Peer {
    pub fn new(
        options: PeerOptions,
        chain: Arc<dyn Chain>,
        mempool: Option<Arc<dyn Mempool>>,
        pool: Arc<dyn PoolView>,
    ) -> Self {
        Peer {
            options,
            chain,
            mempool,
            pool,
            connected: false,
            destroyed: false,
            version: None,
            version_sent: false,
            verack_received: false,
            ack: false,
            have_witness: false,
            prefer_headers: false,
            relay: true,
            fee_rate: None,
            compact_mode: None,
            sent_addr: false,
            sent_get_addr: false,
            sync_sent: false,
            hash_continue: None,
            ban_score: 0,
            addr_filter: RollingFilter::new(ADDR_FILTER_ITEMS, ADDR_FILTER_RATE),
            inv_filter: RollingFilter::new(INV_FILTER_ITEMS, INV_FILTER_RATE),
            spv_filter: None,
            last_send: None,
            last_recv: None,
            last_ping: None,
            last_pong: None,
            min_ping: None,
            challenge: None,
            next_ping: None,
            enc: None,
            enc_deadline: None,
            auth: None,
            auth_deadline: None,
            requests: RequestTracker::new(),
            compact_slots: HashMap::new(),
            merkle_slot: None,
            serving: AtomicBool::new(false),
            out: std::collections::VecDeque::new(),
            events: EventQueue::new(),
        }
    }

    /// Installs the BIP151/BIP150 drivers; must happen before
    /// `on_connect`.
    pub fn set_handshake_drivers(
        &mut self,
        enc: Option<Box<dyn EncryptionDriver>>,
        auth: Option<Box<dyn AuthDriver>>,
    ) {
        self.enc = enc;
        self.auth = auth;
    }

    // --- accessors (driving loop and tests) --------------------------------

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn remote_version(&self) -> Option<&VersionPacket> {
        self.version.as_ref()
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score
    }

    pub fn min_ping(&self) -> Option<Duration> {
        self.min_ping
    }

    pub fn challenge(&self) -> Option<u64> {
        self.challenge
    }

    pub fn last_recv(&self) -> Option<Instant> {
        self.last_recv
    }

    pub fn take_outbound(&mut self) -> Vec<Packet> {
        self.out.drain(..).collect()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    /// Earliest pending deadline; the driving loop sleeps until this.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.destroyed {
            return None;
        }

        [
            self.enc_deadline,
            self.auth_deadline,
            self.requests.next_deadline(),
            self.compact_slots
                .values()
                .map(|slot| slot.deadline)
                .min(),
            self.next_ping,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn send(&mut self, packet: Packet, now: Instant) {
        self.last_send = Some(now);
        self.out.push_back(packet);
    }

    /// Pool-driven raw send (broadcast relay, sync nudges).
    pub fn send_packet(&mut self, packet: Packet, now: Instant) {
        if self.destroyed {
            return;
        }
        self.send(packet, now);
    }

    // --- lifecycle ----------------------------------------------------------

    /// Transport came up. Starts the handshake ladder: encryption,
    /// authentication, version exchange.
    pub fn on_connect(&mut self, now: Instant) {
        if self.destroyed || self.connected {
            return;
        }
        self.connected = true;
        self.events.push(Event::Connect);

        if self.options.bip151 {
            if let Some(enc) = self.enc.as_mut() {
                let encinit = enc.to_encinit();
                self.enc_deadline = Some(now + HANDSHAKE_TIMEOUT);
                self.send(Packet::EncInit(encinit), now);
                return;
            }
            warn!(peer = %self.options.addr, "bip151 requested without a driver; continuing in the clear");
        }

        self.start_auth(now);
    }

    fn start_auth(&mut self, now: Instant) {
        if self.options.bip150 && self.auth.is_some() {
            self.auth_deadline = Some(now + HANDSHAKE_TIMEOUT);
            if self.options.outbound {
                if let Some(challenge) = self.auth.as_mut().unwrap().to_challenge() {
                    self.send(Packet::AuthChallenge(challenge), now);
                }
            }
            return;
        }
        self.start_version(now);
    }

    fn start_version(&mut self, now: Instant) {
        if self.version_sent {
            return;
        }
        self.version_sent = true;

        let packet = self.local_version(now);
        self.send(Packet::Version(packet), now);
        self.requests.request(Command::Verack, now);
    }

    fn local_version(&self, _now: Instant) -> VersionPacket {
        use std::time::{SystemTime, UNIX_EPOCH};

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let remote = NetAddr {
            services: Services::NONE.bits(),
            ip: self.options.addr.ip(),
            port: self.options.addr.port(),
        };
        let local = NetAddr {
            services: self.options.services.bits(),
            ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        };

        VersionPacket {
            version: self.options.protocol_version,
            services: self.options.services,
            timestamp,
            addr_recv: remote,
            addr_from: local,
            nonce: self.options.local_nonce,
            user_agent: self.options.user_agent.clone(),
            start_height: self.chain.height() as i32,
            relay: Some(self.options.relay),
        }
    }

    /// Idempotent teardown: pending requests, slots and timers die
    /// here; the driving loop closes the transport when it sees
    /// [`Event::Close`].
    pub fn destroy(&mut self, err: Option<PeerError>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        if let Some(err) = err {
            warn!(peer = %self.options.addr, %err, "destroying session");
            self.events.push(Event::Error(err));
        }

        let dropped = self.requests.clear();
        if dropped > 0 {
            debug!(peer = %self.options.addr, dropped, "dropped pending requests");
        }

        self.compact_slots.clear();
        self.merkle_slot = None;
        self.enc_deadline = None;
        self.auth_deadline = None;
        self.next_ping = None;
        self.challenge = None;

        if let Some(mut enc) = self.enc.take() {
            enc.destroy();
        }
        if let Some(mut auth) = self.auth.take() {
            auth.destroy();
        }

        self.events.push(Event::Close);
    }

    // --- timers -------------------------------------------------------------

    pub fn on_tick(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }

        // Encryption phase deadline.
        if self.enc_deadline.is_some_and(|deadline| deadline <= now) {
            self.enc_deadline = None;
            if let Some(enc) = self.enc.as_mut() {
                if !enc.completed() {
                    enc.complete_with_error();
                }
            }
            self.encryption_finished(now);
        }

        // Authentication phase deadline.
        if self.auth_deadline.is_some_and(|deadline| deadline <= now) {
            self.auth_deadline = None;
            let done = self.auth.as_ref().is_some_and(|auth| auth.completed());
            if !done {
                if let Some(auth) = self.auth.as_mut() {
                    auth.complete_with_error();
                }
                self.destroy(Some(PeerError::Handshake("authentication timed out")));
                return;
            }
        }

        // Request timeouts.
        for (cmd, _id) in self.requests.expire(now) {
            match cmd {
                // Handshake-critical waits: the session cannot proceed.
                Command::Verack | Command::Version | Command::HaveWitness => {
                    self.destroy(Some(PeerError::RequestTimeout(cmd)));
                    return;
                }
                _ => {
                    debug!(peer = %self.options.addr, ?cmd, "request timed out");
                    self.events.push(Event::Error(PeerError::RequestTimeout(cmd)));
                }
            }
        }

        // Compact block slots that never saw their blocktxn.
        let evicted: Vec<[u8; 32]> = self
            .compact_slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in evicted {
            self.compact_slots.remove(&hash);
            debug!(peer = %self.options.addr, block = %crate::wire::message::hash_hex(&hash), "compact block timed out");
        }

        // Keep-alive.
        if self.ack && self.next_ping.is_some_and(|at| at <= now) {
            self.send_ping(now);
            self.next_ping = Some(now + PING_INTERVAL);
        }
    }

    // --- dispatch -----------------------------------------------------------

    /// Routes one inbound packet. Exactly one handler runs per packet.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.destroyed {
            return;
        }
        self.last_recv = Some(now);

        // Encryption phase gates everything except its own packets.
        if self.enc.as_ref().is_some_and(|enc| !enc.completed()) {
            self.handle_enc_phase(packet, now);
            return;
        }

        // Same for authentication.
        if self.auth.as_ref().is_some_and(|auth| !auth.completed()) {
            self.handle_auth_phase(packet, now);
            return;
        }

        // An active merkle slot is flushed by the first non-tx packet.
        if self.merkle_slot.is_some() && packet.command() != Command::Tx {
            self.flush_merkle();
        }

        // Pre-ack, only the version exchange may proceed.
        if !self.ack
            && !matches!(
                packet,
                Packet::Version(_) | Packet::Verack | Packet::HaveWitness | Packet::Reject(_)
            )
        {
            self.destroy(Some(PeerError::violation(
                "packet sent before version handshake completed",
                10,
            )));
            return;
        }

        match packet {
            Packet::Version(p) => self.handle_version(p, now),
            Packet::Verack => self.handle_verack(now),
            Packet::Ping(nonce) => self.handle_ping(nonce, now),
            Packet::Pong(nonce) => self.handle_pong(nonce, now),
            Packet::GetAddr => self.handle_get_addr(now),
            Packet::Addr(entries) => self.handle_addr(entries),
            Packet::Inv(items) => self.handle_inv(items, now),
            Packet::GetData(items) => self.handle_get_data(items, now),
            Packet::NotFound(items) => {
                let packet = Packet::NotFound(items.clone());
                self.requests.response(&packet);
                self.events.push(Event::NotFound(items));
            }
            Packet::GetBlocks(locator) => self.handle_get_blocks(locator, now),
            Packet::GetHeaders(locator) => self.handle_get_headers(locator, now),
            Packet::Headers(headers) => self.handle_headers(headers, now),
            Packet::SendHeaders => self.handle_send_headers(),
            Packet::Block(block) => {
                let packet = Packet::Block(block.clone());
                self.requests.response(&packet);
                self.events.push(Event::Block(block));
            }
            Packet::Tx(tx) => self.handle_tx(tx),
            Packet::Reject(reject) => {
                debug!(
                    peer = %self.options.addr,
                    message = %reject.message,
                    reason = %reject.reason,
                    "peer rejected our message"
                );
                self.events.push(Event::Reject(reject));
            }
            Packet::Mempool => self.handle_mempool(now),
            Packet::FilterLoad(filter) => self.handle_filter_load(filter, now),
            Packet::FilterAdd(data) => self.handle_filter_add(data, now),
            Packet::FilterClear => self.handle_filter_clear(),
            Packet::FeeFilter(rate) => self.handle_fee_filter(rate, now),
            Packet::SendCmpct(p) => self.handle_send_cmpct(p),
            Packet::CmpctBlock(p) => self.handle_cmpct_block(p, now),
            Packet::GetBlockTxn(request) => self.handle_get_block_txn(request, now),
            Packet::BlockTxn(p) => self.handle_block_txn(p, now),
            Packet::GetUtxos(query) => self.handle_get_utxos(query, now),
            Packet::Utxos(utxos) => {
                let packet = Packet::Utxos(utxos.clone());
                self.requests.response(&packet);
                self.events.push(Event::Utxos(utxos));
            }
            Packet::HaveWitness => self.handle_have_witness(),
            Packet::MerkleBlock(p) => self.handle_merkle_block(p, now),
            Packet::Alert(payload) => self.events.push(Event::Alert(payload)),
            Packet::EncInit(_) | Packet::EncAck(_) => {
                // Encryption packets after the phase completed.
                debug!(peer = %self.options.addr, "stray encryption packet");
            }
            Packet::AuthChallenge(_) | Packet::AuthReply(_) | Packet::AuthPropose(_) => {
                debug!(peer = %self.options.addr, "stray auth packet");
            }
            Packet::Unknown { command, .. } => {
                debug!(peer = %self.options.addr, %command, "unknown packet");
                self.events.push(Event::Unknown { command });
            }
        }
    }

    /// Decoder-level failure for an otherwise framed message.
    pub fn handle_parse_error(&mut self, context: &'static str, now: Instant) {
        self.send(
            Packet::Reject(RejectPacket {
                message: String::new(),
                code: RejectCode::Malformed,
                reason: context.to_string(),
                hash: None,
            }),
            now,
        );
        self.violation("malformed message", 10);
    }

    // --- handshake phases ---------------------------------------------------

    fn handle_enc_phase(&mut self, packet: Packet, now: Instant) {
        enum Step {
            Replied(Event, Option<Packet>),
            Failed(PeerError),
        }

        let step = {
            let enc = self.enc.as_mut().expect("gated on enc");
            match packet {
                Packet::EncInit(p) => match enc.on_encinit(&p) {
                    Ok(ack) => Step::Replied(Event::EncInit(p), Some(Packet::EncAck(ack))),
                    Err(err) => {
                        enc.complete_with_error();
                        Step::Failed(err)
                    }
                },
                Packet::EncAck(p) => match enc.on_encack(&p) {
                    Ok(()) => Step::Replied(Event::EncAck(p), None),
                    Err(err) => {
                        enc.complete_with_error();
                        Step::Failed(err)
                    }
                },
                other => {
                    debug!(peer = %self.options.addr, cmd = ?other.command(), "packet during encryption handshake");
                    enc.complete_with_error();
                    Step::Failed(PeerError::Handshake(
                        "packet received before encryption handshake completed",
                    ))
                }
            }
        };

        match step {
            Step::Replied(event, reply) => {
                self.events.push(event);
                if let Some(reply) = reply {
                    self.send(reply, now);
                }
                self.check_encryption_done(now);
            }
            Step::Failed(err) => self.destroy(Some(err)),
        }
    }

    fn check_encryption_done(&mut self, now: Instant) {
        if self.enc.as_ref().is_some_and(|enc| enc.completed()) {
            self.encryption_finished(now);
        }
    }

    fn encryption_finished(&mut self, now: Instant) {
        self.enc_deadline = None;
        let success = self.enc.as_ref().is_some_and(|enc| enc.success());

        if success {
            self.start_auth(now);
            return;
        }

        if self.options.bip150 {
            // Authentication cannot run over a cleartext link.
            self.destroy(Some(PeerError::Handshake("encryption handshake failed")));
            return;
        }

        warn!(peer = %self.options.addr, "encryption failed; continuing in the clear");
        if let Some(mut enc) = self.enc.take() {
            enc.destroy();
        }
        self.start_version(now);
    }

    fn handle_auth_phase(&mut self, packet: Packet, now: Instant) {
        let result = {
            let auth = self.auth.as_mut().expect("gated on auth");
            match packet {
                Packet::AuthChallenge(hash) => auth
                    .on_challenge(&hash)
                    .map(|sig| (Event::AuthChallenge(hash), Some(Packet::AuthReply(sig)))),
                Packet::AuthReply(sig) => auth.on_reply(&sig).map(|propose| {
                    (
                        Event::AuthReply(sig),
                        propose.map(Packet::AuthPropose),
                    )
                }),
                Packet::AuthPropose(hash) => auth.on_propose(&hash).map(|challenge| {
                    (
                        Event::AuthPropose(hash),
                        Some(Packet::AuthChallenge(challenge)),
                    )
                }),
                other => {
                    debug!(peer = %self.options.addr, cmd = ?other.command(), "packet during auth handshake");
                    auth.complete_with_error();
                    self.destroy(Some(PeerError::Handshake(
                        "packet received before authentication completed",
                    )));
                    return;
                }
            }
        };

        match result {
            Ok((event, reply)) => {
                self.events.push(event);
                if let Some(reply) = reply {
                    self.send(reply, now);
                }
                if self.auth.as_ref().is_some_and(|auth| auth.completed()) {
                    self.auth_deadline = None;
                    if self.auth.as_ref().is_some_and(|auth| auth.success()) {
                        self.start_version(now);
                    } else {
                        self.destroy(Some(PeerError::Handshake("authentication rejected")));
                    }
                }
            }
            Err(err) => {
                if let Some(auth) = self.auth.as_mut() {
                    auth.complete_with_error();
                }
                self.destroy(Some(err));
            }
        }
    }

    // --- version exchange ---------------------------------------------------

    fn handle_version(&mut self, packet: VersionPacket, now: Instant) {
        if self.version.is_some() {
            self.violation("peer sent a duplicate version", 10);
            return;
        }

        if !self.options.self_connect && packet.nonce == self.options.local_nonce {
            self.destroy(Some(PeerError::Handshake("connected to ourselves")));
            return;
        }

        if packet.version < MIN_PROTOCOL_VERSION {
            self.destroy(Some(PeerError::Handshake(
                "peer does not support the required protocol version",
            )));
            return;
        }

        if self.options.outbound {
            if !packet.services.contains(Services::NODE_NETWORK) {
                self.destroy(Some(PeerError::Handshake(
                    "peer does not support network services",
                )));
                return;
            }
            if self.options.headers && packet.version < HEADERS_VERSION {
                self.destroy(Some(PeerError::Handshake(
                    "peer does not support getheaders",
                )));
                return;
            }
            if self.options.spv && !packet.services.contains(Services::NODE_BLOOM) {
                self.destroy(Some(PeerError::Handshake(
                    "peer does not support bloom filters",
                )));
                return;
            }
            if self.options.witness && !packet.services.contains(Services::NODE_WITNESS) {
                if self.options.old_segwit {
                    // Legacy networks predate the witness service bit;
                    // wait for an explicit havewitness instead.
                    debug!(peer = %self.options.addr, "probing witness support via havewitness");
                    self.requests.request(Command::HaveWitness, now);
                } else {
                    self.destroy(Some(PeerError::Handshake(
                        "peer does not support segregated witness",
                    )));
                    return;
                }
            }
        }

        self.have_witness = packet.services.contains(Services::NODE_WITNESS);
        self.relay = packet.relay.unwrap_or(true);
        self.version = Some(packet.clone());

        // Inbound sessions answer with their own version first.
        self.start_version(now);
        self.send(Packet::Verack, now);

        let wire = Packet::Version(packet.clone());
        self.requests.response(&wire);
        self.events.push(Event::Version(packet));

        if self.verack_received {
            self.ready(now);
        }
    }

    fn handle_verack(&mut self, now: Instant) {
        if self.verack_received {
            debug!(peer = %self.options.addr, "peer sent a duplicate verack");
            return;
        }
        self.verack_received = true;

        self.requests.response(&Packet::Verack);
        self.events.push(Event::Verack);

        if self.version.is_some() {
            self.ready(now);
        } else {
            // Their version must still be on the way.
            self.requests.request(Command::Version, now);
        }
    }

    /// Both version and verack are in; the session goes fully duplex.
    fn ready(&mut self, now: Instant) {
        debug_assert!(self.version.is_some(), "ack requires a stored version");
        if self.ack {
            return;
        }
        self.ack = true;
        self.events.push(Event::Ack);
        self.next_ping = Some(now + PING_INTERVAL);

        let remote_version = self.version.as_ref().map(|v| v.version).unwrap_or(0);

        if self.options.headers && remote_version >= SENDHEADERS_VERSION {
            self.send(Packet::SendHeaders, now);
        }

        if self.options.witness && self.options.old_segwit {
            self.send(Packet::HaveWitness, now);
        }

        if self.options.compact && remote_version >= COMPACT_VERSION {
            self.send(
                Packet::SendCmpct(SendCmpctPacket {
                    mode: 0,
                    version: 1,
                }),
                now,
            );
        }

        if !self.sent_get_addr {
            self.sent_get_addr = true;
            self.send(Packet::GetAddr, now);
        }

        if self.options.spv {
            if let Some(filter) = self.options.spv_filter.clone() {
                self.send(Packet::FilterLoad(filter.to_packet()), now);
            }
        }

        // Re-announce whatever the pool is currently broadcasting.
        let broadcast: Vec<AnnounceItem> = self
            .pool
            .broadcast_items()
            .into_iter()
            .filter_map(|item| {
                if item.is_tx() {
                    self.pool.get_broadcast_tx(&item.hash).map(AnnounceItem::Tx)
                } else {
                    self.pool
                        .get_broadcast_block(&item.hash)
                        .map(AnnounceItem::Block)
                }
            })
            .collect();
        if !broadcast.is_empty() {
            self.announce(&broadcast, now);
        }

        if let Some(rate) = self.options.fee_rate {
            self.send(Packet::FeeFilter(rate), now);
        }

        self.sync(now);
    }

    /// Starts (or nudges) chain sync with this peer. Declines once the
    /// chain reports synced; the pool re-triggers sync on new tips.
    pub fn sync(&mut self, now: Instant) {
        if self.sync_sent || !self.ack || self.destroyed || self.chain.is_synced() {
            return;
        }
        // `ack` implies the remote version is stored.
        let remote_version = self
            .version
            .as_ref()
            .expect("ack implies version")
            .version;

        let locator = match self.chain.get_locator() {
            Ok(locator) => locator,
            Err(err) => {
                self.events.push(Event::Error(err.into()));
                return;
            }
        };

        let packet = crate::wire::message::LocatorPacket {
            version: self.options.protocol_version as u32,
            locator,
            stop: [0u8; 32],
        };

        if self.options.headers && remote_version >= HEADERS_VERSION {
            self.send(Packet::GetHeaders(packet), now);
        } else {
            self.send(Packet::GetBlocks(packet), now);
        }
        self.sync_sent = true;
    }

    // --- keep-alive ---------------------------------------------------------

    /// Sends a ping immediately (the keep-alive timer does this on its
    /// own every two minutes).
    pub fn ping(&mut self, now: Instant) {
        if self.destroyed || !self.ack {
            return;
        }
        self.send_ping(now);
    }

    fn send_ping(&mut self, now: Instant) {
        let remote_version = self.version.as_ref().map(|v| v.version).unwrap_or(0);

        if remote_version <= PONG_VERSION {
            // Pre-BIP31 peers get a nonce-less ping and never pong back.
            self.send(Packet::Ping(None), now);
            return;
        }

        if self.challenge.is_some() {
            debug!(peer = %self.options.addr, "ping already outstanding");
            return;
        }

        let nonce: u64 = rand::thread_rng().gen_range(1..u64::MAX);
        self.challenge = Some(nonce);
        self.last_ping = Some(now);
        self.send(Packet::Ping(Some(nonce)), now);
    }

    fn handle_ping(&mut self, nonce: Option<u64>, now: Instant) {
        self.events.push(Event::Ping(nonce));
        if let Some(nonce) = nonce {
            self.send(Packet::Pong(nonce), now);
        }
    }

    fn handle_pong(&mut self, nonce: u64, now: Instant) {
        let Some(challenge) = self.challenge else {
            debug!(peer = %self.options.addr, "unsolicited pong");
            return;
        };

        if nonce != challenge {
            if nonce == 0 {
                debug!(peer = %self.options.addr, "peer sent a zero pong nonce");
                self.challenge = None;
                return;
            }
            debug!(peer = %self.options.addr, "peer sent the wrong pong nonce");
            return;
        }

        self.challenge = None;

        let Some(last_ping) = self.last_ping else {
            return;
        };
        if now < last_ping {
            // Impossible with a monotonic clock; kept as a guard that
            // reports without updating the minimum.
            debug!(peer = %self.options.addr, "pong timing mismatch");
            return;
        }

        let sample = now - last_ping;
        self.last_pong = Some(now);
        self.min_ping = Some(self.min_ping.map_or(sample, |min| min.min(sample)));

        self.requests.response(&Packet::Pong(nonce));
        self.events.push(Event::Pong(sample));
    }

    // --- relay handlers -----------------------------------------------------

    fn handle_addr(&mut self, entries: Vec<AddrEntry>) {
        if entries.len() > MAX_ADDRS {
            self.violation("oversized addr", 100);
            return;
        }

        let mut fresh = vec![];
        for entry in entries {
            let mut key = vec![];
            match entry.addr.ip {
                std::net::IpAddr::V4(ip) => key.extend(ip.octets()),
                std::net::IpAddr::V6(ip) => key.extend(ip.octets()),
            }
            key.extend(entry.addr.port.to_be_bytes());

            if self.addr_filter.added(&key) {
                fresh.push(entry);
            }
        }

        if fresh.is_empty() {
            return;
        }
        self.events.push(Event::Addr(fresh));
    }

    fn handle_inv(&mut self, items: Vec<InvItem>, _now: Instant) {
        if items.len() > MAX_INV {
            self.violation("oversized inv", 100);
            return;
        }

        let mut blocks = vec![];
        let mut txs = vec![];
        for item in &items {
            match item.inv_type {
                InventoryType::Block
                | InventoryType::FilteredBlock
                | InventoryType::CompactBlock
                | InventoryType::WitnessBlock
                | InventoryType::WitnessFilteredBlock => blocks.push(item.hash),
                InventoryType::Tx | InventoryType::WitnessTx => txs.push(item.hash),
                InventoryType::Error => {
                    debug!(peer = %self.options.addr, "unknown inv type");
                }
            }
        }

        self.requests.response(&Packet::Inv(items.clone()));
        self.events.push(Event::Inv(items));
        if !blocks.is_empty() {
            self.events.push(Event::Blocks(blocks));
        }
        if !txs.is_empty() {
            self.events.push(Event::Txs(txs));
        }
    }

    fn handle_headers(&mut self, headers: Vec<BlockHeader>, _now: Instant) {
        if headers.len() > MAX_HEADERS {
            self.violation("oversized headers", 100);
            return;
        }

        self.requests.response(&Packet::Headers(headers.clone()));
        self.events.push(Event::Headers(headers));
    }

    fn handle_send_headers(&mut self) {
        if self.prefer_headers {
            debug!(peer = %self.options.addr, "peer sent a duplicate sendheaders");
            return;
        }
        self.prefer_headers = true;
        self.events.push(Event::SendHeaders);
    }

    fn handle_fee_filter(&mut self, rate: i64, _now: Instant) {
        if !(0..=MAX_MONEY).contains(&rate) {
            self.violation("invalid feefilter rate", 100);
            return;
        }
        self.fee_rate = Some(rate);
        self.events.push(Event::FeeFilter(rate));
    }

    fn handle_send_cmpct(&mut self, packet: SendCmpctPacket) {
        if packet.mode > 0 {
            debug!(peer = %self.options.addr, mode = packet.mode, "unsupported sendcmpct mode");
            return;
        }
        if packet.version != 1 {
            debug!(peer = %self.options.addr, version = packet.version, "unsupported sendcmpct version");
            return;
        }
        if self.compact_mode.is_some() {
            debug!(peer = %self.options.addr, "peer sent a duplicate sendcmpct");
            return;
        }
        self.compact_mode = Some(packet.mode);
        self.events.push(Event::SendCmpct(packet));
    }

    fn handle_have_witness(&mut self) {
        self.have_witness = true;
        self.requests.response(&Packet::HaveWitness);
        self.events.push(Event::HaveWitness);
    }

    // --- SPV filter lifecycle ----------------------------------------------

    fn handle_filter_load(&mut self, packet: FilterLoadPacket, _now: Instant) {
        if !BloomFilter::is_within_constraints(&packet) {
            self.violation("filterload outside BIP37 constraints", 100);
            return;
        }
        self.spv_filter = Some(BloomFilter::from_packet(&packet));
        self.relay = true;
    }

    fn handle_filter_add(&mut self, data: Vec<u8>, _now: Instant) {
        if data.len() > MAX_SCRIPT_PUSH {
            self.violation("filteradd data exceeds push limit", 100);
            return;
        }
        if let Some(filter) = self.spv_filter.as_mut() {
            filter.insert(&data);
        }
        self.relay = true;
    }

    fn handle_filter_clear(&mut self) {
        self.spv_filter = None;
        self.relay = true;
    }

    // --- announcements ------------------------------------------------------

    /// Announces blocks and transactions to this peer, honoring its
    /// preferences: SPV filter, headers-first, relay flag, fee filter
    /// and the inventory dedup filter.
    pub fn announce(&mut self, items: &[AnnounceItem], now: Instant) {
        if self.destroyed || !self.ack {
            return;
        }

        let mut headers = vec![];
        let mut invs = vec![];

        for item in items {
            match item {
                AnnounceItem::Tx(tx) => {
                    if let Some(filter) = &self.spv_filter {
                        if !filter.matches_tx(tx) {
                            continue;
                        }
                    }
                    if !self.relay {
                        continue;
                    }
                    let hash = tx.hash();
                    if let (Some(min), Some(mempool)) = (self.fee_rate, self.mempool.as_ref()) {
                        if let Some(rate) = mempool.rate(&hash) {
                            if (rate as i64) < min {
                                continue;
                            }
                        }
                    }
                    if self.inv_filter.contains(&hash) {
                        continue;
                    }
                    invs.push(InvItem::tx(hash));
                }
                AnnounceItem::Block(block) => {
                    let hash = block.hash();
                    if self.inv_filter.contains(&hash) {
                        continue;
                    }
                    if self.prefer_headers {
                        headers.push(block.header.clone());
                        continue;
                    }
                    invs.push(InvItem::block(hash));
                }
            }
        }

        if !headers.is_empty() {
            self.send_headers(headers, now);
        }
        self.send_inv(invs, now);
    }

    /// Queues inv packets, deduplicating against everything ever sent
    /// to this peer and chunking at the protocol limit.
    pub(crate) fn send_inv(&mut self, items: Vec<InvItem>, now: Instant) {
        let fresh: Vec<InvItem> = items
            .into_iter()
            .filter(|item| self.inv_filter.added(&item.hash))
            .collect();

        if fresh.is_empty() {
            return;
        }

        for chunk in fresh.chunks(MAX_INV) {
            self.send(Packet::Inv(chunk.to_vec()), now);
        }
    }

    /// Queues headers packets with the same dedup, chunked at 2,000.
    pub(crate) fn send_headers(&mut self, headers: Vec<BlockHeader>, now: Instant) {
        let fresh: Vec<BlockHeader> = headers
            .into_iter()
            .filter(|header| self.inv_filter.added(&header.hash()))
            .collect();

        if fresh.is_empty() {
            return;
        }

        for chunk in fresh.chunks(MAX_HEADERS) {
            self.send(Packet::Headers(chunk.to_vec()), now);
        }
    }

    // --- misbehavior --------------------------------------------------------

    /// Charges ban score and reports upward; crossing the threshold
    /// destroys the session (the pool bans the host).
    pub(crate) fn violation(&mut self, reason: &'static str, score: u32) {
        self.ban_score += score;
        warn!(peer = %self.options.addr, score, total = self.ban_score, reason, "misbehavior");
        self.events.push(Event::Misbehaving {
            score,
            total: self.ban_score,
        });

        if self.ban_score >= BAN_THRESHOLD {
            self.destroy(Some(PeerError::violation(reason, score)));
        }
    }

    pub(crate) fn serve_lock(&self) -> bool {
        !self.serving.swap(true, Ordering::Acquire)
    }

    pub(crate) fn serve_unlock(&self) {
        self.serving.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::store::{MemoryChain, MemoryMempool};
    use crate::wire::message::{Decode, OutPoint};
    use std::collections::HashMap;

    pub const LOCAL_NONCE: u64 = 0x1111_2222_3333_4444;
    pub const REMOTE_NONCE: u64 = 0xDEAD_BEEF_CAFE_F00D;

    pub fn peer_addr() -> SocketAddr {
        "203.0.113.5:8333".parse().unwrap()
    }

    /// Options trimmed down so the ready sequence stays predictable;
    /// tests opt into features explicitly.
    pub fn test_options(outbound: bool) -> PeerOptions {
        let mut options = PeerOptions::new(1, peer_addr(), outbound);
        options.local_nonce = LOCAL_NONCE;
        options.headers = false;
        options.compact = false;
        options.witness = false;
        options
    }

    pub fn net_addr() -> NetAddr {
        NetAddr {
            services: 0,
            ip: "198.51.100.7".parse().unwrap(),
            port: 8333,
        }
    }

    /// A remote /Satoshi:25.0.0/ node with the service bits our gates
    /// look for.
    pub fn remote_version() -> VersionPacket {
        VersionPacket {
            version: 70015,
            services: Services::NODE_NETWORK | Services::NODE_WITNESS | Services::NODE_BLOOM,
            timestamp: 1_700_000_000,
            addr_recv: net_addr(),
            addr_from: net_addr(),
            nonce: REMOTE_NONCE,
            user_agent: "/Satoshi:25.0.0/".to_string(),
            start_height: 820_000,
            relay: Some(true),
        }
    }

    /// Minimal legacy transaction whose prevout hash carries `marker`.
    pub fn tx_with_marker(marker: u8) -> Tx {
        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&[marker; 32]);
        raw.extend(&0u32.to_le_bytes());
        raw.push(0);
        raw.extend(&0xFFFFFFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend(&(marker as u64 * 100 + 1).to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend(&0u32.to_le_bytes());
        Tx::decode(&raw).unwrap()
    }

    pub fn coinbase_tx(seed: u8) -> Tx {
        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&OutPoint::null().to_bytes());
        raw.push(1);
        raw.push(seed);
        raw.extend(&0xFFFFFFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend(&5_000_000_000u64.to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend(&0u32.to_le_bytes());
        Tx::decode(&raw).unwrap()
    }

    pub fn merkle_root(txids: &[[u8; 32]]) -> [u8; 32] {
        use crate::wire::message::double_sha256;

        let mut row: Vec<[u8; 32]> = txids.to_vec();
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

    /// A block with a real merkle root, so partial trees verify.
    pub fn block_with(prev: [u8; 32], seed: u8, extra_txs: Vec<Tx>) -> Block {
        let mut txs = vec![coinbase_tx(seed)];
        txs.extend(extra_txs);
        let txids: Vec<[u8; 32]> = txs.iter().map(|tx| tx.hash()).collect();

        Block {
            header: BlockHeader {
                version: 1,
                prev_blockhash: prev,
                merkle_root: merkle_root(&txids),
                time: 1_700_000_000 + seed as u32,
                bits: 0x1d00ffff,
                nonce: seed as u32,
            },
            txs,
        }
    }

    /// A synced in-memory chain of `length` blocks (genesis included).
    pub fn synced_chain(length: usize) -> (Arc<MemoryChain>, Vec<Block>) {
        let genesis = block_with([0u8; 32], 0, vec![]);
        let mut blocks = vec![genesis.clone()];
        let chain = Arc::new(MemoryChain::new(genesis));

        for seed in 1..length {
            let prev = blocks[seed - 1].hash();
            let block = block_with(prev, seed as u8, vec![]);
            blocks.push(block.clone());
            chain.push(block);
        }

        chain.set_synced(true);
        (chain, blocks)
    }

    /// A pool view with configurable broadcast items and addresses.
    #[derive(Default)]
    pub struct TestPool {
        pub addrs: Vec<AddrEntry>,
        pub txs: HashMap<[u8; 32], Arc<Tx>>,
        pub blocks: HashMap<[u8; 32], Arc<Block>>,
    }

    impl crate::store::PoolView for TestPool {
        fn broadcast_items(&self) -> Vec<InvItem> {
            let mut items: Vec<InvItem> =
                self.txs.keys().map(|hash| InvItem::tx(*hash)).collect();
            items.extend(self.blocks.keys().map(|hash| InvItem::block(*hash)));
            items
        }

        fn get_broadcast_tx(&self, hash: &[u8; 32]) -> Option<Arc<Tx>> {
            self.txs.get(hash).cloned()
        }

        fn get_broadcast_block(&self, hash: &[u8; 32]) -> Option<Arc<Block>> {
            self.blocks.get(hash).cloned()
        }

        fn addresses(&self, max: usize) -> Vec<AddrEntry> {
            self.addrs.iter().take(max).cloned().collect()
        }
    }

    pub struct Harness {
        pub peer: Peer,
        pub t0: Instant,
    }

    impl Harness {
        pub fn new(options: PeerOptions, chain: Arc<MemoryChain>) -> Self {
            Harness::with_stores(options, chain, None, Arc::new(TestPool::default()))
        }

        pub fn with_stores(
            options: PeerOptions,
            chain: Arc<MemoryChain>,
            mempool: Option<Arc<MemoryMempool>>,
            pool: Arc<dyn crate::store::PoolView>,
        ) -> Self {
            let mempool: Option<Arc<dyn crate::store::Mempool>> = match mempool {
                Some(mempool) => Some(mempool),
                None => None,
            };
            Harness {
                peer: Peer::new(options, chain, mempool, pool),
                t0: Instant::now(),
            }
        }

        /// Runs the whole version exchange so the session is Ready.
        pub fn handshake(&mut self) {
            let t0 = self.t0;
            self.peer.on_connect(t0);
            self.peer
                .handle_packet(Packet::Version(remote_version()), t0);
            self.peer.handle_packet(Packet::Verack, t0);
            assert!(self.peer.is_ack(), "handshake should reach ack");
            self.peer.take_outbound();
            self.peer.take_events();
        }

        pub fn out(&mut self) -> Vec<Packet> {
            self.peer.take_outbound()
        }

        pub fn events(&mut self) -> Vec<Event> {
            self.peer.take_events()
        }
    }
}
