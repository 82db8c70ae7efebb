//! A Bitcoin P2P peer session.
//!
//! This crate implements the core peer object of a full-node/SPV
//! client: one long-lived session with one remote node speaking the
//! Bitcoin wire protocol. The [`peer::Peer`] state machine owns the
//! whole lifecycle of a connection: optional BIP151/BIP150 handshake
//! sequencing, version negotiation, keep-alive, inventory relay, block
//! and transaction serving, compact-block and merkleblock reassembly,
//! and misbehavior scoring.
//!
//! The state machine is I/O-free: packets and a monotonic clock go in,
//! outbound packets and typed [`events::Event`]s come out. [`net`]
//! binds it to a TCP stream with one reader, one writer and one session
//! thread per peer. Chain, mempool and pool state stay behind the
//! narrow [`store`] contracts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use crossbeam_channel::unbounded;
//! use btc_peer::net;
//! use btc_peer::peer::{Peer, PeerOptions};
//! use btc_peer::store::{mainnet_genesis, EmptyPool, MemoryChain};
//!
//! let addr = "203.0.113.5:8333".parse().unwrap();
//! let chain = Arc::new(MemoryChain::new(mainnet_genesis()));
//! let peer = Peer::new(PeerOptions::new(0, addr, true), chain, None, Arc::new(EmptyPool));
//!
//! let (events, event_rx) = unbounded();
//! let handle = net::connect(addr, peer, events).unwrap();
//! while let Ok((peer_id, event)) = event_rx.recv() {
//!     println!("peer {peer_id}: {event:?}");
//! }
//! # let _ = handle;
//! ```

pub mod compact;
pub mod error;
pub mod events;
pub mod filter;
pub mod merkle;
pub mod net;
pub mod peer;
pub mod store;
pub mod wire;

pub use error::{PeerError, Result};
pub use events::Event;
pub use peer::{AnnounceItem, Peer, PeerOptions};
pub use wire::{Command, Packet};
