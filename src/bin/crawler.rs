//! Walks the mainnet DNS seeds, handshakes with each node and counts
//! the peer addresses it shares.

use crossbeam_channel::unbounded;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use btc_peer::events::Event;
use btc_peer::net;
use btc_peer::peer::{Peer, PeerOptions};
use btc_peer::store::{mainnet_genesis, EmptyPool, MemoryChain};
use btc_peer::wire::constants::MAINNET_DNS_SEEDS;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    for (id, seed) in MAINNET_DNS_SEEDS.iter().enumerate() {
        println!("Connecting to: {seed}");

        let Some(addr) = seed.to_socket_addrs().ok().and_then(|mut a| a.next()) else {
            println!("Could not resolve {seed}, skipping...");
            continue;
        };

        let chain = Arc::new(MemoryChain::new(mainnet_genesis()));
        let options = PeerOptions::new(id as u32, addr, true);
        let peer = Peer::new(options, chain, None, Arc::new(EmptyPool));

        let (event_tx, event_rx) = unbounded();
        let handle = match net::connect(addr, peer, event_tx) {
            Ok(handle) => handle,
            Err(err) => {
                println!("Failed to connect to {addr}: {err}, skipping...");
                continue;
            }
        };

        // The session requests addresses by itself after the
        // handshake; wait for the reply, then move on.
        let deadline = Duration::from_secs(30);
        loop {
            match event_rx.recv_timeout(deadline) {
                Ok((_, Event::Addr(entries))) => {
                    println!("Received {} peer addresses from {seed}", entries.len());
                    break;
                }
                Ok((_, Event::Close)) => {
                    println!("Session with {seed} closed early");
                    break;
                }
                Ok(_) => {}
                Err(_) => {
                    println!("Timed out waiting for addresses from {seed}");
                    break;
                }
            }
        }

        handle.destroy();
        handle.join();
    }

    Ok(())
}
