use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use std::error::Error;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use btc_peer::events::Event;
use btc_peer::net;
use btc_peer::peer::{Peer, PeerOptions};
use btc_peer::store::{mainnet_genesis, EmptyPool, MemoryChain};

#[derive(Parser)]
#[command(name = "btc-cli")]
struct Cli {
    #[arg(long)]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handshake, measure one ping round trip, exit.
    Ping,
    /// Handshake and print the peer addresses the node shares.
    GetAddr,
    /// Handshake and print every event the session reports.
    Listen,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    println!("Connecting to {}", cli.node);

    let addr = cli
        .node
        .to_socket_addrs()?
        .next()
        .ok_or("could not resolve address")?;

    let chain = Arc::new(MemoryChain::new(mainnet_genesis()));
    let options = PeerOptions::new(0, addr, true);

    let peer = Peer::new(options, chain, None, Arc::new(EmptyPool));
    let (event_tx, event_rx) = unbounded();
    let handle = net::connect(addr, peer, event_tx)?;

    // Wait for the version/verack exchange before doing anything.
    let deadline = Duration::from_secs(30);
    loop {
        match event_rx.recv_timeout(deadline)? {
            (_, Event::Ack) => break,
            (_, Event::Close) => return Err("session closed during handshake".into()),
            (_, Event::Error(err)) => eprintln!("session error: {err}"),
            _ => {}
        }
    }
    println!("Handshake complete");

    match cli.command {
        Commands::Ping => {
            handle.ping();
            loop {
                match event_rx.recv_timeout(deadline)? {
                    (_, Event::Pong(rtt)) => {
                        println!("Received matching pong in {} ms", rtt.as_millis());
                        break;
                    }
                    (_, Event::Close) => return Err("session closed".into()),
                    _ => {}
                }
            }
        }
        Commands::GetAddr => {
            // The session sends getaddr on its own right after ack.
            loop {
                match event_rx.recv_timeout(deadline)? {
                    (_, Event::Addr(entries)) => {
                        println!("Received {} peers", entries.len());
                        for entry in entries {
                            println!("  {}:{}", entry.addr.ip, entry.addr.port);
                        }
                        break;
                    }
                    (_, Event::Close) => return Err("session closed".into()),
                    _ => {}
                }
            }
        }
        Commands::Listen => loop {
            match event_rx.recv()? {
                (_, Event::Close) => {
                    println!("Peer closed the session.");
                    break;
                }
                (_, event) => println!("{event:?}"),
            }
        },
    }

    handle.destroy();
    handle.join();

    Ok(())
}
