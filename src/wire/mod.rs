//! Bitcoin P2P wire protocol primitives.
//!
//! This module provides the codec layer underneath the peer session:
//!
//! - Parsing of the 24-byte Bitcoin message header, with magic and
//!   checksum validation
//! - Extraction of command name and payload
//! - Typed decoding of every command the session dispatches on, via
//!   [`Packet`]
//! - The symmetric encoders used for outbound packets
//!
//! The session layer only ever sees logical [`Packet`] values; framing
//! details stay here.
//!
//! Protocol reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html
pub mod codec;

pub mod constants;
pub mod decode;
pub mod message;
pub mod payload;

pub use codec::{frame, frame_packet, read_message, send_message};
pub use message::{Command, Packet};
