//! Driving contracts for the encrypted-transport (BIP151) and
//! peer-authentication (BIP150) handshakes.
//!
//! The session sequences these handshakes but never touches the
//! cryptography: a driver object owns the keys and produces/consumes
//! the handshake payloads. The session's responsibilities are ordering
//! (encryption first, then auth, then the version exchange), the 3 s
//! phase deadlines, and rejecting any other packet while a phase is
//! incomplete.

use std::time::Duration;

use crate::error::PeerError;
use crate::wire::message::{EncAckPacket, EncInitPacket};

/// How long either handshake phase may take before the session gives up.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// BIP151 encryption handshake driver.
///
/// Lifecycle as the session drives it:
/// 1. `to_encinit` produces our opening message (sent on connect).
/// 2. The remote's `encinit` goes through `on_encinit`, which yields
///    our `encack` reply.
/// 3. The remote's `encack` goes through `on_encack`; once both sides
///    have acked, `completed` flips and `success` reports the outcome.
///
/// Any step may fail (bad key, unsupported cipher); the driver then
/// reports completed-without-success and the session decides whether
/// that is fatal (it is when authentication is also required).
pub trait EncryptionDriver: Send {
    fn completed(&self) -> bool;
    fn success(&self) -> bool;

    fn to_encinit(&mut self) -> EncInitPacket;
    fn on_encinit(&mut self, packet: &EncInitPacket) -> Result<EncAckPacket, PeerError>;
    fn on_encack(&mut self, packet: &EncAckPacket) -> Result<(), PeerError>;

    /// Forced completion with failure: premature packet or phase
    /// timeout. Idempotent.
    fn complete_with_error(&mut self);

    fn destroy(&mut self);
}

/// BIP150 authentication handshake driver, layered above BIP151.
///
/// The outbound side opens with `authchallenge` when it knows the
/// remote's identity key; the inbound side answers challenges and may
/// propose its own identity. All failures here are fatal to the
/// session.
pub trait AuthDriver: Send {
    fn completed(&self) -> bool;
    fn success(&self) -> bool;

    /// Our opening challenge, when a known remote identity exists.
    fn to_challenge(&mut self) -> Option<[u8; 32]>;
    /// Remote challenge → our signature reply.
    fn on_challenge(&mut self, hash: &[u8; 32]) -> Result<Box<[u8; 64]>, PeerError>;
    /// Remote reply → optionally our identity proposal.
    fn on_reply(&mut self, sig: &[u8; 64]) -> Result<Option<[u8; 32]>, PeerError>;
    /// Remote proposal → our counter-challenge.
    fn on_propose(&mut self, hash: &[u8; 32]) -> Result<[u8; 32], PeerError>;

    /// Forced completion with failure. Idempotent.
    fn complete_with_error(&mut self);

    fn destroy(&mut self);
}
