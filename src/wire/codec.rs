use crate::wire::constants::{MAIN_NET_MAGIC, MAX_MESSAGE_SIZE};
use crate::wire::message::{Command, Packet, RawMessage};
use std::io::{self, Read, Write};

/// Reads a raw Bitcoin P2P message frame from any [`Read`] source.
///
/// This function:
/// 1. Reads the 24-byte Bitcoin message header
/// 2. Extracts magic, command, length and checksum
/// 3. Reads the payload according to the length field
/// 4. Validates the magic value and the payload checksum
///
/// A bad magic means the stream is not speaking our network's protocol;
/// a bad checksum means a corrupt or malicious frame. Both surface as
/// `InvalidData`, which the session treats as a protocol violation
/// rather than a transport failure.
///
/// # Example
///
/// ```
/// use std::io::Cursor;
/// use btc_peer::wire::{self};
/// use btc_peer::wire::message::{Command};
///
/// // Build a minimal "verack" frame:
/// let mut bytes = vec![];
///
/// // Magic (mainnet)
/// bytes.extend_from_slice(&[0xF9, 0xBE, 0xB4, 0xD9]);
///
/// // Command "verack" padded to 12 bytes
/// let mut cmd = [0u8; 12];
/// cmd[..6].copy_from_slice(b"verack");
/// bytes.extend_from_slice(&cmd);
///
/// // Payload length = 0
/// bytes.extend_from_slice(&0u32.to_le_bytes());
///
/// // Checksum of the empty payload
/// bytes.extend_from_slice(&[0x5D, 0xF6, 0xE0, 0xE2]);
///
/// let mut cursor = Cursor::new(bytes);
///
/// let raw = wire::codec::read_message(&mut cursor).unwrap();
/// assert_eq!(raw.command, Command::Verack);
/// assert!(raw.payload.is_empty());
/// ```
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<RawMessage> {
    let mut header = [0u8; 24];
    reader.read_exact(&mut header)?;

    let magic: [u8; 4] = header[0..4]
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid magic field"))?;

    if u32::from_le_bytes(magic) != MAIN_NET_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "wrong network magic",
        ));
    }

    let raw_command: [u8; 12] = header[4..16]
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid cmd field"))?;

    let command = Command::from(&raw_command);

    let length = u32::from_le_bytes(
        header[16..20]
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid length field"))?,
    );

    if length as usize > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 32MB limit",
        ));
    }

    let checksum: [u8; 4] = header[20..24]
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid checksum field"))?;

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;

    if checksum != payload_checksum(&payload) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "checksum mismatch",
        ));
    }

    Ok(RawMessage {
        magic,
        command,
        raw_command,
        payload,
        checksum,
    })
}

/// First four bytes of SHA256(SHA256(payload)): the frame checksum.
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(Sha256::digest(payload));
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Serializes a complete Bitcoin P2P message frame.
///
/// ```text
/// +------------+--------------+---------------+------------+
/// | magic (4)  | command (12) | length (4 LE) | checksum(4)|
/// +------------+--------------+---------------+------------+
/// | payload (variable)                                ...  |
/// +----------------------------------------------------------
/// ```
///
/// `checksum` may be pre-supplied when the caller already knows the
/// payload's double SHA256: a `tx` packet's checksum is the first four
/// bytes of its cached wtxid, which saves hashing the payload again.
pub fn frame(command: Command, payload: &[u8], checksum: Option<[u8; 4]>) -> Vec<u8> {
    use byteorder::{LittleEndian, WriteBytesExt};

    let mut out = Vec::with_capacity(24 + payload.len());

    out.write_u32::<LittleEndian>(MAIN_NET_MAGIC).unwrap();
    out.extend(&command.as_bytes());
    out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    out.extend(&checksum.unwrap_or_else(|| payload_checksum(payload)));
    out.extend_from_slice(payload);

    out
}

/// Frames a logical packet, reusing the cached wtxid of `tx` packets as
/// the checksum.
pub fn frame_packet(packet: &Packet) -> Vec<u8> {
    let payload = packet.payload_bytes();

    let checksum = match packet {
        Packet::Tx(tx) => {
            let hash = tx.witness_hash();
            Some([hash[0], hash[1], hash[2], hash[3]])
        }
        _ => None,
    };

    frame(packet.command(), &payload, checksum)
}

/// Writes a complete Bitcoin P2P message frame to the given writer.
///
/// # Arguments
///
/// * `writer`  - Any type implementing [`Write`] (e.g. `TcpStream`,
///               `Cursor<Vec<u8>>`, `BufWriter`, TLS streams, etc.)
/// * `command` - The Bitcoin P2P command to send
/// * `payload` - The raw payload bytes
///
/// # Errors
///
/// Returns an error if writing to the underlying stream fails.
pub fn send_message<W: Write>(writer: &mut W, command: Command, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&frame(command, payload, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::Decode;
    use crate::wire::message::{Tx, VersionPacket};
    use std::io::Cursor;

    /// Builds a full Bitcoin message frame (header + payload) with a
    /// correct checksum.
    fn build_frame(cmd_str: &[u8], payload: &[u8]) -> Vec<u8> {
        const MAINNET_MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];

        let mut bytes = vec![];

        // magic
        bytes.extend_from_slice(&MAINNET_MAGIC);

        // command padded to 12 bytes
        let mut cmd = [0u8; 12];
        cmd[..cmd_str.len()].copy_from_slice(cmd_str);
        bytes.extend_from_slice(&cmd);

        // length
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        // checksum
        bytes.extend_from_slice(&payload_checksum(payload));

        // payload
        bytes.extend_from_slice(payload);

        bytes
    }

    /// Encodes a single NetAddr field as used in version / addr payloads.
    fn net_addr_bytes(services: u64, ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut b = vec![];
        b.extend_from_slice(&services.to_le_bytes());
        b.extend_from_slice(&[0u8; 10]);
        b.extend_from_slice(&[0xFF, 0xFF]);
        b.extend_from_slice(&ip);
        b.extend_from_slice(&port.to_be_bytes());
        b
    }

    /// Realistic version payload for protocol v70015 (/Satoshi:25.0.0/).
    /// services = NODE_NETWORK(1) | NODE_WITNESS(8) | NODE_NETWORK_LIMITED(1024) = 1033
    fn version_payload_v70015() -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&70015i32.to_le_bytes());
        p.extend_from_slice(&1033u64.to_le_bytes());
        p.extend_from_slice(&1700000000i64.to_le_bytes());
        p.extend(net_addr_bytes(1033, [192, 168, 1, 1], 8333)); // addr_recv
        p.extend(net_addr_bytes(1033, [10, 0, 0, 1], 8333)); // addr_from
        p.extend_from_slice(&0x1234567890abcdefu64.to_le_bytes()); // nonce
        let ua = b"/Satoshi:25.0.0/";
        p.push(ua.len() as u8);
        p.extend_from_slice(ua);
        p.extend_from_slice(&820000i32.to_le_bytes()); // start_height
        p.push(1); // relay = true
        p
    }

    #[test]
    fn read_message_recognises_version_command() {
        let mut cursor = Cursor::new(build_frame(b"version", &version_payload_v70015()));

        let raw = read_message(&mut cursor).unwrap();
        assert_eq!(raw.command, Command::Version);
        assert!(!raw.payload.is_empty());
    }

    #[test]
    fn read_message_verack_has_empty_payload() {
        let bytes = build_frame(b"verack", &[]);
        let mut cursor = Cursor::new(bytes);

        let raw = read_message(&mut cursor).unwrap();
        assert_eq!(raw.command, Command::Verack);
        assert!(raw.payload.is_empty());
    }

    #[test]
    fn read_message_unknown_command_preserved_in_payload() {
        let mut cursor = Cursor::new(build_frame(b"wtfmessage", &[1, 2, 3]));

        let raw = read_message(&mut cursor).unwrap();
        assert_eq!(raw.command, Command::Unknown);
        assert_eq!(raw.payload, vec![1, 2, 3]);
        assert_eq!(&raw.raw_command[..10], b"wtfmessage");
    }

    #[test]
    fn read_message_rejects_wrong_magic() {
        let mut bytes = build_frame(b"verack", &[]);
        bytes[0] = 0x0B; // testnet3 magic leader

        let err = read_message(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_message_rejects_bad_checksum() {
        let mut bytes = build_frame(b"ping", &7u64.to_le_bytes());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // corrupt payload

        let err = read_message(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_and_read_round_trip() {
        let framed = frame(Command::Ping, &99u64.to_le_bytes(), None);
        let raw = read_message(&mut Cursor::new(framed)).unwrap();

        assert_eq!(raw.command, Command::Ping);
        assert_eq!(raw.payload, 99u64.to_le_bytes());
    }

    #[test]
    fn send_message_writes_readable_frame() {
        let mut buffer = Vec::new();
        send_message(&mut buffer, Command::Verack, &[]).unwrap();

        let raw = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(raw.command, Command::Verack);
    }

    #[test]
    fn frame_packet_reuses_tx_hash_as_checksum() {
        // legacy single-input single-output tx
        let mut raw = vec![];
        raw.extend(&1i32.to_le_bytes());
        raw.push(1);
        raw.extend(&[0x77; 32]);
        raw.extend(&0u32.to_le_bytes());
        raw.push(0);
        raw.extend(&0xFFFFFFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend(&5000u64.to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend(&0u32.to_le_bytes());
        let tx = Tx::decode(&raw).unwrap();

        let framed = frame_packet(&Packet::Tx(tx.clone()));

        // The supplied checksum must equal the computed one, so the
        // frame reads back cleanly.
        let read = read_message(&mut Cursor::new(framed)).unwrap();
        assert_eq!(read.command, Command::Tx);
        assert_eq!(read.checksum, payload_checksum(&read.payload));
        assert_eq!(&read.checksum, &tx.witness_hash()[..4]);
    }

    #[test]
    fn decoded_version_packet_from_frame() {
        let mut cursor = Cursor::new(build_frame(b"version", &version_payload_v70015()));
        let raw = read_message(&mut cursor).unwrap();
        let Packet::Version(v) = Packet::try_from(raw).unwrap() else {
            panic!("expected Packet::Version");
        };
        assert_eq!(v.version, 70015);
        let _ = VersionPacket::decode(&version_payload_v70015()).unwrap();
    }
}
