use pnet::util::MacAddr;

use crate::error::{FrameError, MacError};

pub const BROADCAST_MAC: [u8; 6] = [ 0xff, 0xff, 0xff, 0xff, 0xff, 0xff ];

const MAC_REPETITIONS: usize = 16;

/// Sync stream plus 16 copies of the target MAC.
pub const MAGIC_PACKET_LEN: usize = 6 + 6 * MAC_REPETITIONS;

/// A validated Wake-on-LAN payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket {
    pub target: MacAddr,
    /// SecureOn trailer. Carried for logging only, never matched.
    pub password: Option<Vec<u8>>,
}

/// Parses a magic packet: `FF x 6`, then the target MAC 16 times, then an
/// optional 4 or 6 byte password.
pub fn parse_magic_packet(payload: &[u8]) -> Result<MagicPacket, FrameError> {
    match payload.len() {
        n if n == MAGIC_PACKET_LEN || n == MAGIC_PACKET_LEN + 4 || n == MAGIC_PACKET_LEN + 6 => {}
        n => return Err(FrameError::Length(n)),
    }

    let (frame, trailer) = payload.split_at(MAGIC_PACKET_LEN);
    let blocks: Vec<&[u8]> = frame.chunks(6).collect();
    if blocks[0] != BROADCAST_MAC {
        return Err(FrameError::Sync);
    }

    for (i, block) in blocks.iter().enumerate().skip(2) {
        if *block != blocks[1] {
            return Err(FrameError::Repetition(i - 1));
        }
    }

    let t = blocks[1];
    Ok(MagicPacket {
        target: MacAddr::new(t[0], t[1], t[2], t[3], t[4], t[5]),
        password: (!trailer.is_empty()).then(|| trailer.to_vec()),
    })
}

/// Canonical registry key: uppercase, colon-delimited.
pub fn canonical_mac(mac: &MacAddr) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac.0, mac.1, mac.2, mac.3, mac.4, mac.5
    )
}

/// Parses the raw adapter address reported by the hypervisor, which is 12 hex
/// digits without separators (`00155D01020A`).
pub fn parse_raw_mac(raw: &str) -> Result<MacAddr, MacError> {
    let hex = raw.trim();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MacError::Malformed(hex.to_string()));
    }

    let mut octets = [0u8; 6];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| MacError::Malformed(hex.to_string()))?;
    }
    Ok(MacAddr::new(octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]))
}

/// Lenient variant for addresses typed by people: accepts `:` or `-`
/// separators and any case.
pub fn parse_mac(text: &str) -> Result<MacAddr, MacError> {
    let stripped: String = text.trim().chars().filter(|c| *c != ':' && *c != '-').collect();
    parse_raw_mac(&stripped).map_err(|_| MacError::Malformed(text.to_string()))
}

#[cfg(test)]
pub(crate) fn build_magic_packet(mac: [u8; 6], password: &[u8]) -> Vec<u8> {
    let mut pkt = BROADCAST_MAC.to_vec();
    for _ in 0..MAC_REPETITIONS {
        pkt.extend_from_slice(&mac);
    }
    pkt.extend_from_slice(password);
    pkt
}
