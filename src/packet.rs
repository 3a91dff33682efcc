//! Fixed-layout packet framing: a 10-byte header in network byte order
//! followed by 0..MAX_PAYLOAD bytes of payload, with a single parity bit
//! over the whole serialized packet for corruption detection.

use crate::error::Error;

pub const HEADER_LEN: usize = 10;

/// Bits of the `flags` header field.
pub mod flags {
    pub const SYN: u16 = 0x01;
    pub const ACK: u16 = 0x02;
    pub const PARITY: u16 = 0x04;
}

/// Why a received datagram could not be turned into a `Packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than `HEADER_LEN` bytes, or the declared `length` field does
    /// not fit the bytes actually received.
    Malformed,
    /// Header parsed fine but the parity-XOR over the packet is nonzero.
    Corrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u16,
    pub ack: u16,
    pub win: u16,
    pub flags: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn has_flag(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has_flag(flags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.has_flag(flags::ACK)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serializes this packet, setting the `PARITY` bit so the XOR-parity
    /// of the full serialized packet is zero.
    pub fn encode(&self, max_payload: u16) -> Result<Vec<u8>, Error> {
        if self.payload.len() > max_payload as usize {
            return Err(Error::PayloadTooLarge {
                len: self.payload.len(),
                max: max_payload as usize,
            });
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.seq.to_be_bytes());
        bytes.extend_from_slice(&self.ack.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.win.to_be_bytes());
        bytes.extend_from_slice(&(self.flags & !flags::PARITY).to_be_bytes());
        bytes.extend_from_slice(&self.payload);

        if parity_bit(&bytes) != 0 {
            let flags_with_parity = (self.flags & !flags::PARITY) | flags::PARITY;
            let flag_offset = 8;
            bytes[flag_offset..flag_offset + 2]
                .copy_from_slice(&flags_with_parity.to_be_bytes());
        }

        Ok(bytes)
    }

    /// Parses and checksum-verifies a received datagram. Malformed framing
    /// (too short, inconsistent length) and parity failure are reported
    /// distinctly; both mean the caller must discard the datagram silently.
    pub fn parse_and_verify(bytes: &[u8]) -> Result<Packet, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Malformed);
        }

        let seq = u16::from_be_bytes([bytes[0], bytes[1]]);
        let ack = u16::from_be_bytes([bytes[2], bytes[3]]);
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        let win = u16::from_be_bytes([bytes[6], bytes[7]]);
        let pkt_flags = u16::from_be_bytes([bytes[8], bytes[9]]);

        if bytes.len() != HEADER_LEN + length {
            return Err(FrameError::Malformed);
        }

        if parity_bit(bytes) != 0 {
            return Err(FrameError::Corrupt);
        }

        Ok(Packet {
            seq,
            ack,
            win,
            flags: pkt_flags & !flags::PARITY,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Folds every byte's bits into one bit via XOR, then XORs across all bytes.
fn parity_bit(bytes: &[u8]) -> u8 {
    let mut acc = 0u8;
    for &b in bytes {
        let mut byte_parity = b;
        byte_parity ^= byte_parity >> 4;
        byte_parity ^= byte_parity >> 2;
        byte_parity ^= byte_parity >> 1;
        acc ^= byte_parity & 1;
    }
    acc
}
