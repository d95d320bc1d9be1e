//! Packet header codec.
//!
//! The wire header is exactly 16 bytes, packed as two little-endian 64-bit
//! words with explicit shifts and masks so the layout does not depend on
//! compiler bit-field rules.
//!
//! ```text
//! word 0 (bytes 0..8)                    word 1 (bytes 8..16)
//! bits  0..8    req_type                 bits  0..44  req_num
//! bits  8..32   msg_size                 bits 44..48  magic
//! bits 32..48   dest_session_num         bits 48..64  reserved (zero)
//! bit   48      is_req
//! bit   49      is_first
//! bit   50      is_expected
//! bits 51..64   pkt_num
//! ```

use crate::error::{Error, Result};

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 16;

const _: () = assert!(PKT_HDR_SIZE.is_power_of_two());

pub const MSG_SIZE_BITS: u32 = 24;
pub const PKT_NUM_BITS: u32 = 13;
pub const REQ_NUM_BITS: u32 = 44;
pub const PKT_HDR_MAGIC_BITS: u32 = 4;

/// Magic stamped into every header the engine writes.
pub const PKT_HDR_MAGIC: u8 = 11;

const _: () = assert!((PKT_HDR_MAGIC as u64) < (1 << PKT_HDR_MAGIC_BITS));

/// Maximum message size (24 bits).
pub const MAX_MSG_SIZE: usize = (1 << MSG_SIZE_BITS) - 1;

/// Maximum packet number (13 bits).
pub const MAX_PKT_NUM: u16 = (1 << PKT_NUM_BITS) - 1;

/// Maximum request number (44 bits).
pub const MAX_REQ_NUM: u64 = (1 << REQ_NUM_BITS) - 1;

const MSG_SIZE_SHIFT: u32 = 8;
const SESSION_SHIFT: u32 = 32;
const IS_REQ_SHIFT: u32 = 48;
const IS_FIRST_SHIFT: u32 = 49;
const IS_EXPECTED_SHIFT: u32 = 50;
const PKT_NUM_SHIFT: u32 = 51;
const MAGIC_SHIFT: u32 = 44;

/// Packet kind derived from the `is_req` and `is_expected` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktKind {
    /// Request packet (always unsolicited).
    Req,
    /// Response packet, expected by the client.
    Resp,
    /// Explicit credit return for one request packet. Carries no payload.
    ExplCr,
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Application-defined RPC opcode.
    pub req_type: u8,
    /// Total message size, header-exclusive (24 bits).
    pub msg_size: u32,
    /// Session number at the receiver.
    pub dest_session_num: u16,
    pub is_req: bool,
    pub is_first: bool,
    pub is_expected: bool,
    /// Packet index within the message (13 bits).
    pub pkt_num: u16,
    /// Window-scaled exchange counter (44 bits).
    pub req_num: u64,
    /// Sanity marker (4 bits).
    pub magic: u8,
}

impl PacketHeader {
    fn new(
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        kind: PktKind,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= MAX_MSG_SIZE);
        debug_assert!(pkt_num <= MAX_PKT_NUM);
        debug_assert!(req_num <= MAX_REQ_NUM);

        Self {
            req_type,
            msg_size: msg_size as u32,
            dest_session_num,
            is_req: kind == PktKind::Req,
            is_first: pkt_num == 0,
            is_expected: kind == PktKind::Resp,
            pkt_num,
            req_num,
            magic: PKT_HDR_MAGIC,
        }
    }

    /// Header for request packet `pkt_num` of a `msg_size`-byte request.
    pub fn new_req(
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        Self::new(req_type, msg_size, dest_session_num, PktKind::Req, pkt_num, req_num)
    }

    /// Header for response packet `pkt_num` of a `msg_size`-byte response.
    pub fn new_resp(
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        Self::new(req_type, msg_size, dest_session_num, PktKind::Resp, pkt_num, req_num)
    }

    /// Header for an explicit credit return acknowledging request packet `pkt_num`.
    pub fn new_expl_cr(req_type: u8, dest_session_num: u16, pkt_num: u16, req_num: u64) -> Self {
        Self::new(req_type, 0, dest_session_num, PktKind::ExplCr, pkt_num, req_num)
    }

    /// Get the packet kind.
    #[inline]
    pub fn kind(&self) -> PktKind {
        match (self.is_req, self.is_expected) {
            (true, _) => PktKind::Req,
            (false, true) => PktKind::Resp,
            (false, false) => PktKind::ExplCr,
        }
    }

    #[inline]
    pub fn msg_size(&self) -> usize {
        self.msg_size as usize
    }

    /// Check the magic.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == PKT_HDR_MAGIC
    }

    /// Validate the packet header.
    pub fn validate(&self) -> Result<()> {
        if self.magic != PKT_HDR_MAGIC {
            return Err(Error::CorruptHeader {
                expected: PKT_HDR_MAGIC,
                got: self.magic,
            });
        }
        Ok(())
    }

    /// Pack into the 16-byte wire form. Out-of-range fields are truncated.
    pub fn encode(&self) -> [u8; PKT_HDR_SIZE] {
        let w0 = (self.req_type as u64)
            | (((self.msg_size as u64) & mask(MSG_SIZE_BITS)) << MSG_SIZE_SHIFT)
            | ((self.dest_session_num as u64) << SESSION_SHIFT)
            | ((self.is_req as u64) << IS_REQ_SHIFT)
            | ((self.is_first as u64) << IS_FIRST_SHIFT)
            | ((self.is_expected as u64) << IS_EXPECTED_SHIFT)
            | (((self.pkt_num as u64) & mask(PKT_NUM_BITS)) << PKT_NUM_SHIFT);
        let w1 = (self.req_num & mask(REQ_NUM_BITS))
            | (((self.magic as u64) & mask(PKT_HDR_MAGIC_BITS)) << MAGIC_SHIFT);

        let mut out = [0u8; PKT_HDR_SIZE];
        out[..8].copy_from_slice(&w0.to_le_bytes());
        out[8..].copy_from_slice(&w1.to_le_bytes());
        out
    }

    /// Unpack from the 16-byte wire form. Does not validate the magic.
    pub fn decode(bytes: &[u8; PKT_HDR_SIZE]) -> Self {
        let mut w = [0u8; 8];
        w.copy_from_slice(&bytes[..8]);
        let w0 = u64::from_le_bytes(w);
        w.copy_from_slice(&bytes[8..]);
        let w1 = u64::from_le_bytes(w);

        Self {
            req_type: (w0 & 0xFF) as u8,
            msg_size: ((w0 >> MSG_SIZE_SHIFT) & mask(MSG_SIZE_BITS)) as u32,
            dest_session_num: ((w0 >> SESSION_SHIFT) & 0xFFFF) as u16,
            is_req: (w0 >> IS_REQ_SHIFT) & 1 != 0,
            is_first: (w0 >> IS_FIRST_SHIFT) & 1 != 0,
            is_expected: (w0 >> IS_EXPECTED_SHIFT) & 1 != 0,
            pkt_num: ((w0 >> PKT_NUM_SHIFT) & mask(PKT_NUM_BITS)) as u16,
            req_num: w1 & mask(REQ_NUM_BITS),
            magic: ((w1 >> MAGIC_SHIFT) & mask(PKT_HDR_MAGIC_BITS)) as u8,
        }
    }

    /// Decode and validate the header at the start of a received packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some(raw) = bytes.first_chunk::<PKT_HDR_SIZE>() else {
            return Err(Error::BufferTooSmall {
                required: PKT_HDR_SIZE,
                available: bytes.len(),
            });
        };
        let hdr = Self::decode(raw);
        hdr.validate()?;
        Ok(hdr)
    }

    /// Calculate the number of packets needed for a message of given size.
    ///
    /// A zero-byte message still occupies one packet.
    pub fn calc_num_pkts(msg_size: usize, max_data_per_pkt: usize) -> usize {
        debug_assert!(max_data_per_pkt > 0);
        if msg_size == 0 {
            1
        } else {
            msg_size.div_ceil(max_data_per_pkt)
        }
    }
}

#[inline]
const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkt_hdr_roundtrip_extremes() {
        let hdr = PacketHeader::new_req(42, MAX_MSG_SIZE, 0xFFFF, MAX_PKT_NUM, MAX_REQ_NUM);
        let decoded = PacketHeader::decode(&hdr.encode());

        assert_eq!(decoded, hdr);
        assert_eq!(decoded.msg_size(), MAX_MSG_SIZE);
        assert_eq!(decoded.pkt_num, MAX_PKT_NUM);
        assert_eq!(decoded.req_num, MAX_REQ_NUM);
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_wire_layout() {
        let hdr = PacketHeader::new_resp(0x7A, 0x123456, 0xBEEF, 0, 0x0ABC_DEF0_1234);
        let bytes = hdr.encode();

        assert_eq!(bytes[0], 0x7A);
        assert_eq!(&bytes[1..4], &[0x56, 0x34, 0x12]);
        assert_eq!(&bytes[4..6], &[0xEF, 0xBE]);
        // is_req = 0, is_first = 1, is_expected = 1, pkt_num = 0
        assert_eq!(bytes[6], 0b0000_0110);
        assert_eq!(bytes[7], 0);
        assert_eq!(&bytes[8..13], &[0x34, 0x12, 0xF0, 0xDE, 0xBC]);
        // top nibble of req_num is 0xA, magic 11 in the next nibble
        assert_eq!(bytes[13], 0xBA);
        assert_eq!(&bytes[14..], &[0, 0]);
    }

    #[test]
    fn test_pkt_kinds() {
        assert_eq!(PacketHeader::new_req(0, 10, 1, 0, 8).kind(), PktKind::Req);
        assert_eq!(PacketHeader::new_resp(0, 10, 1, 0, 8).kind(), PktKind::Resp);
        let cr = PacketHeader::new_expl_cr(0, 1, 3, 8);
        assert_eq!(cr.kind(), PktKind::ExplCr);
        assert_eq!(cr.msg_size(), 0);
        assert!(!cr.is_first);
    }

    #[test]
    fn test_is_first_only_on_pkt_0() {
        assert!(PacketHeader::new_req(0, 5000, 1, 0, 8).is_first);
        assert!(!PacketHeader::new_req(0, 5000, 1, 1, 8).is_first);
    }

    #[test]
    fn test_validate_rejects_bad_magic() {
        let mut bytes = PacketHeader::new_req(1, 32, 0, 0, 8).encode();
        bytes[13] &= 0x0F;

        let err = PacketHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::CorruptHeader { expected: 11, got: 0 }));
    }

    #[test]
    fn test_from_bytes_short() {
        let err = PacketHeader::from_bytes(&[0u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferTooSmall {
                required: PKT_HDR_SIZE,
                available: 7
            }
        ));
    }

    #[test]
    fn test_calc_num_pkts() {
        let mdpp = 1008;

        assert_eq!(PacketHeader::calc_num_pkts(0, mdpp), 1);
        assert_eq!(PacketHeader::calc_num_pkts(1, mdpp), 1);
        assert_eq!(PacketHeader::calc_num_pkts(mdpp, mdpp), 1);
        assert_eq!(PacketHeader::calc_num_pkts(mdpp + 1, mdpp), 2);
        assert_eq!(PacketHeader::calc_num_pkts(mdpp * 2, mdpp), 2);
        assert_eq!(PacketHeader::calc_num_pkts(mdpp * 2 + 1, mdpp), 3);
    }
}
