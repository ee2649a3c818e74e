use bytes::Bytes;

use crate::error::{RelayError, Result};

/// An inbound RTP packet with its fixed header decoded (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The relay forwards packets unchanged, so the original bytes are kept in
/// [`data`](Self::data). `Bytes` is reference counted: every reader of a
/// stream shares one allocation.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    data: Bytes,
}

const FIXED_HEADER_LEN: usize = 12;

impl RtpPacket {
    /// Decode the fixed header, rejecting anything that is not RTP version 2
    /// or is too short to hold its CSRC list.
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(RelayError::InvalidRtp("shorter than fixed header"));
        }
        if data[0] >> 6 != 2 {
            return Err(RelayError::InvalidRtp("version is not 2"));
        }
        let csrc_count = (data[0] & 0x0f) as usize;
        if data.len() < FIXED_HEADER_LEN + csrc_count * 4 {
            return Err(RelayError::InvalidRtp("truncated CSRC list"));
        }

        Ok(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data,
        })
    }

    /// The complete packet as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Build a minimal RTP packet. Used by tests across the crate.
#[cfg(test)]
pub(crate) fn test_packet(sequence: u16, payload: &[u8]) -> RtpPacket {
    let mut buf = vec![0x80, 96];
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&3000u32.to_be_bytes());
    buf.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
    buf.extend_from_slice(payload);
    RtpPacket::parse(Bytes::from(buf)).unwrap()
}
