//! Feetech SCS frame codec.
//!
//! Frame layout: `[0xFF, 0xFF, ID, LEN, CODE, PARAMS.., CHECKSUM]` where
//! `LEN = PARAMS.len() + 2` and `CODE` is the instruction for requests or the
//! error-status byte for replies. The checksum is the bitwise complement of
//! the 8-bit sum of every byte after the header.

use crate::registers::Instruction;

pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Addresses every servo on the bus; never answered.
pub const BROADCAST_ID: u8 = 0xFE;

/// Highest addressable servo id.
pub const MAX_SERVO_ID: u8 = 253;

/// Header (2) + id + len + code + checksum.
pub const MIN_FRAME_LEN: usize = 6;

/// `LEN` is one byte and covers code + params + checksum.
pub const MAX_PARAMS: usize = u8::MAX as usize - 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub code: u8,
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("checksum mismatch: computed 0x{computed:02X}, frame carries 0x{received:02X}")]
    Checksum { computed: u8, received: u8 },

    #[error("malformed frame: {0}")]
    Framing(&'static str),
}

/// Result of looking for a frame at the start of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// More bytes are needed.
    Incomplete,
    /// The first `n` bytes cannot start a frame and should be dropped.
    Garbage(usize),
    /// The first `n` bytes form one complete frame (checksum not yet verified).
    Frame(usize),
}

pub fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn encode(id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>, CodecError> {
    encode_raw(id, instruction as u8, params)
}

/// Frames an arbitrary code byte. Replies use this with the status byte.
pub fn encode_raw(id: u8, code: u8, params: &[u8]) -> Result<Vec<u8>, CodecError> {
    if params.len() > MAX_PARAMS {
        return Err(CodecError::Framing("parameter block too long"));
    }
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + params.len());
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push((params.len() + 2) as u8);
    frame.push(code);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[2..]));
    Ok(frame)
}

/// Decodes exactly one frame; trailing bytes are rejected.
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Framing("frame shorter than header"));
    }
    if bytes[..2] != HEADER {
        return Err(CodecError::Framing("missing header"));
    }
    let length = bytes[3] as usize;
    if length < 2 {
        return Err(CodecError::Framing("length field below minimum"));
    }
    let total = length + 4;
    if bytes.len() < total {
        return Err(CodecError::Framing("truncated frame"));
    }
    if bytes.len() > total {
        return Err(CodecError::Framing("trailing bytes after frame"));
    }

    let computed = checksum(&bytes[2..total - 1]);
    let received = bytes[total - 1];
    if computed != received {
        return Err(CodecError::Checksum { computed, received });
    }

    Ok(Packet {
        id: bytes[2],
        code: bytes[4],
        params: bytes[5..total - 1].to_vec(),
    })
}

/// Finds the extent of the next frame in a byte stream.
pub fn scan(buf: &[u8]) -> Scan {
    let start = buf.windows(2).position(|w| w == HEADER);
    let Some(start) = start else {
        // a lone trailing 0xFF may be the first half of a header
        return match buf {
            [] => Scan::Incomplete,
            [.., 0xFF] if buf.len() == 1 => Scan::Incomplete,
            [.., 0xFF] => Scan::Garbage(buf.len() - 1),
            _ => Scan::Garbage(buf.len()),
        };
    };
    if start > 0 {
        return Scan::Garbage(start);
    }
    if buf.len() < 4 {
        return Scan::Incomplete;
    }
    let length = buf[3] as usize;
    if length < 2 {
        return Scan::Garbage(1);
    }
    let total = length + 4;
    if buf.len() < total {
        Scan::Incomplete
    } else {
        Scan::Frame(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_datasheet_example() {
        // ID=1, LEN=4, WRITE, addr 30, data 0x0200 -> ~40
        assert_eq!(checksum(&[1, 4, 0x03, 30, 0, 2]), 215);
    }

    #[test]
    fn ping_frame_layout() {
        let frame = encode(1, Instruction::Ping, &[]).unwrap();
        assert_eq!(frame, vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn decode_reproduces_encoded_instruction() {
        let frame = encode(7, Instruction::Write, &[42, 0xB8, 0x0B]).unwrap();
        let packet = decode(&frame).unwrap();
        assert_eq!(
            packet,
            Packet { id: 7, code: Instruction::Write as u8, params: vec![42, 0xB8, 0x0B] }
        );
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        let mut frame = encode(3, Instruction::Read, &[56, 2]).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x5A;
        assert!(matches!(decode(&frame), Err(CodecError::Checksum { .. })));
    }

    #[test]
    fn decode_rejects_missing_header_and_truncation() {
        let frame = encode(3, Instruction::Read, &[56, 2]).unwrap();
        assert_eq!(decode(&frame[1..]), Err(CodecError::Framing("missing header")));
        assert_eq!(decode(&frame[..frame.len() - 1]), Err(CodecError::Framing("truncated frame")));
        assert_eq!(decode(&frame[..3]), Err(CodecError::Framing("frame shorter than header")));

        let mut long = frame.clone();
        long.push(0);
        assert_eq!(decode(&long), Err(CodecError::Framing("trailing bytes after frame")));
    }

    #[test]
    fn encode_rejects_oversized_params() {
        let params = vec![0u8; MAX_PARAMS + 1];
        assert!(encode(1, Instruction::Write, &params).is_err());
        assert!(encode(1, Instruction::Write, &params[..MAX_PARAMS]).is_ok());
    }

    #[test]
    fn scan_skips_noise_and_waits_for_tail() {
        let frame = encode(1, Instruction::Ping, &[]).unwrap();

        let mut noisy = vec![0x00, 0x13];
        noisy.extend_from_slice(&frame);
        assert_eq!(scan(&noisy), Scan::Garbage(2));
        assert_eq!(scan(&noisy[2..]), Scan::Frame(frame.len()));

        assert_eq!(scan(&frame[..4]), Scan::Incomplete);
        assert_eq!(scan(&[0xFF]), Scan::Incomplete);
        assert_eq!(scan(&[0x01, 0xFF]), Scan::Garbage(1));
        assert_eq!(scan(&[0x01, 0x02]), Scan::Garbage(2));
        assert_eq!(scan(&[0xFF, 0xFF, 0x01, 0x01]), Scan::Garbage(1));
    }
}
