//! Byte-level frame codec: CRC, byte stuffing and payload randomization.
//!
//! On the wire, a frame is the control byte, the data field and a CRC16 (high byte first), with
//!  every reserved byte value replaced by [ESCAPE] followed by the value XOR [ESCAPE_FLIP], and
//!  terminated by an unescaped [FLAG]. The CRC is CRC-16/CCITT with initial value 0xFFFF and no
//!  bit reflection, computed over the unstuffed control byte and data field.

use bytes::BufMut;
use crc::{Crc, Digest, CRC_16_IBM_3740};
use crate::consts::*;
use crate::status::AshStatus;

pub static ASH_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16(data: &[u8]) -> u16 {
    ASH_CRC.checksum(data)
}

pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, FLAG | ESCAPE | CANCEL | SUBSTITUTE | XON | XOFF)
}

/// Appends a single byte, escaping it if it is a reserved value
pub fn stuff_byte(byte: u8, out: &mut impl BufMut) {
    if is_reserved(byte) {
        out.put_u8(ESCAPE);
        out.put_u8(byte ^ ESCAPE_FLIP);
    }
    else {
        out.put_u8(byte);
    }
}

/// XORs the buffer with the LFSR pseudo-random sequence starting at its seed. Applying it twice
///  restores the original data.
pub fn randomize(buf: &mut [u8]) {
    randomize_from(LFSR_SEED, buf);
}

/// Continues the LFSR sequence from a given state, returning the state after the last byte so
///  that data split into several chunks can be processed piece by piece.
pub fn randomize_from(seed: u8, buf: &mut [u8]) -> u8 {
    let mut seed = seed;
    for b in buf.iter_mut() {
        *b ^= seed;
        seed = if seed & 1 != 0 {
            (seed >> 1) ^ LFSR_POLY
        }
        else {
            seed >> 1
        };
    }
    seed
}

/// Encodes a complete frame in one go
pub fn encode_frame(control: u8, data: &[u8], out: &mut impl BufMut) {
    let mut encoder = FrameEncoder::new();
    encoder.start();
    while let Some(b) = encoder.next_output(control, data) {
        out.put_u8(b);
    }
}

/// Decodes a single raw frame (including its terminating FLAG), returning control byte and data
///  field.
pub fn decode_frame(raw: &[u8], xon_xoff_is_error: bool) -> Result<Vec<u8>, AshStatus> {
    let mut decoder = FrameDecoder::new(xon_xoff_is_error);
    let mut result = Vec::new();
    for &b in raw {
        match decoder.decode_byte(b)? {
            Decoded::Nothing => {}
            Decoded::Byte(out) => result.push(out),
            Decoded::EndOfFrame => return Ok(result),
        }
    }
    Err(AshStatus::InProgress)
}


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum EncodeState {
    Body,
    CrcHigh,
    CrcLow,
    Flag,
    Done,
}

/// Incremental frame encoder, producing the wire representation one byte at a time. This allows
///  the sender to stop when the transport is saturated and pick up in the middle of a frame later.
pub struct FrameEncoder {
    state: EncodeState,
    /// index of the next input byte: 0 is the control byte, n is data[n-1]
    offset: usize,
    digest: Digest<'static, u16>,
    crc: u16,
    escaped: Option<u8>,
}

impl FrameEncoder {
    pub fn new() -> FrameEncoder {
        FrameEncoder {
            state: EncodeState::Done,
            offset: 0,
            digest: ASH_CRC.digest(),
            crc: 0,
            escaped: None,
        }
    }

    pub fn start(&mut self) {
        self.state = EncodeState::Body;
        self.offset = 0;
        self.digest = ASH_CRC.digest();
        self.crc = 0;
        self.escaped = None;
    }

    /// true between [FrameEncoder::start] and the byte after the terminating flag
    pub fn is_active(&self) -> bool {
        self.state != EncodeState::Done
    }

    /// Returns the next wire byte of the frame, or `None` once the terminating FLAG was returned.
    ///  `control` and `data` must be the same for all calls belonging to a frame.
    pub fn next_output(&mut self, control: u8, data: &[u8]) -> Option<u8> {
        if let Some(b) = self.escaped.take() {
            return Some(b);
        }

        match self.state {
            EncodeState::Body => {
                let byte = if self.offset == 0 { control } else { data[self.offset - 1] };
                self.digest.update(&[byte]);
                self.offset += 1;

                if self.offset > data.len() {
                    self.crc = std::mem::replace(&mut self.digest, ASH_CRC.digest()).finalize();
                    self.state = EncodeState::CrcHigh;
                }
                Some(self.stuff(byte))
            }
            EncodeState::CrcHigh => {
                self.state = EncodeState::CrcLow;
                Some(self.stuff((self.crc >> 8) as u8))
            }
            EncodeState::CrcLow => {
                self.state = EncodeState::Flag;
                Some(self.stuff(self.crc as u8))
            }
            EncodeState::Flag => {
                self.state = EncodeState::Done;
                Some(FLAG)
            }
            EncodeState::Done => None,
        }
    }

    fn stuff(&mut self, byte: u8) -> u8 {
        if is_reserved(byte) {
            self.escaped = Some(byte ^ ESCAPE_FLIP);
            ESCAPE
        }
        else {
            byte
        }
    }
}


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decoded {
    /// the input byte did not produce output (escape, leading flag, ...)
    Nothing,
    /// a decoded control or data byte
    Byte(u8),
    /// a terminating flag after a frame with valid CRC and length
    EndOfFrame,
}

/// Incremental frame decoder, the inverse of [FrameEncoder].
///
/// The last two bytes before a flag are the CRC, so output is delayed by two bytes and CRC bytes
///  are never returned. Decoding errors terminate the frame; the decoder starts over with the
///  next byte.
pub struct FrameDecoder {
    in_progress: bool,
    /// number of unstuffed bytes seen, capped at one more than the maximum
    len: usize,
    substituted: bool,
    flip: u8,
    byte1: u8,
    byte2: u8,
    digest: Digest<'static, u16>,
    xon_xoff_is_error: bool,
}

impl FrameDecoder {
    /// `xon_xoff_is_error` is for a serial port that should strip XON / XOFF itself: if they
    ///  reach the decoder anyway, the port is misconfigured.
    pub fn new(xon_xoff_is_error: bool) -> FrameDecoder {
        FrameDecoder {
            in_progress: false,
            len: 0,
            substituted: false,
            flip: 0,
            byte1: 0,
            byte2: 0,
            digest: ASH_CRC.digest(),
            xon_xoff_is_error,
        }
    }

    pub fn reset(&mut self) {
        self.in_progress = false;
        self.len = 0;
        self.substituted = false;
        self.flip = 0;
        self.byte1 = 0;
        self.byte2 = 0;
        self.digest = ASH_CRC.digest();
    }

    /// true if part of a frame was received
    pub fn is_in_progress(&self) -> bool {
        self.in_progress && (self.len > 0 || self.substituted || self.flip != 0)
    }

    pub fn decode_byte(&mut self, byte: u8) -> Result<Decoded, AshStatus> {
        if !self.in_progress {
            self.reset();
        }

        let result = self.do_decode_byte(byte);
        self.in_progress = matches!(result, Ok(Decoded::Nothing) | Ok(Decoded::Byte(_)));
        result
    }

    fn do_decode_byte(&mut self, byte: u8) -> Result<Decoded, AshStatus> {
        match byte {
            FLAG => {
                if self.substituted {
                    return Err(AshStatus::CommError);
                }
                if self.len == 0 {
                    // flag without preceding data is a leading flag rather than a terminating one
                    self.flip = 0;
                    return Ok(Decoded::Nothing);
                }

                let crc = std::mem::replace(&mut self.digest, ASH_CRC.digest()).finalize();
                if crc != ((self.byte2 as u16) << 8) + self.byte1 as u16 {
                    Err(AshStatus::BadCrc)
                }
                else if self.len < MIN_FRAME_WITH_CRC_LEN {
                    Err(AshStatus::TooShort)
                }
                else if self.len > MAX_FRAME_WITH_CRC_LEN {
                    Err(AshStatus::TooLong)
                }
                else {
                    Ok(Decoded::EndOfFrame)
                }
            }
            ESCAPE => {
                self.flip = ESCAPE_FLIP;
                Ok(Decoded::Nothing)
            }
            CANCEL => Err(AshStatus::Cancelled),
            SUBSTITUTE => {
                // the rest of the frame is discarded, reported when the flag arrives
                self.substituted = true;
                Ok(Decoded::Nothing)
            }
            XON | XOFF => {
                if self.xon_xoff_is_error {
                    Err(AshStatus::ErrorXonXoff)
                }
                else {
                    Ok(Decoded::Nothing)
                }
            }
            _ => {
                let byte = byte ^ self.flip;
                self.flip = 0;

                if self.substituted {
                    return Ok(Decoded::Nothing);
                }

                if self.len <= MAX_FRAME_WITH_CRC_LEN {
                    self.len += 1;
                }

                let mut result = Decoded::Nothing;
                if self.len > CRC_LEN {
                    // CRC is calculated even for frames that are too long
                    self.digest.update(&[self.byte2]);
                    if self.len <= MAX_FRAME_WITH_CRC_LEN {
                        result = Decoded::Byte(self.byte2);
                    }
                }

                self.byte2 = self.byte1;
                self.byte1 = byte;
                Ok(result)
            }
        }
    }
}
