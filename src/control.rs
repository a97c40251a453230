use std::fmt::{Display, Formatter};
use crate::consts::*;
use crate::frame_num::FrameNum;
use crate::status::AshStatus;

/// The six kinds of ASH frame, identified by the bit pattern of the control byte:
///
/// ```ascii
/// DATA    0 frmNum(3) rFlag ackNum(3)     + data field
/// ACK     1 0 0 pFlag nFlag ackNum(3)
/// NAK     1 0 1 pFlag nFlag ackNum(3)
/// RST     1 1 0 0 0 0 0 0
/// RSTACK  1 1 0 0 0 0 0 1                 + version, reset reason
/// ERROR   1 1 0 0 0 0 1 0                 + version, error code
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    Data,
    Ack,
    Nak,
    Rst,
    RstAck,
    Error,
}

impl Display for FrameType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameType::Data => "DATA",
            FrameType::Ack => "ACK",
            FrameType::Nak => "NAK",
            FrameType::Rst => "RST",
            FrameType::RstAck => "RSTACK",
            FrameType::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl FrameType {
    /// Determines the frame type from a control byte and validates it against the decoded
    ///  frame length (control byte plus data field, excluding CRC).
    ///
    /// Returns [AshStatus::BadControl] for control bytes that match no frame type, and
    ///  [AshStatus::BadLength] if the length does not fit the type.
    pub fn classify(control: u8, len: usize) -> Result<FrameType, AshStatus> {
        let (frame_type, len_ok) = if control == CONTROL_RSTACK {
            (FrameType::RstAck, len == FRAME_LEN_RSTACK)
        }
        else if control == CONTROL_ERROR {
            (FrameType::Error, len == FRAME_LEN_ERROR)
        }
        else if control == CONTROL_RST {
            (FrameType::Rst, len == FRAME_LEN_RST)
        }
        else if is_data_control(control) {
            (FrameType::Data, len >= FRAME_LEN_DATA_MIN)
        }
        else if control & SHFRAME_MASK == CONTROL_ACK {
            (FrameType::Ack, len == FRAME_LEN_ACK)
        }
        else if control & SHFRAME_MASK == CONTROL_NAK {
            (FrameType::Nak, len == FRAME_LEN_NAK)
        }
        else {
            return Err(AshStatus::BadControl);
        };

        if len_ok {
            Ok(frame_type)
        }
        else {
            Err(AshStatus::BadLength)
        }
    }

    /// ACK, NAK and DATA frames piggy-back the sender's acknowledgement number
    pub fn carries_ack_num(&self) -> bool {
        matches!(self, FrameType::Data | FrameType::Ack | FrameType::Nak)
    }
}

pub fn is_data_control(control: u8) -> bool {
    control & DFRAME_MASK == CONTROL_DATA
}

pub fn data_control(frm_num: FrameNum, ack_num: FrameNum, retransmission: bool) -> u8 {
    let mut control = CONTROL_DATA | (frm_num.to_raw() << FRMNUM_SHIFT) | ack_num.to_raw();
    if retransmission {
        control |= RFLAG_MASK;
    }
    control
}

pub fn ack_control(ack_num: FrameNum, not_ready: bool) -> u8 {
    short_control(CONTROL_ACK, ack_num, not_ready)
}

pub fn nak_control(ack_num: FrameNum, not_ready: bool) -> u8 {
    short_control(CONTROL_NAK, ack_num, not_ready)
}

fn short_control(base: u8, ack_num: FrameNum, not_ready: bool) -> u8 {
    let mut control = base | ack_num.to_raw();
    if not_ready {
        control |= NFLAG_MASK;
    }
    control
}

pub fn ack_num(control: u8) -> FrameNum {
    FrameNum::from_raw(control & ACKNUM_MASK)
}

pub fn frm_num(control: u8) -> FrameNum {
    FrameNum::from_raw((control & FRMNUM_MASK) >> FRMNUM_SHIFT)
}

/// rFlag of a DATA control byte
pub fn is_retransmission(control: u8) -> bool {
    control & RFLAG_MASK != 0
}

/// nFlag of an ACK / NAK control byte
pub fn is_not_ready(control: u8) -> bool {
    control & NFLAG_MASK != 0
}
