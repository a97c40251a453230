use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Status codes reported by the ASH layer. The numeric values are the ones the NCP side of the
///  link uses for the same conditions, so they can be passed through to upper protocol layers
///  unchanged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AshStatus {
    Success = 0x00,
    InProgress = 0x20,
    HostFatalError = 0x21,
    NcpFatalError = 0x22,
    DataFrameTooLong = 0x23,
    DataFrameTooShort = 0x24,
    NoTxSpace = 0x25,
    NoRxSpace = 0x26,
    NoRxData = 0x27,
    NotConnected = 0x28,
    InvalidCall = 0x38,
    ErrorVersion = 0x50,
    ErrorTimeouts = 0x51,
    ErrorResetFail = 0x52,
    ErrorNcpReset = 0x53,
    ErrorSerialInit = 0x54,
    ErrorXonXoff = 0x57,
    Cancelled = 0x74,
    BadCrc = 0x76,
    CommError = 0x77,
    TooShort = 0x79,
    TooLong = 0x7A,
    BadControl = 0x7B,
    BadLength = 0x7C,
}

impl AshStatus {
    pub fn name(&self) -> &'static str {
        match self {
            AshStatus::Success => "SUCCESS",
            AshStatus::InProgress => "ASH_IN_PROGRESS",
            AshStatus::HostFatalError => "HOST_FATAL_ERROR",
            AshStatus::NcpFatalError => "ASH_NCP_FATAL_ERROR",
            AshStatus::DataFrameTooLong => "DATA_FRAME_TOO_LONG",
            AshStatus::DataFrameTooShort => "DATA_FRAME_TOO_SHORT",
            AshStatus::NoTxSpace => "NO_TX_SPACE",
            AshStatus::NoRxSpace => "NO_RX_SPACE",
            AshStatus::NoRxData => "NO_RX_DATA",
            AshStatus::NotConnected => "NOT_CONNECTED",
            AshStatus::InvalidCall => "ERROR_INVALID_CALL",
            AshStatus::ErrorVersion => "ASH_ERROR_VERSION",
            AshStatus::ErrorTimeouts => "ASH_ERROR_TIMEOUTS",
            AshStatus::ErrorResetFail => "ASH_ERROR_RESET_FAIL",
            AshStatus::ErrorNcpReset => "ASH_ERROR_NCP_RESET",
            AshStatus::ErrorSerialInit => "ERROR_SERIAL_INIT",
            AshStatus::ErrorXonXoff => "ASH_ERROR_XON_XOFF",
            AshStatus::Cancelled => "ASH_CANCELLED",
            AshStatus::BadCrc => "ASH_BAD_CRC",
            AshStatus::CommError => "ASH_COMM_ERROR",
            AshStatus::TooShort => "ASH_TOO_SHORT",
            AshStatus::TooLong => "ASH_TOO_LONG",
            AshStatus::BadControl => "ASH_BAD_CONTROL",
            AshStatus::BadLength => "ASH_BAD_LENGTH",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == AshStatus::Success
    }
}

impl Display for AshStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::error::Error for AshStatus {}


/// Reset reasons and error codes the NCP reports in RSTACK and ERROR frames
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NcpFailedCode {
    ResetUnknownReason = 0x00,
    ResetExternal = 0x01,
    ResetPowerOn = 0x02,
    ResetWatchdog = 0x03,
    ResetAssert = 0x06,
    ResetBootloader = 0x09,
    ResetSoftware = 0x0B,
    ErrorExceededMaximumAckTimeoutCount = 0x51,
    ChipSpecificReset = 0x80,
}

/// Human-readable representation of a reset reason / error code byte, including codes that are
///  not known to this implementation.
pub fn ncp_code_name(code: u8) -> String {
    match NcpFailedCode::try_from(code) {
        Ok(c) => format!("{:?}", c),
        Err(_) => format!("0x{:02X}", code),
    }
}
