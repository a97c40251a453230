//! Fixed protocol parameters. None of these are meant to be tuned per deployment: both sides of
//!  the link rely on them.

use std::time::Duration;

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const CANCEL: u8 = 0x1A;
pub const SUBSTITUTE: u8 = 0x18;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;

/// Sent by the NCP between frames to signal a pending callback when it is allowed to sleep
pub const WAKE: u8 = 0xFF;

/// XOR mask applied to the byte following an [ESCAPE]
pub const ESCAPE_FLIP: u8 = 0x20;

pub const ASH_VERSION: u8 = 2;

pub const DFRAME_MASK: u8 = 0x80;
pub const SHFRAME_MASK: u8 = 0xE0;
pub const ACKNUM_MASK: u8 = 0x07;
pub const RFLAG_MASK: u8 = 0x08;
pub const NFLAG_MASK: u8 = 0x08;
pub const PFLAG_MASK: u8 = 0x10;
pub const FRMNUM_MASK: u8 = 0x70;
pub const FRMNUM_SHIFT: u8 = 4;

pub const CONTROL_DATA: u8 = 0x00;
pub const CONTROL_ACK: u8 = 0x80;
pub const CONTROL_NAK: u8 = 0xA0;
pub const CONTROL_RST: u8 = 0xC0;
pub const CONTROL_RSTACK: u8 = 0xC1;
pub const CONTROL_ERROR: u8 = 0xC2;

pub const CRC_LEN: usize = 2;

pub const MIN_DATA_FIELD_LEN: usize = 3;
pub const MAX_DATA_FIELD_LEN: usize = 220;

/// control byte plus the data field
pub const MAX_FRAME_LEN: usize = MAX_DATA_FIELD_LEN + 1;
pub const MIN_FRAME_LEN: usize = 1;
pub const MIN_FRAME_WITH_CRC_LEN: usize = MIN_FRAME_LEN + CRC_LEN;
pub const MAX_FRAME_WITH_CRC_LEN: usize = MAX_FRAME_LEN + CRC_LEN;
/// a maximum size frame with every byte escaped, without the terminating FLAG
pub const MAX_STUFFED_FRAME_LEN: usize = 2 * MAX_FRAME_WITH_CRC_LEN;

pub const FRAME_LEN_DATA_MIN: usize = MIN_DATA_FIELD_LEN + 1;
pub const FRAME_LEN_ACK: usize = 1;
pub const FRAME_LEN_NAK: usize = 1;
pub const FRAME_LEN_RST: usize = 1;
pub const FRAME_LEN_RSTACK: usize = 3;
pub const FRAME_LEN_ERROR: usize = 3;

/// Sliding window size, i.e. the maximum number of unacknowledged DATA frames
pub const TX_K: u8 = 3;

/// Consecutive ACK timeouts after which the link is declared dead
pub const MAX_TIMEOUTS: u8 = 6;

pub const ACK_TIME_INIT: Duration = Duration::from_millis(800);
pub const ACK_TIME_MIN: Duration = Duration::from_millis(400);
pub const ACK_TIME_MAX: Duration = Duration::from_millis(2400);

/// time to wait for the NCP's RSTACK after sending RST
pub const TIME_RST: Duration = Duration::from_millis(2500);
pub const TIME_RST_CHECK: Duration = Duration::from_millis(100);

/// Free receive buffers below this set the 'not ready' condition ...
pub const NR_LOW_LIMIT: usize = 8;
/// ... and above this clear it again
pub const NR_HIGH_LIMIT: usize = 12;
/// refresh interval for a 'not ready' nFlag that was already sent
pub const NR_TIME: Duration = Duration::from_millis(480);

pub const RX_POOL_SIZE: usize = 32;
pub const TX_POOL_SIZE: usize = RX_POOL_SIZE + 5;

/// Bytes the engine buffers for the transport before it stops encoding
pub const WRITER_HIGH_WATER_MARK: usize = 256;

pub const LFSR_SEED: u8 = 0x42;
pub const LFSR_POLY: u8 = 0xB8;

pub const VALID_BAUD_RATES: [u32; 11] = [600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800];
pub const DEFAULT_BAUD_RATE: u32 = 115200;
