//! ASH ("asynchronous serial host") is the link layer between a host and a Zigbee network
//!  co-processor (NCP) over a UART or a serial-over-TCP bridge. It turns an unreliable byte stream
//!  into a reliable, ordered stream of DATA payloads.
//!
//! Frames on the wire:
//!
//! ```ascii
//! +---------+--------------------+--------+------+
//! | control | data (DATA: 3-220) | CRC16  | 0x7E |
//! +---------+--------------------+--------+------+
//!   \______ byte stuffed ______________/
//! ```
//!
//! DATA payloads are XORed with a pseudo-random sequence before framing so that their content
//!  does not correlate with the reserved byte values. Reliability comes from a go-back-N sliding
//!  window of three DATA frames with 3-bit sequence numbers, piggy-backed acknowledgements, NAKs
//!  for damaged frames, an adaptive retransmission timeout and not-ready flow control.
//!
//! The protocol itself lives in [engine::AshEngine], a synchronous state machine without I/O.
//!  [uart::UartAsh] drives it over a port.

pub mod buffers;
pub mod codec;
pub mod config;
pub mod consts;
pub mod control;
pub mod counters;
pub mod deframer;
pub mod engine;
pub mod frame_num;
pub mod port;
pub mod status;
pub mod uart;
pub mod writer;
