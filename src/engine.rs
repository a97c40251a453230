//! The ASH protocol engine: sliding-window ARQ on top of the frame codec.
//!
//! The engine is a plain state machine without any I/O of its own. Raw bytes from the transport
//!  go in through [AshEngine::receive], bytes for the transport are collected in an internal
//!  writer and handed out by [AshEngine::take_output]. Timers are timestamps that are checked
//!  whenever [AshEngine::send_exec] runs, so the owner must call it periodically.
//!
//! Sequence number bookkeeping (all mod 8):
//!
//! ```ascii
//! frm_tx      number of the next new DATA frame to send
//! frm_re_tx   number of the next DATA frame to retransmit
//! ack_rx      last ack number received, i.e. the oldest unacknowledged DATA frame
//! frm_rx      number of the next DATA frame expected from the peer
//! ack_tx      last ack number sent
//! ```
//!
//! The retransmission queue holds the frames from `ack_rx` (or older while retransmitting) up to
//!  `frm_tx`, and new DATA frames are only sent while `frm_tx` is inside the window
//!  `ack_rx ..= ack_rx + TX_K - 1`.

use std::collections::VecDeque;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use crate::buffers::{BufferPool, BufferQueue};
use crate::codec::{randomize, Decoded, FrameDecoder, FrameEncoder};
use crate::consts::*;
use crate::control::{ack_control, data_control, is_data_control, is_not_ready, is_retransmission, nak_control, FrameType};
use crate::control;
use crate::counters::AshCounters;
use crate::deframer::{Deframer, RawFrame};
use crate::frame_num::FrameNum;
use crate::status::{ncp_code_name, AshStatus, NcpFailedCode};
use crate::writer::AshWriter;

/// Notifications from the engine to its owner
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AshEvent {
    /// A DATA frame was received and is available through [AshEngine::take_frame]
    FrameReceived,
    /// The link failed and requires a reset. This is raised once per failure, with the cause.
    FatalError(AshStatus),
}

/// Pending actions and session state. These are set by both the send and the receive path.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
struct SessionFlags {
    /// reject condition: a NAK was sent for a DATA frame, and no valid DATA frame arrived since
    rej: bool,
    /// retransmitting unacknowledged DATA frames
    retx: bool,
    /// send a NAK
    nak: bool,
    /// send an ACK
    ack: bool,
    /// send RST
    rst: bool,
    /// send a CANCEL byte as soon as possible
    can: bool,
    connected: bool,
    /// host is not ready to receive DATA frames
    nr: bool,
    /// the peer was told that the host is not ready
    nrtx: bool,
}

impl SessionFlags {
    fn connected_only() -> SessionFlags {
        SessionFlags {
            connected: true,
            ..SessionFlags::default()
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SendState {
    Idle,
    SendingShortFrame,
    SendingData,
    /// retransmitting the n-th newest entry of the retransmission queue
    ResendingData { n_from_back: usize },
}

pub struct AshEngine {
    flags: SessionFlags,
    send_state: SendState,

    frm_tx: FrameNum,
    frm_re_tx: FrameNum,
    /// frame number of the retransmission queue's head
    frm_re_tx_head: FrameNum,
    ack_rx: FrameNum,
    frm_rx: FrameNum,
    ack_tx: FrameNum,

    /// consecutive ACK timeouts
    timeouts: u8,
    /// start of the ACK timer, `None` if it is stopped
    ack_timer: Option<Instant>,
    ack_period: Duration,
    /// expiry of the not-ready refresh timer, `None` if it is stopped
    nr_timer: Option<Instant>,

    host_error: Option<AshStatus>,
    ncp_error: Option<AshStatus>,

    encoder: FrameEncoder,
    /// control byte of the frame being sent
    tx_control: u8,
    decoder: FrameDecoder,
    deframer: Deframer,
    writer: AshWriter,
    /// control byte and data field of the frame being received
    rx_frame: Vec<u8>,

    tx_pool: BufferPool,
    tx_queue: BufferQueue,
    re_tx_queue: BufferQueue,
    rx_pool: BufferPool,
    rx_queue: BufferQueue,

    counters: AshCounters,
    events: VecDeque<AshEvent>,
}

impl AshEngine {
    /// `xon_xoff_is_error` should be set for serial ports without hardware flow control, where
    ///  the driver is responsible for removing XON / XOFF from the byte stream.
    pub fn new(xon_xoff_is_error: bool) -> AshEngine {
        AshEngine {
            flags: SessionFlags::default(),
            send_state: SendState::Idle,
            frm_tx: FrameNum::ZERO,
            frm_re_tx: FrameNum::ZERO,
            frm_re_tx_head: FrameNum::ZERO,
            ack_rx: FrameNum::ZERO,
            frm_rx: FrameNum::ZERO,
            ack_tx: FrameNum::ZERO,
            timeouts: 0,
            ack_timer: None,
            ack_period: ACK_TIME_INIT,
            nr_timer: None,
            host_error: None,
            ncp_error: None,
            encoder: FrameEncoder::new(),
            tx_control: 0,
            decoder: FrameDecoder::new(xon_xoff_is_error),
            deframer: Deframer::new(),
            writer: AshWriter::new(WRITER_HIGH_WATER_MARK),
            rx_frame: Vec::with_capacity(MAX_FRAME_LEN),
            tx_pool: BufferPool::new("tx", TX_POOL_SIZE, MAX_DATA_FIELD_LEN),
            tx_queue: BufferQueue::with_capacity(TX_POOL_SIZE),
            re_tx_queue: BufferQueue::with_capacity(TX_POOL_SIZE),
            rx_pool: BufferPool::new("rx", RX_POOL_SIZE, MAX_DATA_FIELD_LEN),
            rx_queue: BufferQueue::with_capacity(RX_POOL_SIZE),
            counters: AshCounters::default(),
            events: VecDeque::with_capacity(RX_POOL_SIZE + 1),
        }
    }

    /// The maximum time the upper layer should wait for a response from the NCP
    pub fn response_timeout() -> Duration {
        ACK_TIME_MAX * MAX_TIMEOUTS as u32
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected
    }

    /// true if the engine has nothing to do: connected, nothing to send or deliver, nothing
    ///  unacknowledged in either direction, and no partial frame received
    pub fn is_idle(&self) -> bool {
        !self.decoder.is_in_progress()
            && self.rx_queue.is_empty()
            && self.flags == SessionFlags::connected_only()
            && self.ack_tx == self.frm_rx
            && self.ack_rx == self.frm_tx
            && self.send_state == SendState::Idle
            && self.tx_queue.is_empty()
    }

    /// the latched fatal status, if any
    pub fn fatal_status(&self) -> Option<AshStatus> {
        if self.host_error.is_some() {
            Some(AshStatus::HostFatalError)
        }
        else if self.ncp_error.is_some() {
            Some(AshStatus::NcpFatalError)
        }
        else {
            None
        }
    }

    pub fn ack_period(&self) -> Duration {
        self.ack_period
    }

    pub fn counters(&self) -> &AshCounters {
        &self.counters
    }

    pub fn read_and_clear_counters(&mut self) -> AshCounters {
        self.counters.read_and_clear()
    }

    pub fn next_event(&mut self) -> Option<AshEvent> {
        self.events.pop_front()
    }

    /// number of received DATA frames waiting for [AshEngine::take_frame]
    pub fn pending_frames(&self) -> usize {
        self.rx_queue.len()
    }

    /// Removes the oldest received DATA payload from the receive queue, freeing its buffer
    pub fn take_frame(&mut self) -> Option<Bytes> {
        let id = self.rx_queue.pop_front()?;
        let result = Bytes::copy_from_slice(self.rx_pool.data(&id));
        self.rx_pool.free(id);
        Some(result)
    }

    /// Bytes to be written to the transport
    pub fn take_output(&mut self) -> Bytes {
        self.writer.take()
    }

    /// Discards all session state and arms sending RST (preceded by CANCEL to terminate any
    ///  garbage the NCP may have received). This also clears a latched fatal error.
    pub fn reset(&mut self) {
        debug!("resetting ASH session state");
        self.clear_session();
        self.flags.rst = true;
        self.flags.can = true;
    }

    /// Tears down the session: logs the counters, returns all buffers to their pools and clears
    ///  flags and timers. Calling it repeatedly is harmless.
    pub fn stop(&mut self) {
        self.counters.log();

        let host_error = self.host_error;
        let ncp_error = self.ncp_error;
        self.clear_session();
        // a fatal error stays latched until the next reset
        self.host_error = host_error;
        self.ncp_error = ncp_error;
    }

    /// Latches a fatal error detected outside the engine, e.g. a failure of the transport
    pub fn fail(&mut self, cause: AshStatus) -> AshStatus {
        self.host_disconnect(cause)
    }

    fn clear_session(&mut self) {
        self.flags = SessionFlags::default();
        self.send_state = SendState::Idle;
        self.frm_tx = FrameNum::ZERO;
        self.frm_re_tx = FrameNum::ZERO;
        self.frm_re_tx_head = FrameNum::ZERO;
        self.ack_rx = FrameNum::ZERO;
        self.frm_rx = FrameNum::ZERO;
        self.ack_tx = FrameNum::ZERO;
        self.timeouts = 0;
        self.ack_timer = None;
        self.ack_period = ACK_TIME_INIT;
        self.nr_timer = None;
        self.host_error = None;
        self.ncp_error = None;
        self.encoder = FrameEncoder::new();
        self.decoder.reset();
        self.deframer.clear();
        self.writer.clear();
        self.rx_frame.clear();
        self.tx_queue.drain_into(&mut self.tx_pool);
        self.re_tx_queue.drain_into(&mut self.tx_pool);
        self.rx_queue.drain_into(&mut self.rx_pool);
        self.events.clear();
    }

    /// Queues a DATA payload for sending and immediately tries to send it.
    pub fn send(&mut self, payload: &[u8]) -> AshStatus {
        if let Some(status) = self.fatal_status() {
            return status;
        }

        if payload.len() < MIN_DATA_FIELD_LEN {
            return AshStatus::DataFrameTooShort;
        }
        if payload.len() > MAX_DATA_FIELD_LEN {
            return AshStatus::DataFrameTooLong;
        }
        if !self.flags.connected {
            return AshStatus::NotConnected;
        }

        let Some(id) = self.tx_pool.allocate() else {
            return AshStatus::NoTxSpace;
        };

        let buf = self.tx_pool.get_mut(&id);
        buf.fill(payload);
        randomize(buf.as_mut());
        self.tx_queue.push_back(id);

        self.send_exec();
        AshStatus::Success
    }

    /// Runs the send side: checks the ACK timer, then encodes as many bytes as the output buffer
    ///  takes. Pending actions are served in this order: CANCEL, RST, NAK, ACK, retransmission,
    ///  new DATA frame.
    pub fn send_exec(&mut self) {
        if self.fatal_status().is_some() {
            return;
        }

        if self.ack_timer_has_expired() && self.flags.connected {
            let expected = if self.flags.retx { self.frm_re_tx } else { self.frm_tx };

            if self.ack_rx != expected {
                self.counters.rx_ack_timeouts += 1;
                self.adjust_ack_period(true);
                debug!("timer expired waiting for ACK for {}={}, ackRx={}", if self.flags.retx { "frmReTx" } else { "frmTx" }, expected, self.ack_rx);

                self.timeouts += 1;
                if self.timeouts >= MAX_TIMEOUTS {
                    self.host_disconnect(AshStatus::ErrorTimeouts);
                    return;
                }

                self.start_retransmission();
            }
            else {
                self.stop_ack_timer();
            }
        }

        while self.writer.write_available() {
            if self.flags.can {
                match self.send_state {
                    SendState::Idle => {
                        self.writer.write_byte(CANCEL);
                    }
                    SendState::SendingData => {
                        debug!("cancelling DATA frame in progress");
                        self.counters.tx_cancelled += 1;
                        self.writer.write_byte(CANCEL);
                        self.stop_ack_timer();
                        self.send_state = SendState::Idle;
                    }
                    _ => {}
                }
                self.flags.can = false;
                continue;
            }

            match self.send_state {
                SendState::Idle => {
                    if !self.start_next_frame() {
                        return;
                    }
                }
                _ => self.continue_frame(),
            }
        }
    }

    /// In between frames: housekeeping, and then decide which frame to send next. Returns false
    ///  if there is nothing to send.
    fn start_next_frame(&mut self) -> bool {
        if self.flags.retx {
            if self.ack_rx.within_range(self.frm_re_tx, self.frm_tx) {
                self.frm_re_tx = self.ack_rx;
            }
            if self.frm_re_tx == self.frm_tx {
                self.flags.retx = false;
                self.scrub_re_tx_queue();
            }
        }

        self.data_frame_flow_control();

        if self.flags.rst {
            self.tx_control = CONTROL_RST;
            self.set_and_start_ack_timer(TIME_RST);
            self.flags.rst = false;
            self.flags.nak = false;
            self.flags.ack = false;
            self.send_state = SendState::SendingShortFrame;
            debug!("---> [FRAME type=RST]");
        }
        else if self.flags.nak || self.flags.ack {
            if self.flags.nak {
                self.tx_control = nak_control(self.frm_rx, self.flags.nr);
                debug!("---> [FRAME type=NAK frmRx={}](ackRx={})", self.frm_rx, self.ack_rx);
            }
            else {
                self.tx_control = ack_control(self.frm_rx, self.flags.nr);
                trace!("---> [FRAME type=ACK frmRx={}](ackRx={})", self.frm_rx, self.ack_rx);
            }
            self.flags.nak = false;
            self.flags.ack = false;
            self.flags.nrtx = false;

            if self.flags.nr {
                self.flags.nrtx = true;
                self.start_nr_timer();
            }

            self.ack_tx = self.frm_rx;
            self.send_state = SendState::SendingShortFrame;
        }
        else if self.flags.retx {
            let n_from_back = self.frm_tx.distance_from(self.frm_re_tx) as usize;
            self.tx_control = data_control(self.frm_re_tx, self.frm_rx, true);
            self.send_state = SendState::ResendingData { n_from_back };
            debug!("---> [FRAME type=DATA_RETX frmReTx={} frmRx={}](ackRx={} frmTx={})", self.frm_re_tx, self.frm_rx, self.ack_rx, self.frm_tx);
        }
        else if self.ack_tx != self.frm_rx {
            self.flags.ack = true;
            return true;
        }
        else if !self.tx_queue.is_empty() && self.frm_tx.within_range(self.ack_rx, self.ack_rx.plus(TX_K - 1)) {
            if let Some(id) = self.tx_queue.front() {
                self.counters.tx_data += self.tx_pool.get(id).len() as u32;
            }
            self.tx_control = data_control(self.frm_tx, self.frm_rx, false);
            self.send_state = SendState::SendingData;
            trace!("---> [FRAME type=DATA frmTx={} frmRx={}](ackRx={})", self.frm_tx, self.frm_rx, self.ack_rx);
        }
        else {
            return false;
        }

        self.count_frame(true, self.tx_control);
        self.encoder.start();
        self.continue_frame();
        true
    }

    fn continue_frame(&mut self) {
        let data: &[u8] = match self.send_state {
            SendState::SendingData => self.tx_queue.front()
                .map(|id| self.tx_pool.data(id))
                .unwrap_or(&[]),
            SendState::ResendingData { n_from_back } => self.re_tx_queue.nth_from_back(n_from_back)
                .map(|id| self.tx_pool.data(id))
                .unwrap_or(&[]),
            _ => &[],
        };

        if let Some(b) = self.encoder.next_output(self.tx_control, data) {
            self.writer.write_byte(b);
        }
        if !self.encoder.is_active() {
            self.finish_frame();
        }
    }

    fn finish_frame(&mut self) {
        match self.send_state {
            SendState::SendingData => {
                self.frm_tx = self.frm_tx.next();
                if let Some(id) = self.tx_queue.pop_front() {
                    self.re_tx_queue.push_back(id);
                }
            }
            SendState::ResendingData { .. } => {
                self.frm_re_tx = self.frm_re_tx.next();
            }
            SendState::SendingShortFrame | SendState::Idle => {
                self.send_state = SendState::Idle;
                return;
            }
        }

        if self.ack_timer.is_none() {
            self.start_ack_timer();
        }
        self.ack_tx = self.frm_rx;
        self.send_state = SendState::Idle;
    }

    /// Processes a chunk of bytes received from the transport
    pub fn receive(&mut self, chunk: &[u8]) {
        self.deframer.push(chunk);
        while let Some(raw) = self.deframer.next_frame() {
            self.on_raw_frame(raw);
        }
    }

    fn on_raw_frame(&mut self, raw: RawFrame) {
        if raw.cancelled && self.flags.connected {
            self.counters.rx_cancelled += 1;
            warn!("frame(s) in progress cancelled by NCP");
        }

        if raw.data.is_empty() {
            return;
        }

        let status = self.receive_frame(&raw.data);
        self.send_exec();

        match status {
            AshStatus::Success | AshStatus::InProgress | AshStatus::NoRxData | AshStatus::NoRxSpace => {}
            _ => debug!("frame processing ended with status {}", status),
        }
    }

    /// Decodes one raw frame and handles it according to its type and the session state
    fn receive_frame(&mut self, raw: &[u8]) -> AshStatus {
        if let Some(status) = self.fatal_status() {
            return status;
        }

        match self.read_frame(raw) {
            Ok(()) => {}
            Err(AshStatus::InProgress) => return AshStatus::NoRxData,
            Err(status @ (AshStatus::Cancelled | AshStatus::ErrorXonXoff)) => return self.host_disconnect(status),
            Err(AshStatus::BadCrc) => {
                self.counters.rx_crc_errors += 1;
                debug!("received frame with CRC error");
                self.reject_frame();
                return AshStatus::NoRxData;
            }
            Err(AshStatus::CommError) => {
                self.counters.rx_comm_errors += 1;
                debug!("received frame with comm error");
                self.reject_frame();
                return AshStatus::NoRxData;
            }
            Err(AshStatus::TooShort) => {
                self.counters.rx_too_short += 1;
                debug!("received frame shorter than minimum");
                self.reject_frame();
                return AshStatus::NoRxData;
            }
            Err(AshStatus::TooLong) => {
                self.counters.rx_too_long += 1;
                debug!("received frame longer than maximum");
                self.reject_frame();
                return AshStatus::NoRxData;
            }
            Err(status) => {
                error!("unexpected status while decoding frame: {}", status);
                return self.host_disconnect(AshStatus::HostFatalError);
            }
        }

        let control = self.rx_frame[0];
        let mut frame_type = match FrameType::classify(control, self.rx_frame.len()) {
            Ok(frame_type) => Some(frame_type),
            Err(AshStatus::BadControl) => {
                self.counters.rx_bad_control += 1;
                debug!("frame with illegal control byte 0x{:02X}", control);
                None
            }
            Err(_) => {
                self.counters.rx_bad_length += 1;
                debug!("frame with illegal length {} for control byte 0x{:02X}", self.rx_frame.len(), control);
                None
            }
        };

        self.count_frame(false, control);

        if !self.flags.connected {
            return self.receive_frame_disconnected(frame_type);
        }

        if let Some(t) = frame_type {
            if t.carries_ack_num() {
                let ack_num = control::ack_num(control);
                trace!("<--- [FRAME type={} ackNum={}](ackRx={} frmTx={})", t, ack_num, self.ack_rx, self.frm_tx);

                if !ack_num.within_range(self.ack_rx, self.frm_tx) {
                    self.counters.rx_bad_ack_number += 1;
                    debug!("<-x- [FRAME type={} ackNum={}] invalid ACK num, not within {}..={}", t, ack_num, self.ack_rx, self.frm_tx);
                    frame_type = None;
                }
                else if ack_num != self.ack_rx {
                    self.on_new_ack(ack_num);
                }
            }
        }

        match frame_type {
            Some(FrameType::Data) => self.receive_data_frame(control),
            Some(FrameType::Ack) => AshStatus::InProgress,
            Some(FrameType::Nak) => {
                self.start_retransmission();
                AshStatus::InProgress
            }
            Some(FrameType::Rst) => {
                debug!("ignoring RST frame from NCP");
                AshStatus::InProgress
            }
            Some(FrameType::RstAck) => {
                error!("received unexpected reset from NCP, reason {}", ncp_code_name(self.rx_frame[2]));
                self.ncp_disconnect(AshStatus::ErrorNcpReset)
            }
            Some(FrameType::Error) => {
                error!("received ERROR from NCP, code {}", ncp_code_name(self.rx_frame[2]));
                self.ncp_disconnect(AshStatus::NcpFatalError)
            }
            None => {
                debug!("<-x- rejecting frame {:02X?}", self.rx_frame);
                self.reject_frame();
                AshStatus::InProgress
            }
        }
    }

    /// Before the session is connected, only RSTACK (and ERROR) frames matter
    fn receive_frame_disconnected(&mut self, frame_type: Option<FrameType>) -> AshStatus {
        match frame_type {
            Some(FrameType::RstAck) => {
                let version = self.rx_frame[1];
                let reason = self.rx_frame[2];

                if version != ASH_VERSION {
                    error!("NCP uses ASH version {}, expected {}", version, ASH_VERSION);
                    return self.host_disconnect(AshStatus::ErrorVersion);
                }

                // NCPs may report other resets while starting up - wait for the one we asked for
                if reason != u8::from(NcpFailedCode::ResetSoftware) {
                    debug!("ignoring RSTACK with reset reason {}", ncp_code_name(reason));
                    return AshStatus::InProgress;
                }

                self.connect();
                AshStatus::Success
            }
            Some(FrameType::Error) => {
                error!("received ERROR from NCP while connecting, code {}", ncp_code_name(self.rx_frame[2]));
                AshStatus::InProgress
            }
            _ => AshStatus::InProgress,
        }
    }

    fn connect(&mut self) {
        self.stop_ack_timer();
        self.timeouts = 0;
        self.set_ack_period(ACK_TIME_INIT);

        self.frm_tx = FrameNum::ZERO;
        self.frm_re_tx = FrameNum::ZERO;
        self.frm_re_tx_head = FrameNum::ZERO;
        self.ack_rx = FrameNum::ZERO;
        self.frm_rx = FrameNum::ZERO;
        self.ack_tx = FrameNum::ZERO;
        self.tx_queue.drain_into(&mut self.tx_pool);
        self.re_tx_queue.drain_into(&mut self.tx_pool);

        self.flags = SessionFlags {
            connected: true,
            ack: true,
            ..SessionFlags::default()
        };
        info!("ASH connected");
    }

    /// The peer acknowledged frames up to (excluding) `ack_num`
    fn on_new_ack(&mut self, ack_num: FrameNum) {
        self.ack_rx = ack_num;
        self.timeouts = 0;

        if self.flags.retx {
            self.stop_ack_timer();
            if ack_num != self.frm_re_tx {
                self.start_ack_timer();
            }
        }
        else {
            self.adjust_ack_period(false);
            if ack_num != self.frm_tx {
                self.start_ack_timer();
            }
            self.scrub_re_tx_queue();
        }
    }

    fn receive_data_frame(&mut self, control: u8) -> AshStatus {
        let frm_num = control::frm_num(control);

        if frm_num == self.frm_rx {
            let Some(id) = self.rx_pool.allocate() else {
                self.counters.rx_no_buffer += 1;
                debug!("<-x- [FRAME type=DATA frmNum={}] no buffer available", frm_num);
                self.reject_frame();
                return AshStatus::NoRxSpace;
            };

            if is_retransmission(control) {
                self.flags.ack = true;
            }
            self.flags.rej = false;
            self.flags.nak = false;
            self.frm_rx = self.frm_rx.next();

            let buf = self.rx_pool.get_mut(&id);
            buf.fill(&self.rx_frame[1..]);
            randomize(buf.as_mut());
            self.counters.rx_data += buf.len() as u32;
            self.rx_queue.push_back(id);

            trace!("<--- [FRAME type=DATA frmNum={}] added to receive queue", frm_num);
            self.push_event(AshEvent::FrameReceived);
            AshStatus::Success
        }
        else if is_retransmission(control) {
            self.counters.rx_duplicates += 1;
            self.flags.ack = true;
            AshStatus::InProgress
        }
        else {
            if !self.flags.rej {
                self.counters.rx_out_of_sequence += 1;
                debug!("<-x- [FRAME type=DATA frmNum={}] out of sequence, expected {}", frm_num, self.frm_rx);
            }
            self.reject_frame();
            AshStatus::InProgress
        }
    }

    /// Decodes a raw frame into `rx_frame`
    fn read_frame(&mut self, raw: &[u8]) -> Result<(), AshStatus> {
        if !self.decoder.is_in_progress() {
            self.rx_frame.clear();
        }

        for &b in raw {
            if b == WAKE && !self.decoder.is_in_progress() {
                // callback pending signal, only relevant for a sleeping NCP
                trace!("ignoring WAKE byte between frames");
                continue;
            }

            match self.decoder.decode_byte(b)? {
                Decoded::Nothing => {}
                Decoded::Byte(out) => self.rx_frame.push(out),
                Decoded::EndOfFrame => return Ok(()),
            }
        }
        Err(AshStatus::InProgress)
    }

    /// Requests a NAK for a bad DATA frame, but only once until a good DATA frame arrives
    fn reject_frame(&mut self) {
        let is_data = self.rx_frame.first()
            .map(|&c| is_data_control(c))
            .unwrap_or(false);

        if is_data && self.flags.connected && !self.flags.rej {
            self.flags.rej = true;
            self.flags.nak = true;
        }
    }

    /// Frees acknowledged buffers at the head of the retransmission queue
    fn scrub_re_tx_queue(&mut self) {
        while self.ack_rx != self.frm_re_tx_head {
            match self.re_tx_queue.pop_front() {
                Some(id) => self.tx_pool.free(id),
                None => {
                    error!("retransmission queue is empty, but frame {} is still unacknowledged", self.frm_re_tx_head);
                    self.frm_re_tx_head = self.ack_rx;
                    break;
                }
            }
            self.frm_re_tx_head = self.frm_re_tx_head.next();
        }
    }

    fn start_retransmission(&mut self) {
        if !self.flags.retx && self.ack_rx != self.frm_tx {
            self.stop_ack_timer();
            self.frm_re_tx = self.ack_rx;
            self.flags.retx = true;
            self.flags.can = true;
        }
    }

    /// Sets or clears 'not ready' based on the number of free receive buffers, and schedules an
    ///  ACK to tell the peer about changes. A 'not ready' status is refreshed periodically.
    fn data_frame_flow_control(&mut self) {
        if !self.flags.connected {
            self.stop_nr_timer();
            self.flags.nr = false;
            self.flags.nrtx = false;
            return;
        }

        let free = self.rx_pool.free_count();
        if free < NR_LOW_LIMIT {
            if !self.flags.nr {
                warn!("not ready - signalling NCP ({} free receive buffers)", free);
            }
            self.flags.nr = true;
        }
        else if free > NR_HIGH_LIMIT {
            self.flags.nr = false;
            self.stop_nr_timer();
        }

        if self.flags.nr {
            if !self.flags.nrtx || self.nr_timer_has_expired() {
                self.flags.ack = true;
                self.start_nr_timer();
            }
        }
        else {
            self.nr_timer_has_expired();

            if self.flags.nrtx {
                self.flags.ack = true;
                self.stop_nr_timer();
            }
        }
    }

    fn host_disconnect(&mut self, cause: AshStatus) -> AshStatus {
        self.flags = SessionFlags::default();
        self.discard_output();
        let first = self.fatal_status().is_none();
        self.host_error = Some(cause);
        error!("ASH disconnected: {} | NCP status: {:?}", cause, self.ncp_error);

        if first {
            self.push_event(AshEvent::FatalError(cause));
        }
        AshStatus::HostFatalError
    }

    fn ncp_disconnect(&mut self, cause: AshStatus) -> AshStatus {
        self.flags = SessionFlags::default();
        self.discard_output();
        let first = self.fatal_status().is_none();
        self.ncp_error = Some(cause);
        error!("ASH disconnected: NCP status {}", cause);

        if first {
            self.push_event(AshEvent::FatalError(cause));
        }
        AshStatus::NcpFatalError
    }

    /// nothing is written to a dead link, including bytes that were queued before it died
    fn discard_output(&mut self) {
        if !self.writer.is_empty() {
            debug!("discarding {} bytes of unsent output", self.writer.len());
        }
        self.writer.clear();
        self.encoder = FrameEncoder::new();
        self.send_state = SendState::Idle;
    }

    fn push_event(&mut self, event: AshEvent) {
        if event == AshEvent::FrameReceived && self.events.len() >= RX_POOL_SIZE {
            // the frame itself stays in the receive queue
            warn!("event queue is full, dropping frame notification");
            return;
        }
        self.events.push_back(event);
    }

    fn count_frame(&mut self, sent: bool, control: u8) {
        let c = &mut self.counters;
        if sent {
            c.tx_all_frames += 1;
        }
        else {
            c.rx_all_frames += 1;
        }

        if is_data_control(control) {
            match (sent, is_retransmission(control)) {
                (true, true) => c.tx_re_data_frames += 1,
                (true, false) => c.tx_data_frames += 1,
                (false, true) => c.rx_re_data_frames += 1,
                (false, false) => c.rx_data_frames += 1,
            }
        }
        else if control & SHFRAME_MASK == CONTROL_ACK || control & SHFRAME_MASK == CONTROL_NAK {
            let is_ack = control & SHFRAME_MASK == CONTROL_ACK;
            match (sent, is_ack) {
                (true, true) => c.tx_ack_frames += 1,
                (true, false) => c.tx_nak_frames += 1,
                (false, true) => c.rx_ack_frames += 1,
                (false, false) => c.rx_nak_frames += 1,
            }

            if is_not_ready(control) {
                if sent {
                    c.tx_n1_frames += 1;
                }
                else {
                    c.rx_n1_frames += 1;
                }
            }
        }
    }

    fn set_ack_period(&mut self, period: Duration) {
        self.ack_period = period;
        self.ack_timer = None;
    }

    fn set_and_start_ack_timer(&mut self, period: Duration) {
        self.set_ack_period(period);
        self.start_ack_timer();
    }

    fn start_ack_timer(&mut self) {
        self.ack_timer = Some(Instant::now());
    }

    fn stop_ack_timer(&mut self) {
        self.ack_timer = None;
    }

    fn ack_timer_has_expired(&self) -> bool {
        match self.ack_timer {
            Some(started) => started.elapsed() >= self.ack_period,
            None => false,
        }
    }

    /// Adapts the ACK timeout to the observed round trip: doubled on expiry, otherwise smoothed
    ///  as `(7 * period + elapsed) / 8`. The result is kept within the protocol's bounds, and the
    ///  timer is always stopped.
    fn adjust_ack_period(&mut self, expired: bool) {
        if expired {
            self.ack_period *= 2;
        }
        else if let Some(started) = self.ack_timer {
            self.ack_period = (self.ack_period * 7 + started.elapsed()) / 8;
        }

        self.ack_period = self.ack_period.clamp(ACK_TIME_MIN, ACK_TIME_MAX);
        self.ack_timer = None;
    }

    fn start_nr_timer(&mut self) {
        self.nr_timer = Some(Instant::now() + NR_TIME);
    }

    fn stop_nr_timer(&mut self) {
        self.nr_timer = None;
    }

    /// true if the timer has expired or is stopped. An expired timer is stopped.
    fn nr_timer_has_expired(&mut self) -> bool {
        if let Some(deadline) = self.nr_timer {
            if Instant::now() >= deadline {
                self.nr_timer = None;
            }
        }
        self.nr_timer.is_none()
    }
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rand::RngCore;
    use rstest::rstest;
    use tokio::time::advance;
    use crate::codec::{decode_frame, encode_frame};
    use super::*;

    const RST: [u8; 5] = [0x1A, 0xC0, 0x38, 0xBC, 0x7E];
    const RSTACK: [u8; 7] = [0x1A, 0xC1, 0x02, 0x0B, 0x0A, 0x52, 0x7E];

    fn frame(control: u8, data: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_frame(control, data, &mut out);
        out.to_vec()
    }

    /// a DATA frame as the NCP would send it
    fn ncp_data(frm: u8, ack: u8, retx: bool, payload: &[u8]) -> Vec<u8> {
        let mut data = payload.to_vec();
        randomize(&mut data);
        frame(data_control(FrameNum::from_raw(frm), FrameNum::from_raw(ack), retx), &data)
    }

    fn ncp_ack(ack: u8) -> Vec<u8> {
        frame(ack_control(FrameNum::from_raw(ack), false), &[])
    }

    fn ncp_nak(ack: u8) -> Vec<u8> {
        frame(nak_control(FrameNum::from_raw(ack), false), &[])
    }

    /// decoded (control byte + data field) frames in the engine's output
    fn sent_frames(engine: &mut AshEngine) -> Vec<Vec<u8>> {
        let out = engine.take_output();
        Deframer::new().feed(&out).iter()
            .map(|raw| decode_frame(&raw.data, true).unwrap())
            .collect()
    }

    fn sent_controls(engine: &mut AshEngine) -> Vec<u8> {
        sent_frames(engine).iter().map(|f| f[0]).collect()
    }

    fn connected_engine() -> AshEngine {
        let mut engine = AshEngine::new(true);
        engine.reset();
        engine.send_exec();
        assert_eq!(engine.take_output().as_ref(), &RST);

        engine.receive(&RSTACK);
        assert!(engine.is_connected());
        assert_eq!(engine.take_output().as_ref(), &[0x80, 0x70, 0x78, 0x7E]);
        engine
    }

    fn events(engine: &mut AshEngine) -> Vec<AshEvent> {
        std::iter::from_fn(|| engine.next_event()).collect()
    }

    #[test]
    fn test_reset_sends_cancel_and_rst() {
        let mut engine = AshEngine::new(true);
        assert!(!engine.is_connected());

        engine.reset();
        engine.send_exec();
        assert_eq!(engine.take_output().as_ref(), &RST);

        // RST is sent only once
        engine.send_exec();
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_rstack_connects_and_acks() {
        let mut engine = connected_engine();
        assert!(engine.is_idle());
        assert_eq!(engine.counters().rx_all_frames, 1);
        assert_eq!(engine.counters().tx_ack_frames, 1);
        assert!(events(&mut engine).is_empty());
    }

    #[test]
    fn test_rstack_in_chunks() {
        let mut engine = AshEngine::new(true);
        engine.reset();
        engine.send_exec();
        engine.take_output();

        engine.receive(&RSTACK[..3]);
        assert!(!engine.is_connected());
        engine.receive(&RSTACK[3..]);
        assert!(engine.is_connected());
    }

    #[rstest]
    #[case::power_on(vec![0xC1, 0x02, 0x02, 0x9B, 0x7B, 0x7E])]
    #[case::ack(vec![0x81, 0x60, 0x59, 0x7E])]
    #[case::error(vec![0xC2, 0x02, 0x51, 0xA8, 0xBD, 0x7E])]
    fn test_ignored_while_connecting(#[case] raw: Vec<u8>) {
        let mut engine = AshEngine::new(true);
        engine.reset();
        engine.send_exec();
        engine.take_output();

        engine.receive(&raw);
        assert!(!engine.is_connected());
        assert!(engine.fatal_status().is_none());
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_rstack_version_mismatch_is_fatal() {
        let mut engine = AshEngine::new(true);
        engine.reset();
        engine.send_exec();
        engine.take_output();

        engine.receive(&[0xC1, 0x03, 0x0B, 0x39, 0x63, 0x7E]);
        assert!(!engine.is_connected());
        assert_eq!(events(&mut engine), vec![AshEvent::FatalError(AshStatus::ErrorVersion)]);
        assert_eq!(engine.send(&[1, 2, 3]), AshStatus::HostFatalError);

        // a reset brings the engine back to life
        engine.reset();
        assert!(engine.fatal_status().is_none());
        engine.send_exec();
        assert_eq!(engine.take_output().as_ref(), &RST);
    }

    #[test]
    fn test_send_data_frame() {
        let mut engine = connected_engine();

        assert_eq!(engine.send(&[0x00, 0x00, 0x00, 0x0D]), AshStatus::Success);
        assert_eq!(engine.take_output().as_ref(), &[0x00, 0x42, 0x21, 0xA8, 0x59, 0x7C, 0x05, 0x7E]);

        assert_eq!(engine.frm_tx, FrameNum::from_raw(1));
        assert_eq!(engine.re_tx_queue.len(), 1);
        assert!(engine.tx_queue.is_empty());
        assert!(engine.ack_timer.is_some());
        assert!(!engine.is_idle());
        assert_eq!(engine.counters().tx_data_frames, 1);
        assert_eq!(engine.counters().tx_data, 4);
    }

    #[test]
    fn test_receive_data_frame() {
        let mut engine = connected_engine();
        engine.send(&[0x00, 0x00, 0x00, 0x0D]);
        engine.take_output();

        // response, acknowledging the request
        engine.receive(&[0x01, 0x42, 0xA1, 0xA8, 0x59, 0x28, 0x05, 0xC6, 0xA8, 0x77, 0x7E]);

        assert_eq!(engine.take_output().as_ref(), &[0x81, 0x60, 0x59, 0x7E]);
        assert_eq!(events(&mut engine), vec![AshEvent::FrameReceived]);
        assert_eq!(engine.pending_frames(), 1);
        assert_eq!(engine.take_frame().unwrap().as_ref(), &[0x00, 0x80, 0x00, 0x0D, 0x02, 0x10, 0x74]);
        assert!(engine.take_frame().is_none());

        assert_eq!(engine.ack_rx, FrameNum::from_raw(1));
        assert_eq!(engine.frm_rx, FrameNum::from_raw(1));
        assert!(engine.re_tx_queue.is_empty());
        assert_eq!(engine.tx_pool.free_count(), TX_POOL_SIZE);
        assert_eq!(engine.rx_pool.free_count(), RX_POOL_SIZE);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_frames_are_delivered_in_order() {
        let mut engine = connected_engine();
        for frm in 0..10u8 {
            engine.receive(&ncp_data(frm % 8, 0, false, &[frm, frm, frm]));
        }

        assert_eq!(events(&mut engine).len(), 10);
        for frm in 0..10u8 {
            assert_eq!(engine.take_frame().unwrap().as_ref(), &[frm, frm, frm]);
        }
        assert_eq!(engine.frm_rx, FrameNum::from_raw(2));
        assert_eq!(engine.counters().rx_data_frames, 10);
        assert_eq!(engine.counters().rx_data, 30);
    }

    #[rstest]
    #[case::too_short(vec![1, 2], AshStatus::DataFrameTooShort)]
    #[case::too_long(vec![0; MAX_DATA_FIELD_LEN + 1], AshStatus::DataFrameTooLong)]
    #[case::min(vec![0; MIN_DATA_FIELD_LEN], AshStatus::Success)]
    #[case::max(vec![0; MAX_DATA_FIELD_LEN], AshStatus::Success)]
    fn test_send_payload_length(#[case] payload: Vec<u8>, #[case] expected: AshStatus) {
        let mut engine = connected_engine();
        assert_eq!(engine.send(&payload), expected);
    }

    #[test]
    fn test_send_not_connected() {
        let mut engine = AshEngine::new(true);
        assert_eq!(engine.send(&[1, 2, 3]), AshStatus::NotConnected);
        assert_eq!(engine.tx_pool.free_count(), TX_POOL_SIZE);
    }

    #[test]
    fn test_no_tx_space() {
        let mut engine = connected_engine();
        for _ in 0..TX_POOL_SIZE {
            assert_eq!(engine.send(&[1, 2, 3]), AshStatus::Success);
        }
        assert_eq!(engine.send(&[1, 2, 3]), AshStatus::NoTxSpace);
        assert_eq!(engine.re_tx_queue.len(), TX_K as usize);
        assert_eq!(engine.tx_queue.len(), TX_POOL_SIZE - TX_K as usize);
    }

    #[test]
    fn test_window_is_limited_to_k_frames() {
        let mut engine = connected_engine();
        for i in 0..5u8 {
            engine.send(&[i, i, i]);
        }

        assert_eq!(sent_controls(&mut engine), vec![0x00, 0x10, 0x20]);
        assert_eq!(engine.re_tx_queue.len(), 3);
        assert_eq!(engine.tx_queue.len(), 2);

        engine.receive(&ncp_ack(3));
        assert_eq!(sent_controls(&mut engine), vec![0x30, 0x40]);
        assert_eq!(engine.ack_rx, FrameNum::from_raw(3));
        assert_eq!(engine.re_tx_queue.len(), 2);
        assert!(engine.tx_queue.is_empty());
        assert_eq!(engine.tx_pool.free_count(), TX_POOL_SIZE - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bound_under_random_traffic() {
        let mut rng = rand::thread_rng();
        let mut engine = connected_engine();

        for _ in 0..2000 {
            match rng.next_u32() % 4 {
                0 | 1 => {
                    engine.send(&[1, 2, 3]);
                }
                2 => {
                    let outstanding = engine.frm_tx.distance_from(engine.ack_rx);
                    let ack = engine.ack_rx.plus((rng.next_u32() % (outstanding as u32 + 1)) as u8);
                    engine.receive(&ncp_ack(ack.to_raw()));
                }
                _ => {
                    engine.receive(&ncp_nak(engine.ack_rx.to_raw()));
                }
            }
            engine.take_output();

            assert!(engine.re_tx_queue.len() <= TX_K as usize);
            assert!(engine.frm_tx.distance_from(engine.ack_rx) <= TX_K);
            assert_eq!(engine.tx_queue.len() + engine.re_tx_queue.len() + engine.tx_pool.free_count(), TX_POOL_SIZE);
        }
        assert!(engine.fatal_status().is_none());
    }

    #[test]
    fn test_crc_error_requests_single_nak() {
        let mut engine = connected_engine();

        let mut corrupted = ncp_data(0, 0, false, &[1, 2, 3]);
        let len = corrupted.len();
        corrupted[len - 2] ^= 0x01;

        engine.receive(&corrupted);
        assert_eq!(engine.counters().rx_crc_errors, 1);
        assert!(engine.flags.rej);
        assert_eq!(engine.take_output().as_ref(), &[0xA0, 0x54, 0x7D, 0x3A, 0x7E]);

        // still rejecting: counted, but no further NAK
        engine.receive(&corrupted);
        assert_eq!(engine.counters().rx_crc_errors, 2);
        assert!(engine.take_output().is_empty());

        engine.receive(&ncp_data(0, 0, false, &[1, 2, 3]));
        assert!(!engine.flags.rej);
        assert_eq!(engine.take_output().as_ref(), &[0x81, 0x60, 0x59, 0x7E]);
        assert_eq!(engine.take_frame().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(engine.counters().tx_nak_frames, 1);
    }

    #[test]
    fn test_comm_error_is_counted() {
        let mut engine = connected_engine();
        engine.receive(&[0x00, 0x43, 0x18, 0x23, 0xAB, 0x97, 0x09, 0x7E]);
        assert_eq!(engine.counters().rx_comm_errors, 1);
        // no control byte was decoded, so there is nothing to reject
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_bad_length_data_frame_is_rejected() {
        let mut engine = connected_engine();
        engine.receive(&frame(0x00, &[0x43, 0x23]));
        assert_eq!(engine.counters().rx_bad_length, 1);
        assert_eq!(sent_controls(&mut engine), vec![0xA0]);
    }

    #[test]
    fn test_bad_control_is_counted() {
        let mut engine = connected_engine();
        engine.receive(&frame(0xE3, &[]));
        assert_eq!(engine.counters().rx_bad_control, 1);
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_out_of_sequence_counted_once() {
        let mut engine = connected_engine();

        engine.receive(&ncp_data(1, 0, false, &[1, 2, 3]));
        assert_eq!(sent_controls(&mut engine), vec![0xA0]);
        assert_eq!(engine.counters().rx_out_of_sequence, 1);

        engine.receive(&ncp_data(2, 0, false, &[1, 2, 3]));
        assert!(engine.take_output().is_empty());
        assert_eq!(engine.counters().rx_out_of_sequence, 1);

        assert_eq!(engine.frm_rx, FrameNum::ZERO);
        assert_eq!(engine.pending_frames(), 0);
        assert_eq!(engine.rx_pool.free_count(), RX_POOL_SIZE);
    }

    #[test]
    fn test_retransmitted_duplicate_is_acked() {
        let mut engine = connected_engine();
        engine.receive(&ncp_data(0, 0, false, &[1, 2, 3]));
        assert_eq!(sent_controls(&mut engine), vec![0x81]);

        engine.receive(&ncp_data(0, 0, true, &[1, 2, 3]));
        assert_eq!(sent_controls(&mut engine), vec![0x81]);
        assert_eq!(engine.counters().rx_duplicates, 1);
        assert_eq!(engine.pending_frames(), 1);
    }

    #[test]
    fn test_retransmitted_in_sequence_frame_is_accepted() {
        let mut engine = connected_engine();
        engine.receive(&ncp_data(0, 0, true, &[1, 2, 3]));
        assert_eq!(sent_controls(&mut engine), vec![0x81]);
        assert_eq!(engine.counters().rx_re_data_frames, 1);
        assert_eq!(engine.take_frame().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_bad_ack_number() {
        let mut engine = connected_engine();
        engine.receive(&ncp_ack(2));

        assert_eq!(engine.counters().rx_bad_ack_number, 1);
        assert_eq!(engine.ack_rx, FrameNum::ZERO);
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_nak_starts_retransmission() {
        let mut engine = connected_engine();
        engine.send(&[1, 2, 3]);
        engine.send(&[4, 5, 6]);
        engine.take_output();

        engine.receive(&ncp_nak(0));
        let out = engine.take_output();
        assert_eq!(out[0], CANCEL);
        assert_eq!(&out[1..], &[
            0x08, 0x43, 0x23, 0xAB, 0x12, 0xCA, 0x7E,
            0x7D, 0x38, 0x46, 0x24, 0xAE, 0x2B, 0xAF, 0x7E,
        ]);
        assert_eq!(engine.counters().tx_re_data_frames, 2);
        assert_eq!(engine.frm_tx, FrameNum::from_raw(2));

        // retransmission is complete once all frames were resent
        engine.send_exec();
        assert!(!engine.flags.retx);

        engine.receive(&ncp_ack(2));
        assert!(engine.re_tx_queue.is_empty());
        assert_eq!(engine.tx_pool.free_count(), TX_POOL_SIZE);
    }

    #[test]
    fn test_nak_with_partial_ack() {
        let mut engine = connected_engine();
        engine.send(&[1, 2, 3]);
        engine.send(&[4, 5, 6]);
        engine.take_output();

        // frame 0 was received, frame 1 was not
        engine.receive(&ncp_nak(1));
        let frames = sent_frames(&mut engine);
        assert_eq!(frames.iter().map(|f| f[0]).collect::<Vec<_>>(), vec![0x18]);
        assert_eq!(engine.ack_rx, FrameNum::from_raw(1));
    }

    #[test]
    fn test_unexpected_rstack_is_ncp_fatal() {
        let mut engine = connected_engine();
        engine.receive(&RSTACK);

        assert!(!engine.is_connected());
        assert_eq!(events(&mut engine), vec![AshEvent::FatalError(AshStatus::ErrorNcpReset)]);
        assert_eq!(engine.send(&[1, 2, 3]), AshStatus::NcpFatalError);
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_error_frame_is_ncp_fatal() {
        let mut engine = connected_engine();
        engine.receive(&[0xC2, 0x02, 0x51, 0xA8, 0xBD, 0x7E]);

        assert_eq!(events(&mut engine), vec![AshEvent::FatalError(AshStatus::NcpFatalError)]);
        assert_eq!(engine.fatal_status(), Some(AshStatus::NcpFatalError));

        // further frames are not processed, and the error is not raised again
        engine.receive(&RSTACK);
        assert!(events(&mut engine).is_empty());
        assert!(!engine.is_connected());
    }

    #[test]
    fn test_no_output_after_ncp_error() {
        let mut engine = connected_engine();

        // the DATA frame is acknowledged, but the ERROR kills the link before the ACK leaves the host
        let mut chunk = ncp_data(0, 0, false, &[1, 2, 3]);
        chunk.extend_from_slice(&[0xC2, 0x02, 0x51, 0xA8, 0xBD, 0x7E]);
        engine.receive(&chunk);

        assert_eq!(engine.fatal_status(), Some(AshStatus::NcpFatalError));
        assert!(engine.take_output().is_empty());

        engine.send_exec();
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn test_no_output_after_host_error() {
        let mut engine = connected_engine();
        engine.send(&[0x7E; MAX_DATA_FIELD_LEN]);
        assert!(!engine.writer.is_empty());

        engine.fail(AshStatus::ErrorSerialInit);
        assert!(engine.take_output().is_empty());
        assert_eq!(engine.send_state, SendState::Idle);

        // a reset starts over with a clean output stream
        engine.reset();
        engine.send_exec();
        assert_eq!(engine.take_output().as_ref(), &RST);
    }

    #[test]
    fn test_xon_xoff_is_fatal_without_hardware_flow_control() {
        let mut engine = connected_engine();
        engine.receive(&[0x80, 0x11, 0x70, 0x78, 0x7E]);
        assert_eq!(events(&mut engine), vec![AshEvent::FatalError(AshStatus::ErrorXonXoff)]);
    }

    #[test]
    fn test_xon_xoff_ignored_with_hardware_flow_control() {
        let mut engine = AshEngine::new(false);
        engine.reset();
        engine.send_exec();
        engine.take_output();
        engine.receive(&[0x1A, 0xC1, 0x11, 0x02, 0x0B, 0x13, 0x0A, 0x52, 0x7E]);
        assert!(engine.is_connected());
    }

    #[test]
    fn test_cancelled_frame_is_counted() {
        let mut engine = connected_engine();
        engine.receive(&[0x12, 0x34, 0x1A, 0x80, 0x70, 0x78, 0x7E]);
        assert_eq!(engine.counters().rx_cancelled, 1);
        assert_eq!(engine.counters().rx_ack_frames, 1);
        assert!(engine.fatal_status().is_none());
    }

    #[test]
    fn test_wake_byte_between_frames_is_ignored() {
        let mut engine = connected_engine();
        engine.receive(&[0xFF, 0x80, 0x70, 0x78, 0x7E]);
        assert_eq!(engine.counters().rx_ack_frames, 1);
        assert_eq!(engine.counters().rx_crc_errors, 0);
    }

    #[test]
    fn test_no_rx_buffer() {
        let mut engine = connected_engine();
        for frm in 0..RX_POOL_SIZE {
            engine.receive(&ncp_data((frm % 8) as u8, 0, false, &[1, 2, 3]));
        }
        engine.take_output();
        assert_eq!(engine.rx_pool.free_count(), 0);

        engine.receive(&ncp_data(0, 0, false, &[1, 2, 3]));
        assert_eq!(engine.counters().rx_no_buffer, 1);
        // NAK with nFlag set, since the host is not ready
        assert_eq!(sent_controls(&mut engine), vec![0xA8]);
        assert_eq!(engine.frm_rx, FrameNum::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_flow_control() {
        let mut engine = connected_engine();

        for frm in 0..(RX_POOL_SIZE - NR_LOW_LIMIT) {
            engine.receive(&ncp_data((frm % 8) as u8, 0, false, &[1, 2, 3]));
            assert_eq!(sent_controls(&mut engine), vec![0x80 | ((frm + 1) % 8) as u8]);
        }

        // one more buffer taken crosses the low water mark
        engine.receive(&ncp_data(0, 0, false, &[1, 2, 3]));
        assert!(engine.flags.nr);
        assert_eq!(sent_controls(&mut engine), vec![0x89]);
        assert_eq!(engine.counters().tx_n1_frames, 1);

        // the nFlag is refreshed periodically
        advance(NR_TIME / 2).await;
        engine.send_exec();
        assert!(engine.take_output().is_empty());
        advance(NR_TIME / 2).await;
        engine.send_exec();
        assert_eq!(sent_controls(&mut engine), vec![0x89]);

        // draining the receive queue clears it again
        while engine.take_frame().is_some() {}
        engine.send_exec();
        assert!(!engine.flags.nr);
        assert_eq!(sent_controls(&mut engine), vec![0x81]);
        assert!(engine.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeouts_are_fatal() {
        let mut engine = connected_engine();
        engine.send(&[1, 2, 3]);
        assert_eq!(engine.take_output().as_ref(), &[0x00, 0x43, 0x23, 0xAB, 0x97, 0x09, 0x7E]);

        let mut timeout_periods = vec![Duration::from_millis(800), Duration::from_millis(1600)];
        timeout_periods.extend([ACK_TIME_MAX; 4]);

        for (i, period) in timeout_periods.into_iter().enumerate() {
            advance(period - Duration::from_millis(1)).await;
            engine.send_exec();
            assert!(engine.take_output().is_empty());

            advance(Duration::from_millis(1)).await;
            engine.send_exec();
            assert_eq!(engine.counters().rx_ack_timeouts, i as u32 + 1);

            if i < 5 {
                assert_eq!(engine.take_output().as_ref(), &[0x1A, 0x08, 0x43, 0x23, 0xAB, 0x12, 0xCA, 0x7E]);
                assert!(events(&mut engine).is_empty());
            }
        }

        assert_eq!(events(&mut engine), vec![AshEvent::FatalError(AshStatus::ErrorTimeouts)]);
        assert!(engine.take_output().is_empty());
        assert_eq!(engine.send(&[1, 2, 3]), AshStatus::HostFatalError);

        advance(Duration::from_secs(10)).await;
        engine.send_exec();
        assert!(engine.take_output().is_empty());
        assert!(events(&mut engine).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resets_timeout_count() {
        let mut engine = connected_engine();
        engine.send(&[1, 2, 3]);
        engine.take_output();

        advance(Duration::from_millis(800)).await;
        engine.send_exec();
        engine.take_output();
        assert_eq!(engine.timeouts, 1);

        engine.receive(&ncp_ack(1));
        assert_eq!(engine.timeouts, 0);
        assert!(engine.ack_timer.is_none());
        assert!(engine.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_period_adapts() {
        let mut engine = connected_engine();
        assert_eq!(engine.ack_period(), ACK_TIME_INIT);

        engine.send(&[1, 2, 3]);
        advance(Duration::from_millis(400)).await;
        engine.receive(&ncp_ack(1));
        assert_eq!(engine.ack_period(), Duration::from_millis(750));

        // fast responses converge towards the minimum
        for i in 0..40u8 {
            engine.send(&[1, 2, 3]);
            engine.take_output();
            engine.receive(&ncp_ack((i + 2) % 8));
        }
        assert_eq!(engine.ack_period(), ACK_TIME_MIN);
        assert_eq!(engine.counters().rx_bad_ack_number, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timer_restarted_for_remaining_frames() {
        let mut engine = connected_engine();
        engine.send(&[1, 2, 3]);
        engine.send(&[4, 5, 6]);
        engine.take_output();

        advance(Duration::from_millis(100)).await;
        engine.receive(&ncp_ack(1));
        assert!(engine.ack_timer.is_some());

        engine.receive(&ncp_ack(2));
        assert!(engine.ack_timer.is_none());
    }

    #[test]
    fn test_output_is_limited_by_high_water_mark() {
        let mut engine = connected_engine();
        for _ in 0..3 {
            engine.send(&[0x7E; MAX_DATA_FIELD_LEN]);
        }
        let first = engine.take_output();
        assert_eq!(first.len(), WRITER_HIGH_WATER_MARK);

        let mut all = first.to_vec();
        loop {
            engine.send_exec();
            let out = engine.take_output();
            if out.is_empty() {
                break;
            }
            all.extend_from_slice(&out);
        }

        let frames: Vec<Vec<u8>> = Deframer::new().feed(&all).iter()
            .map(|raw| decode_frame(&raw.data, true).unwrap())
            .collect();
        assert_eq!(frames.len(), 3);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f[0], (i as u8) << 4);
            let mut payload = f[1..].to_vec();
            randomize(&mut payload);
            assert_eq!(payload, vec![0x7E; MAX_DATA_FIELD_LEN]);
        }
    }

    #[test]
    fn test_nak_cancels_data_frame_in_progress() {
        let mut engine = connected_engine();
        for _ in 0..3 {
            engine.send(&[0x7E; MAX_DATA_FIELD_LEN]);
        }

        // frame 0 is complete, frame 1 is cut off by the high water mark
        let mut all = engine.take_output().to_vec();
        assert_eq!(all.len(), WRITER_HIGH_WATER_MARK);
        assert_eq!(engine.send_state, SendState::SendingData);

        engine.receive(&ncp_nak(0));
        let out = engine.take_output();
        assert_eq!(out[0], CANCEL);
        all.extend_from_slice(&out);
        loop {
            engine.send_exec();
            let out = engine.take_output();
            if out.is_empty() {
                break;
            }
            all.extend_from_slice(&out);
        }

        let controls: Vec<u8> = Deframer::new().feed(&all).iter()
            .map(|raw| decode_frame(&raw.data, true).unwrap()[0])
            .collect();
        assert_eq!(controls, vec![0x00, 0x08, 0x10, 0x20]);
        assert_eq!(engine.counters().tx_cancelled, 1);
        assert_eq!(engine.counters().tx_re_data_frames, 1);
        assert_eq!(engine.frm_tx, FrameNum::from_raw(3));
    }

    #[test]
    fn test_stop_returns_buffers() {
        let mut engine = connected_engine();
        for _ in 0..5 {
            engine.send(&[1, 2, 3]);
        }
        engine.receive(&ncp_data(0, 0, false, &[1, 2, 3]));

        engine.stop();
        assert!(!engine.is_connected());
        assert_eq!(engine.tx_pool.free_count(), TX_POOL_SIZE);
        assert_eq!(engine.rx_pool.free_count(), RX_POOL_SIZE);
        assert!(engine.take_output().is_empty());
        assert_eq!(engine.send(&[1, 2, 3]), AshStatus::NotConnected);

        engine.stop();
        assert!(!engine.is_connected());
    }

    #[test]
    fn test_read_and_clear_counters() {
        let mut engine = connected_engine();
        let counters = engine.read_and_clear_counters();
        assert_eq!(counters.tx_all_frames, 2);
        assert_eq!(counters.rx_all_frames, 1);
        assert_eq!(engine.counters(), &AshCounters::default());
    }

    #[test]
    fn test_response_timeout() {
        assert_eq!(AshEngine::response_timeout(), Duration::from_millis(14400));
    }
}
