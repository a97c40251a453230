use tracing::info;

/// Frame and error statistics of an ASH link, in both directions. Byte counts cover DATA frame
///  data fields only.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AshCounters {
    pub tx_data: u32,
    pub tx_all_frames: u32,
    pub tx_data_frames: u32,
    pub tx_ack_frames: u32,
    pub tx_nak_frames: u32,
    pub tx_re_data_frames: u32,
    /// ACK / NAK frames sent with nFlag set
    pub tx_n1_frames: u32,
    pub tx_cancelled: u32,

    pub rx_data: u32,
    pub rx_all_frames: u32,
    pub rx_data_frames: u32,
    pub rx_ack_frames: u32,
    pub rx_nak_frames: u32,
    pub rx_re_data_frames: u32,
    pub rx_n1_frames: u32,
    pub rx_cancelled: u32,

    pub rx_crc_errors: u32,
    pub rx_comm_errors: u32,
    pub rx_too_short: u32,
    pub rx_too_long: u32,
    pub rx_bad_control: u32,
    pub rx_bad_length: u32,
    pub rx_bad_ack_number: u32,
    pub rx_no_buffer: u32,
    pub rx_duplicates: u32,
    pub rx_out_of_sequence: u32,
    pub rx_ack_timeouts: u32,
}

impl AshCounters {
    /// Returns the current values and starts over at zero
    pub fn read_and_clear(&mut self) -> AshCounters {
        std::mem::take(self)
    }

    /// The counters as a flat list, in the order in which NCPs report their own counters
    pub fn to_vec(&self) -> Vec<u32> {
        vec![
            self.tx_data,
            self.tx_all_frames,
            self.tx_data_frames,
            self.tx_ack_frames,
            self.tx_nak_frames,
            self.tx_re_data_frames,
            self.tx_n1_frames,
            self.tx_cancelled,

            self.rx_data,
            self.rx_all_frames,
            self.rx_data_frames,
            self.rx_ack_frames,
            self.rx_nak_frames,
            self.rx_re_data_frames,
            self.rx_n1_frames,
            self.rx_cancelled,

            self.rx_crc_errors,
            self.rx_comm_errors,
            self.rx_too_short,
            self.rx_too_long,
            self.rx_bad_control,
            self.rx_bad_length,
            self.rx_bad_ack_number,
            self.rx_no_buffer,
            self.rx_duplicates,
            self.rx_out_of_sequence,
            self.rx_ack_timeouts,
        ]
    }

    pub fn log(&self) {
        info!("ASH counters since last clear:");
        info!("  Total frames: RX={}, TX={}", self.rx_all_frames, self.tx_all_frames);
        info!("  Cancelled   : RX={}, TX={}", self.rx_cancelled, self.tx_cancelled);
        info!("  DATA frames : RX={}, TX={}", self.rx_data_frames, self.tx_data_frames);
        info!("  DATA bytes  : RX={}, TX={}", self.rx_data, self.tx_data);
        info!("  Retry frames: RX={}, TX={}", self.rx_re_data_frames, self.tx_re_data_frames);
        info!("  ACK frames  : RX={}, TX={}", self.rx_ack_frames, self.tx_ack_frames);
        info!("  NAK frames  : RX={}, TX={}", self.rx_nak_frames, self.tx_nak_frames);
        info!("  nRdy frames : RX={}, TX={}", self.rx_n1_frames, self.tx_n1_frames);
        info!("  CRC errors      : RX={}", self.rx_crc_errors);
        info!("  Comm errors     : RX={}", self.rx_comm_errors);
        info!("  Length < minimum: RX={}", self.rx_too_short);
        info!("  Length > maximum: RX={}", self.rx_too_long);
        info!("  Bad controls    : RX={}", self.rx_bad_control);
        info!("  Bad lengths     : RX={}", self.rx_bad_length);
        info!("  Bad ACK numbers : RX={}", self.rx_bad_ack_number);
        info!("  Out of buffers  : RX={}", self.rx_no_buffer);
        info!("  Retry dupes     : RX={}", self.rx_duplicates);
        info!("  Out of sequence : RX={}", self.rx_out_of_sequence);
        info!("  ACK timeouts    : RX={}", self.rx_ack_timeouts);
    }
}
