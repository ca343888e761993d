use std::time::Duration;

/// Fragment size for messages that do not fit in a single outbox entry.
pub(crate) const DEFAULT_MULTIPART_LIMIT_SIZE_BYTES: usize = 20 * 1024 * 1024;
/// Maximum serialized packet size before compression.
pub(crate) const DEFAULT_PACKET_LIMIT_SIZE_BYTES: usize = 200 * 1024 * 1024;
/// Minimum age before an unacked message is sent again.
pub(crate) const DEFAULT_RETRANSMISSION_TIMEOUT: Duration = Duration::from_secs(5);
/// How many times a single NACK is retransmitted before it is dropped.
pub(crate) const DEFAULT_NACK_TRANSMIT_COUNT: u32 = 5;
/// How long a packet file must stay the same size before it is assumed
/// complete even though the size sentinel says otherwise.
pub(crate) const DEFAULT_DELAY_ASSUME_WRITE_FINISHED: Duration = Duration::from_secs(1);
/// How many decode attempts a file gets before it is deleted.
pub(crate) const DEFAULT_MAX_DECODE_ATTEMPTS: u32 = 3;

/// Maximum size of a packet file on disk, after compression. The size
/// sentinel is a u32, this keeps it far below that bound.
pub(crate) const MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;
/// Message ids are 1-indexed and bounded by the signed 32-bit range.
pub(crate) const MAX_MESSAGE_ID: u32 = i32::MAX as u32;
/// Version carried in every packet header.
pub(crate) const PROTOCOL_VERSION: u32 = 2;

/// Config collects the tuning knobs of a channel into a single structure.
///
/// The defaults are suitable for a shared folder on a LAN or a slow
/// one-way file transfer appliance. All limits are per messenger pair.
#[derive(Debug, Clone)]
pub struct Config {
    multipart_limit_size_bytes: usize,
    packet_limit_size_bytes: usize,
    retransmission_timeout: Duration,
    nack_transmit_count: u32,
    delay_assume_write_finished: Duration,
    max_decode_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            multipart_limit_size_bytes: DEFAULT_MULTIPART_LIMIT_SIZE_BYTES,
            packet_limit_size_bytes: DEFAULT_PACKET_LIMIT_SIZE_BYTES,
            retransmission_timeout: DEFAULT_RETRANSMISSION_TIMEOUT,
            nack_transmit_count: DEFAULT_NACK_TRANSMIT_COUNT,
            delay_assume_write_finished: DEFAULT_DELAY_ASSUME_WRITE_FINISHED,
            max_decode_attempts: DEFAULT_MAX_DECODE_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn with_multipart_limit_size_bytes(mut self, value: usize) -> Self {
        self.multipart_limit_size_bytes = value;
        self
    }

    pub fn with_packet_limit_size_bytes(mut self, value: usize) -> Self {
        self.packet_limit_size_bytes = value;
        self
    }

    pub fn with_retransmission_timeout(mut self, value: Duration) -> Self {
        self.retransmission_timeout = value;
        self
    }

    pub fn with_nack_transmit_count(mut self, value: u32) -> Self {
        self.nack_transmit_count = value;
        self
    }

    pub fn with_delay_assume_write_finished(mut self, value: Duration) -> Self {
        self.delay_assume_write_finished = value;
        self
    }

    pub fn with_max_decode_attempts(mut self, value: u32) -> Self {
        self.max_decode_attempts = value;
        self
    }

    pub(crate) fn multipart_limit_size_bytes(&self) -> usize {
        self.multipart_limit_size_bytes
    }

    pub(crate) fn packet_limit_size_bytes(&self) -> usize {
        self.packet_limit_size_bytes
    }

    pub(crate) fn retransmission_timeout(&self) -> Duration {
        self.retransmission_timeout
    }

    pub(crate) fn nack_transmit_count(&self) -> u32 {
        self.nack_transmit_count
    }

    pub(crate) fn delay_assume_write_finished(&self) -> Duration {
        self.delay_assume_write_finished
    }

    pub(crate) fn max_decode_attempts(&self) -> u32 {
        self.max_decode_attempts
    }
}
