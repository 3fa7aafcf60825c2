use crate::segment::MAX_PAYLOAD_LEN;
use anyhow::bail;
use std::time::Duration;

/// Protocol tunables. The defaults are deliberately conservative; real deployments will want
///  a shorter retransmit timeout and bigger windows.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Payload bytes per DATA segment. Application data is split into chunks of this size, and
    ///  each chunk becomes one datagram on the wire.
    ///
    /// The wire format caps this at 1400 bytes to leave headroom for outer encapsulation
    ///  within a common 1500-byte MTU. Choosing it smaller wastes bandwidth on header
    ///  overhead; whether a bigger value than the default would survive the network is for
    ///  the application to know, not this library to guess.
    pub max_segment_payload: usize,

    /// Maximum number of unacknowledged segments the sender keeps in flight. Chunks submitted
    ///  beyond this bound are queued, not dropped.
    pub send_window_size: usize,

    /// How far ahead of the next expected sequence the receiver buffers out-of-order
    ///  arrivals. Segments beyond this are discarded unacknowledged and covered by the
    ///  sender's retransmission.
    pub receive_window_size: usize,

    /// Interval after which an unacknowledged segment is retransmitted, per segment,
    ///  indefinitely until acknowledged.
    pub retransmit_timeout: Duration,
}

impl Default for ArqConfig {
    fn default() -> ArqConfig {
        ArqConfig {
            max_segment_payload: MAX_PAYLOAD_LEN,
            send_window_size: 5,
            receive_window_size: 5,
            retransmit_timeout: Duration::from_secs(1),
        }
    }
}

impl ArqConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_segment_payload == 0 {
            bail!("segment payload size must be positive");
        }
        if self.max_segment_payload > MAX_PAYLOAD_LEN {
            bail!(
                "segment payload size {} exceeds the wire format limit of {}",
                self.max_segment_payload,
                MAX_PAYLOAD_LEN
            );
        }
        if self.send_window_size == 0 {
            bail!("send window must hold at least one segment");
        }
        if self.receive_window_size == 0 {
            bail!("receive window must hold at least one segment");
        }
        if self.receive_window_size > u32::MAX as usize {
            bail!("receive window of {} segments exceeds the sequence space", self.receive_window_size);
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be positive");
        }

        Ok(())
    }
}
