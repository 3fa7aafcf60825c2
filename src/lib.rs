//! A sliding-window ARQ protocol providing reliable, in-order delivery of byte chunks over an
//!  unreliable datagram transport.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *chunks* of bytes: the sender splits application
//!   data into segments of at most [`segment::MAX_PAYLOAD_LEN`] bytes, and the receiver hands
//!   each segment's payload to the application as one chunk, in the order it was sent
//! * Reliability through timeouts and retransmission: every DATA segment stays in the sender's
//!   outstanding window, guarded by its own retransmission timer, until it is covered by a
//!   cumulative acknowledgment
//! * A fixed send window bounds the number of unacknowledged segments in flight; submitting
//!   more data than the window allows queues the excess instead of dropping it, so the
//!   application never loses data to backpressure
//! * The receiver buffers out-of-order arrivals within its receive window and dispatches only
//!   the contiguous prefix, so the application observes exactly-once, in-order delivery with
//!   added latency under loss - and no failure mode short of losing the transport itself
//! * The underlying transport is a black box with datagram semantics: it may drop, duplicate
//!   or reorder; all of that is absorbed by this layer
//!
//! Explicitly out of scope: congestion control, flow control beyond the fixed window, stream
//!  multiplexing, encryption, and sequence number wraparound (the u32 sequence space is far
//!  larger than any transfer this protocol is used for, and `send` fails rather than wrap).
//!
//! ## Wire format
//!
//! Each datagram carries exactly one segment - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:    kind tag (u8): 'D' (0x44) = DATA, 'A' (0x41) = ACK
//! 1..4: sequence number (u32 BE)
//! 5..:  payload (0..=1400 bytes); ACK segments carry no payload
//! ```
//!
//! The payload limit of 1400 bytes leaves headroom for outer encapsulation (IP + UDP and
//!  whatever the network adds) within a common 1500-byte MTU.
//!
//! ## Acknowledgment semantics
//!
//! Acknowledgments are strictly cumulative: an ACK with sequence `N` means "every segment with
//!  sequence `<= N` has been received in order". The receiver sends one ACK per accepted DATA
//!  segment, always carrying the highest in-order sequence; out-of-order arrivals ahead of the
//!  contiguous prefix are buffered but not acknowledged until the gap is filled. The sender
//!  treats an ACK for `N` as license to purge every outstanding segment `<= N`. Duplicates
//!  below the receive window are re-acknowledged (their original ACK may have been lost);
//!  segments beyond the window are dropped silently and covered by the sender's timers.

pub mod config;
pub mod error;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod transport;
