use std::time::Duration;

/// Wire and timing constants shared by both peers. Both sides of a connection
/// must agree on these; nothing on the wire negotiates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes carried by a single packet.
    pub max_payload: u16,
    /// Window advertised to the peer (fixed; this endpoint never shrinks
    /// its own advertised window based on buffer occupancy).
    pub max_window: u16,
    /// Initial assumed peer window, used before any packet has been received.
    pub min_window: u16,
    /// Duplicate-ACK count that triggers a fast retransmit.
    pub dup_acks: u32,
    /// Retransmission timeout.
    pub rto: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_payload: 1012,
            max_window: 1012 * 4,
            min_window: 1012,
            dup_acks: 3,
            rto: Duration::from_micros(1_000_000),
        }
    }
}
