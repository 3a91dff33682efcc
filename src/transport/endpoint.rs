//! Per-connection state machine: handshake, cumulative-ACK reliability
//! engine, flow control, and the ordered send/receive buffers. Owns no
//! socket and no thread; the event loop (`event_loop.rs`) drives it and
//! performs the actual I/O.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tracing::{debug, trace, warn};

use crate::buffer::{wrapping_le, wrapping_lt, OrderedBuffer, Sequenced};
use crate::config::Config;
use crate::packet::{flags, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    SynSent,
    SynRcvd,
    Established,
}

#[derive(Debug, Clone)]
struct SendEntry {
    seq: u16,
    /// Flags baked in at creation time (SYN for the handshake entries);
    /// the ACK bit is layered on dynamically at transmit time.
    base_flags: u16,
    payload: Vec<u8>,
    transmitted: bool,
}

impl Sequenced for SendEntry {
    fn seq(&self) -> u16 {
        self.seq
    }
    fn byte_len(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone)]
struct RecvEntry {
    seq: u16,
    payload: Vec<u8>,
}

impl Sequenced for RecvEntry {
    fn seq(&self) -> u16 {
        self.seq
    }
    fn byte_len(&self) -> usize {
        self.payload.len()
    }
}

/// What happened while processing one inbound packet, reported back to the
/// event loop so it knows whether to emit a dedicated ACK and/or an
/// immediate fast retransmit.
pub struct PacketOutcome {
    pub received_payload: bool,
    pub fast_retransmit: bool,
}

pub struct Endpoint {
    role: Role,
    phase: Phase,
    config: Config,
    rng: StdRng,

    send_seq: u16,
    recv_ack: u16,
    recv_ack_valid: bool,

    last_ack_received: u16,
    dup_ack_count: u32,
    bytes_in_flight: usize,
    peer_window: u16,
    rto_deadline: Option<Instant>,

    send_buffer: OrderedBuffer<SendEntry>,
    recv_buffer: OrderedBuffer<RecvEntry>,
}

impl Endpoint {
    pub fn new(role: Role, config: Config) -> Self {
        let seed = seed_for(role);
        Endpoint {
            role,
            phase: Phase::Closed,
            peer_window: config.min_window,
            config,
            rng: StdRng::seed_from_u64(seed),
            send_seq: 0,
            recv_ack: 0,
            recv_ack_valid: false,
            last_ack_received: 0,
            dup_ack_count: 0,
            bytes_in_flight: 0,
            rto_deadline: None,
            send_buffer: OrderedBuffer::new(),
            recv_buffer: OrderedBuffer::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    pub fn max_payload(&self) -> u16 {
        self.config.max_payload
    }

    /// One-time kick for the active opener. A no-op for the server, and a
    /// no-op once the client has already started (the SYN then lives in
    /// the send buffer and is retried by the ordinary RTO path).
    pub fn drive_handshake(&mut self, now: Instant) {
        if self.role == Role::Client && self.phase == Phase::Closed {
            let initial_seq: u16 = self.rng.gen_range(1..=1000);
            self.send_seq = initial_seq;
            self.last_ack_received = initial_seq;

            self.send_buffer.insert(SendEntry {
                seq: initial_seq,
                base_flags: flags::SYN,
                payload: Vec::new(),
                transmitted: false,
            });
            self.send_seq = self.send_seq.wrapping_add(1);
            self.rto_deadline = Some(now + self.config.rto);
            self.phase = Phase::SynSent;
            debug!(role = ?self.role, seq = initial_seq, "handshake started, SYN queued");
        }
    }

    /// Processes one checksum-verified inbound packet. `output` receives
    /// in-order payload bytes as they become deliverable.
    pub fn on_packet(
        &mut self,
        pkt: Packet,
        now: Instant,
        output: &mut dyn FnMut(&[u8]),
    ) -> PacketOutcome {
        self.peer_window = pkt.win;

        let mut fast_retransmit = false;
        if pkt.is_ack() {
            fast_retransmit = self.process_ack(pkt.ack, now);
        }

        self.try_handshake_transition(&pkt, output);

        let received_payload = pkt.len() > 0;
        if self.phase == Phase::Established
            && received_payload
            && wrapping_le(self.recv_ack, pkt.seq)
        {
            self.recv_buffer.insert(RecvEntry {
                seq: pkt.seq,
                payload: pkt.payload.clone(),
            });
            let next = self.recv_buffer.drain_contiguous(self.recv_ack, |entry| {
                output(&entry.payload);
            });
            if next != self.recv_ack {
                trace!(role = ?self.role, from = self.recv_ack, to = next, "delivered contiguous prefix");
            }
            self.recv_ack = next;
        }

        PacketOutcome {
            received_payload,
            fast_retransmit,
        }
    }

    fn try_handshake_transition(&mut self, pkt: &Packet, output: &mut dyn FnMut(&[u8])) {
        match (self.role, self.phase) {
            (Role::Client, Phase::SynSent) if pkt.is_syn() && pkt.is_ack() => {
                self.recv_ack = pkt.seq.wrapping_add(1);
                self.recv_ack_valid = true;
                if !pkt.payload.is_empty() {
                    output(&pkt.payload);
                }

                let ack_seq = self.send_seq;
                self.send_buffer.insert(SendEntry {
                    seq: ack_seq,
                    base_flags: flags::ACK,
                    payload: Vec::new(),
                    transmitted: false,
                });
                self.send_seq = self.send_seq.wrapping_add(1);
                self.phase = Phase::Established;
                debug!(role = ?self.role, "handshake complete");
            }
            (Role::Server, Phase::Closed) if pkt.is_syn() => {
                let initial_seq: u16 = self.rng.gen_range(1..=1000);
                self.send_seq = initial_seq;
                self.last_ack_received = initial_seq;

                self.recv_ack = pkt.seq.wrapping_add(1);
                self.recv_ack_valid = true;
                if !pkt.payload.is_empty() {
                    output(&pkt.payload);
                }

                self.send_buffer.insert(SendEntry {
                    seq: initial_seq,
                    base_flags: flags::SYN | flags::ACK,
                    payload: Vec::new(),
                    transmitted: false,
                });
                self.send_seq = self.send_seq.wrapping_add(1);
                self.rto_deadline = Some(Instant::now() + self.config.rto);
                self.phase = Phase::SynRcvd;
                debug!(role = ?self.role, seq = initial_seq, "SYN received, SYN+ACK queued");
            }
            (Role::Server, Phase::SynRcvd) if pkt.seq == self.recv_ack || pkt.seq == 0 => {
                self.recv_ack = pkt.seq.wrapping_add(1);
                if !pkt.payload.is_empty() {
                    output(&pkt.payload);
                }
                self.phase = Phase::Established;
                debug!(role = ?self.role, "handshake complete");
            }
            _ => {}
        }
    }

    /// Cumulative-ACK bookkeeping (§4.4). Returns whether a fast
    /// retransmit was triggered.
    fn process_ack(&mut self, cum_ack: u16, now: Instant) -> bool {
        if cum_ack == self.last_ack_received {
            self.dup_ack_count += 1;
            if self.dup_ack_count >= self.config.dup_acks && !self.send_buffer.is_empty() {
                warn!(role = ?self.role, ack = cum_ack, "duplicate ACK threshold reached, fast retransmit");
                return true;
            }
        } else if wrapping_lt(self.last_ack_received, cum_ack) {
            let released = self.send_buffer.remove_below(cum_ack);
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(released);
            self.last_ack_received = cum_ack;
            self.dup_ack_count = 0;
            self.rto_deadline = if self.send_buffer.is_empty() {
                None
            } else {
                Some(now + self.config.rto)
            };
        }
        false
    }

    /// Queues up to `config.max_payload` bytes of application data as a new
    /// send-buffer entry. Truncates silently; the event loop is expected to
    /// only ever hand this at most `max_payload` bytes (§4.6 step 3).
    pub fn enqueue_output(&mut self, mut data: Vec<u8>) {
        let max = self.config.max_payload as usize;
        if data.len() > max {
            data.truncate(max);
        }
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_buffer.insert(SendEntry {
            seq,
            base_flags: 0,
            payload: data,
            transmitted: false,
        });
    }

    /// §4.4 timeout path: if the RTO has fired, returns the wire bytes of
    /// the send-buffer head and re-arms the timer.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Vec<u8>> {
        let deadline = self.rto_deadline?;
        if now < deadline || self.send_buffer.is_empty() {
            return None;
        }
        self.rto_deadline = Some(now + self.config.rto);
        let bytes = self.encode_head(true);
        if bytes.is_some() {
            let seq = self.send_buffer.head().map(|e| e.seq);
            warn!(role = ?self.role, seq = ?seq, "RTO fired, retransmitting head of send buffer");
        }
        bytes
    }

    /// Encodes the send-buffer head for a fast or timeout retransmit.
    pub fn encode_fast_retransmit(&self) -> Option<Vec<u8>> {
        self.encode_head(true)
    }

    fn encode_head(&self, include_ack: bool) -> Option<Vec<u8>> {
        let entry = self.send_buffer.head()?;
        Some(self.encode_entry(entry, include_ack && self.recv_ack_valid))
    }

    fn encode_entry(&self, entry: &SendEntry, include_ack: bool) -> Vec<u8> {
        let mut flag_bits = entry.base_flags;
        if include_ack {
            flag_bits |= flags::ACK;
        }
        let pkt = Packet {
            seq: entry.seq,
            ack: self.recv_ack,
            win: self.config.max_window,
            flags: flag_bits,
            payload: entry.payload.clone(),
        };
        pkt.encode(self.config.max_payload)
            .expect("send-buffer payload is always bounded by max_payload")
    }

    /// §4.6 step 5: picks the lowest-sequence untransmitted send-buffer
    /// entry and, if the flow controller admits it, returns its wire bytes
    /// (marking it transmitted and counting its bytes in flight). If
    /// nothing is eligible but a payload arrived this iteration, returns a
    /// dedicated pure-ACK instead.
    pub fn next_transmission(&mut self, received_payload: bool) -> Option<Vec<u8>> {
        let peer_window = self.peer_window;
        let bytes_in_flight = self.bytes_in_flight;

        let candidate = self
            .send_buffer
            .iter()
            .find(|e| !e.transmitted)
            .map(|e| (e.seq, e.payload.len()));

        if let Some((seq, len)) = candidate {
            if bytes_in_flight + len <= peer_window as usize {
                let bytes = {
                    let entry = self
                        .send_buffer
                        .iter()
                        .find(|e| e.seq == seq)
                        .expect("candidate seq still present");
                    self.encode_entry(entry, received_payload)
                };
                if let Some(entry) = self.send_buffer.iter_mut().find(|e| e.seq == seq) {
                    entry.transmitted = true;
                }
                self.bytes_in_flight += len;
                if self.rto_deadline.is_none() {
                    self.rto_deadline = Some(Instant::now() + self.config.rto);
                }
                trace!(role = ?self.role, seq, "transmitted send-buffer entry");
                return Some(bytes);
            }
        }

        if received_payload {
            let pkt = Packet {
                seq: 0,
                ack: self.recv_ack,
                win: self.config.max_window,
                flags: flags::ACK,
                payload: Vec::new(),
            };
            trace!(role = ?self.role, ack = self.recv_ack, "emitting dedicated ACK");
            return Some(
                pkt.encode(self.config.max_payload)
                    .expect("empty payload always fits"),
            );
        }

        None
    }
}

/// XORs a coarse time-based seed with a role discriminant so co-located
/// client and server do not pick identical initial sequence numbers.
fn seed_for(role: Role) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let discriminant = match role {
        Role::Client => 0u64,
        Role::Server => 1u64,
    };
    now ^ discriminant
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> Config {
        Config {
            rto: Duration::from_millis(20),
            ..Config::default()
        }
    }

    #[test]
    fn client_starts_handshake_with_syn() {
        let mut ep = Endpoint::new(Role::Client, fast_config());
        ep.drive_handshake(Instant::now());
        assert_eq!(ep.phase(), Phase::SynSent);
        assert!(!ep.send_buffer.is_empty());
        assert_eq!(ep.send_buffer.head().unwrap().base_flags, flags::SYN);
    }

    #[test]
    fn server_responds_to_syn_and_reaches_syn_rcvd() {
        let mut ep = Endpoint::new(Role::Server, fast_config());
        let syn = Packet {
            seq: 100,
            ack: 0,
            win: 1012,
            flags: flags::SYN,
            payload: Vec::new(),
        };
        let mut out = Vec::new();
        let outcome = ep.on_packet(syn, Instant::now(), &mut |b| out.extend_from_slice(b));
        assert_eq!(ep.phase(), Phase::SynRcvd);
        assert_eq!(ep.recv_ack, 101);
        assert!(!outcome.received_payload);
    }

    #[test]
    fn server_accepts_seq_zero_handshake_ack() {
        let mut ep = Endpoint::new(Role::Server, fast_config());
        let mut sink = |_: &[u8]| {};
        let syn = Packet {
            seq: 5,
            ack: 0,
            win: 1012,
            flags: flags::SYN,
            payload: Vec::new(),
        };
        ep.on_packet(syn, Instant::now(), &mut sink);
        assert_eq!(ep.phase(), Phase::SynRcvd);

        let handshake_ack = Packet {
            seq: 0,
            ack: ep.send_seq.wrapping_sub(1),
            win: 1012,
            flags: flags::ACK,
            payload: Vec::new(),
        };
        ep.on_packet(handshake_ack, Instant::now(), &mut sink);
        assert_eq!(ep.phase(), Phase::Established);
    }

    #[test]
    fn fast_retransmit_after_three_duplicate_acks() {
        let mut ep = Endpoint::new(Role::Client, fast_config());
        ep.phase = Phase::Established;
        ep.enqueue_output(b"data".to_vec());
        ep.bytes_in_flight = 4;
        let mut sink = |_: &[u8]| {};
        let now = Instant::now();
        let mut fired = false;
        for _ in 0..3 {
            let ack = Packet {
                seq: 0,
                ack: ep.last_ack_received,
                win: 1012,
                flags: flags::ACK,
                payload: Vec::new(),
            };
            let outcome = ep.on_packet(ack, now, &mut sink);
            fired = outcome.fast_retransmit;
        }
        assert!(fired);
    }

    #[test]
    fn flow_control_blocks_over_window() {
        let mut ep = Endpoint::new(Role::Client, fast_config());
        ep.phase = Phase::Established;
        ep.peer_window = 2;
        ep.enqueue_output(b"abcd".to_vec());
        assert!(ep.next_transmission(false).is_none());
    }
}
