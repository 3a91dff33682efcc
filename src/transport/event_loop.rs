//! The single cooperatively scheduled loop (§4.6). No threads, no locks:
//! one `Endpoint` is driven against a `DatagramSocket` and a pair of
//! synchronous, non-blocking input/output callbacks.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Error;
use crate::packet::{FrameError, Packet};
use crate::socket::DatagramSocket;

use super::endpoint::Endpoint;

/// Upper bound on a single datagram; must be at least `HEADER_LEN +
/// config.max_payload`.
const RECV_BUF_LEN: usize = 2048;

/// How long to block in `wait_readable` before falling through to the rest
/// of the iteration, so the loop does not spin the CPU while idle (§4.6,
/// quality-of-implementation note).
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub struct EventLoop<S: DatagramSocket> {
    endpoint: Endpoint,
    socket: S,
}

impl<S: DatagramSocket> EventLoop<S> {
    pub fn new(endpoint: Endpoint, socket: S) -> Self {
        EventLoop { endpoint, socket }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Runs forever (per §4.6: shutdown is external). `input` is polled for
    /// up to `max_payload` bytes once established; `output` receives
    /// in-order payload bytes as they become deliverable.
    pub fn run(
        &mut self,
        mut input: impl FnMut(&mut [u8]) -> usize,
        mut output: impl FnMut(&[u8]),
    ) -> Result<(), Error> {
        loop {
            self.tick(&mut input, &mut output)?;
        }
    }

    /// A single loop iteration, exposed separately so tests (and an
    /// embedding application that wants its own scheduling) can step it
    /// directly instead of calling the infinite `run`.
    pub fn tick(
        &mut self,
        input: &mut impl FnMut(&mut [u8]) -> usize,
        output: &mut impl FnMut(&[u8]),
    ) -> Result<bool, Error> {
        self.socket.wait_readable(POLL_TIMEOUT);

        let now = Instant::now();
        let mut did_work = false;
        let mut received_payload = false;

        let mut recv_buf = [0u8; RECV_BUF_LEN];
        if let Some(n) = self.socket.try_recv(&mut recv_buf)? {
            did_work = true;
            match Packet::parse_and_verify(&recv_buf[..n]) {
                Ok(pkt) => {
                    let outcome = self.endpoint.on_packet(pkt, now, output);
                    received_payload = outcome.received_payload;
                    if outcome.fast_retransmit {
                        if let Some(bytes) = self.endpoint.encode_fast_retransmit() {
                            self.socket.send(&bytes)?;
                        }
                    }
                }
                Err(FrameError::Corrupt) => {
                    warn!("discarding corrupt datagram (parity check failed)");
                }
                Err(FrameError::Malformed) => {
                    warn!("discarding malformed datagram");
                }
            }
        }

        self.endpoint.drive_handshake(now);

        if self.endpoint.is_established() {
            let mut in_buf = vec![0u8; self.endpoint.max_payload() as usize];
            let n = input(&mut in_buf);
            if n > 0 {
                did_work = true;
                self.endpoint.enqueue_output(in_buf[..n].to_vec());
            }
        }

        if let Some(bytes) = self.endpoint.poll_timeout(now) {
            did_work = true;
            self.socket.send(&bytes)?;
        }

        if let Some(bytes) = self.endpoint.next_transmission(received_payload) {
            did_work = true;
            self.socket.send(&bytes)?;
        }

        Ok(did_work)
    }
}
