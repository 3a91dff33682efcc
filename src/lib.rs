//! A reliable, in-order, connection-oriented byte-stream transport layered
//! over an unreliable datagram service: three-message handshake, cumulative
//! ACKs, a receive-advertised flow-control window, duplicate-ACK fast
//! retransmit, and a fixed retransmission timeout. See `Config` for the
//! tunable wire constants and `transport::EventLoop` for the driver loop.

pub mod buffer;
pub mod config;
pub mod error;
pub mod packet;
pub mod socket;
pub mod transport;

pub use config::Config;
pub use error::Error;
pub use packet::Packet;
pub use socket::{DatagramSocket, UdpDatagramSocket};
pub use transport::{Endpoint, EventLoop, Phase, Role};
