//! # rtc-udp-core - Dual-Stack UDP Socket Layer
//!
//! `rtc-udp-core` provides the transport floor for real-time media sessions:
//! textual/binary address conversion, IPv4/IPv6 interoperability synthesis
//! (NAT64 and v4-mapped addressing), runtime detection of which IP stacks the
//! local host can actually use, a socket abstraction that transparently maps
//! IPv4 traffic onto IPv6 sockets when required, and a background worker
//! thread that drains a UDP socket into a consumer sink.
//!
//! ## Architecture
//!
//! - [`addr`] - hand-written text⇄binary address conversion and validation
//! - [`stack`] - cached detection of locally usable IP stacks
//! - [`synth`] - NAT64 / v4-mapped IPv6 synthesis for IPv4 destinations
//! - [`socket`] - the dual-stack UDP socket
//! - [`worker`] - the polling receive worker and its sink contract
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bytes::BytesMut;
//! use rtc_udp_core::socket::DualStackSocket;
//! use rtc_udp_core::worker::{UdpSink, UdpWorker};
//!
//! struct Printer;
//!
//! impl UdpSink for Printer {
//!     fn on_receive(&self, payload: BytesMut, from_ip: &str, from_port: u16) {
//!         println!("{} bytes from {}:{}", payload.len(), from_ip, from_port);
//!     }
//!     fn on_tick(&self) {}
//!     fn check_timeout(&self) -> bool {
//!         false
//!     }
//! }
//!
//! # fn main() -> rtc_udp_core::error::Result<()> {
//! let socket = Arc::new(DualStackSocket::create(false, false, None)?);
//! socket.bind("0.0.0.0", 0)?;
//! let worker = UdpWorker::new(socket, Arc::new(Printer));
//! worker.start()?;
//! worker.send_to(b"hello", "203.0.113.7", 9000)?;
//! worker.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! All socket I/O of a worker happens on its dedicated thread; `start`/`stop`
//! may be called from anywhere and serialize internally. The stack-probe
//! verdict is process-wide and written idempotently by racing first-callers.

pub mod addr;
pub mod error;
pub mod socket;
pub mod stack;
pub mod synth;
pub mod worker;
