//! Dual-stack UDP socket.
//!
//! A [`DualStackSocket`] owns one OS socket handle and decides, per
//! operation, whether IPv4 traffic can go out natively or must be presented
//! over IPv6. The decision follows the socket's explicit family when it has
//! one, otherwise the probed local stack: on a v6-only (or dual) host with no
//! fixed family, IPv4 bind targets are translated to their IPv6 equivalents
//! and IPv4 send targets are synthesized into IPv6 (NAT64, then v4-mapped).

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::{self, IpAddress};
use crate::error::{Error, Result};
use crate::stack::StackCell;
use crate::synth;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

/// Datagram size and the floor for the OS send/receive buffers.
pub const UDP_BUFFER_MIN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unbound,
    Bound,
    Closed,
}

struct Inner {
    socket: Option<Socket>,
    state: State,
    bind_ip: String,
    bind_port: u16,
}

pub struct DualStackSocket {
    inner: RwLock<Inner>,
    /// The family fixed at creation; `None` defers to the probed stack.
    family: Option<Domain>,
    stack: StackCell,
}

impl DualStackSocket {
    /// Allocates a non-blocking socket using the process-wide stack probe.
    /// TCP is supported only as a thin pass-through ([`send`](Self::send) /
    /// [`recv`](Self::recv)); everything else here is UDP.
    pub fn create(prefer_tcp: bool, reuse: bool, family: Option<Domain>) -> Result<Self> {
        Self::create_with_stack(prefer_tcp, reuse, family, crate::stack::global())
    }

    /// Creates a UDP socket bound to `bind_ip:bind_port`. With no explicit
    /// family the bind text decides: IPv4 literals get an IPv4 socket,
    /// anything else IPv6.
    pub fn open(bind_ip: &str, bind_port: u16, family: Option<Domain>) -> Result<Self> {
        let family = family.or_else(|| {
            Some(if addr::is_ipv4_text(bind_ip) {
                Domain::IPV4
            } else {
                Domain::IPV6
            })
        });
        let socket = Self::create(false, false, family)?;
        socket.bind(bind_ip, bind_port)?;
        Ok(socket)
    }

    /// Allocates a non-blocking socket against an injected probe cell.
    ///
    /// With no explicit family the OS domain follows the probed stack: IPv6
    /// when the stack is v6-only or dual (the socket then accepts mapped v4
    /// traffic as well), IPv4 otherwise.
    pub fn create_with_stack(
        prefer_tcp: bool,
        reuse: bool,
        family: Option<Domain>,
        stack: StackCell,
    ) -> Result<Self> {
        let domain = match family {
            Some(domain) => domain,
            None => {
                let current = stack.current();
                if current.is_v6_only() || current.is_dual() {
                    Domain::IPV6
                } else {
                    Domain::IPV4
                }
            }
        };
        let socket = if prefer_tcp {
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
        } else {
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?
        };
        socket.set_nonblocking(true)?;
        #[cfg(target_vendor = "apple")]
        if let Err(e) = socket.set_nosigpipe(true) {
            log::warn!("set_nosigpipe failed: {e}");
        }
        if reuse {
            if let Err(e) = socket.set_reuse_address(true) {
                log::warn!("set_reuse_address failed: {e}");
            }
            #[cfg(unix)]
            if let Err(e) = socket.set_reuse_port(true) {
                log::warn!("set_reuse_port failed: {e}");
            }
        }
        if !prefer_tcp {
            if let Err(e) = socket.set_broadcast(true) {
                log::warn!("set_broadcast failed: {e}");
            }
        }
        if domain == Domain::IPV6 {
            // Dual operation wants v4-mapped peers on the same handle.
            if let Err(e) = socket.set_only_v6(false) {
                log::warn!("set_only_v6 failed: {e}");
            }
        }
        log::info!(
            "udp socket created, family {}",
            if domain == Domain::IPV6 { "inet6" } else { "inet" }
        );
        Ok(Self {
            inner: RwLock::new(Inner {
                socket: Some(socket),
                state: State::Unbound,
                bind_ip: String::new(),
                bind_port: 0,
            }),
            family,
            stack,
        })
    }

    /// Whether IPv4 traffic must be presented over IPv6: the family is
    /// explicitly IPv6, or there is no fixed family and the local stack is
    /// v6-only or dual.
    fn requires_v4_mapping(&self) -> bool {
        match self.family {
            Some(domain) => domain == Domain::IPV6,
            None => {
                let stack = self.stack.current();
                stack.is_v6_only() || stack.is_dual()
            }
        }
    }

    fn resolve_bind_target(&self, ip: &str, port: u16) -> Result<SocketAddr> {
        if addr::is_ipv4_text(ip) {
            let v4 = addr::parse_ipv4(ip)?;
            if self.requires_v4_mapping() {
                // Only the wildcard and loopback have IPv6 equivalents.
                let ip6 = if v4 == [0, 0, 0, 0] {
                    Ipv6Addr::UNSPECIFIED
                } else if v4 == [127, 0, 0, 1] {
                    Ipv6Addr::LOCALHOST
                } else {
                    log::error!("cannot bind {ip}:{port} on an ipv6-only env");
                    return Err(Error::UnmappableBind {
                        ip: ip.to_string(),
                        port,
                    });
                };
                Ok(SocketAddr::V6(SocketAddrV6::new(ip6, port, 0, 0)))
            } else {
                Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(v4), port)))
            }
        } else {
            let bytes = addr::parse_ipv6(ip)?;
            let scope = addr::zone_index(ip);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(bytes),
                port,
                0,
                scope,
            )))
        }
    }

    /// Binds the socket, translating IPv4 targets onto IPv6 when mapping is
    /// required, then raises undersized OS buffers to [`UDP_BUFFER_MIN`].
    pub fn bind(&self, ip: &str, port: u16) -> Result<()> {
        let target = self.resolve_bind_target(ip, port)?;
        let mut inner = self.inner.write();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        if inner.state != State::Unbound {
            return Err(Error::AlreadyBound);
        }
        if let Err(e) = socket.bind(&SockAddr::from(target)) {
            log::error!("udp bind {ip}:{port} failed: {e}");
            return Err(Error::Io(e));
        }
        ensure_buffer_floor(socket);
        let (bind_ip, bind_port) = local_addr_of(socket)?;
        log::info!("udp socket bound to {bind_ip}:{bind_port}");
        inner.bind_ip = bind_ip;
        inner.bind_port = bind_port;
        inner.state = State::Bound;
        Ok(())
    }

    /// Sends a datagram. IPv4 destinations are synthesized into IPv6 (NAT64
    /// first, v4-mapped fallback) when mapping is required.
    pub fn send_to(&self, buf: &[u8], ip: &str, port: u16) -> Result<usize> {
        let target: SocketAddr = if addr::is_ipv4_text(ip) {
            if self.requires_v4_mapping() {
                let synthesized = synth::synthesize(ip)?;
                let bytes = addr::parse_ipv6(&synthesized)?;
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(bytes), port, 0, 0))
            } else {
                match IpAddress::from_text(ip, port).to_socket_addr() {
                    Some(target) => target,
                    None => return Err(Error::InvalidAddress(ip.to_string())),
                }
            }
        } else {
            let bytes = addr::parse_ipv6(ip)?;
            let scope = addr::zone_index(ip);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(bytes), port, 0, scope))
        };
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        Ok(socket.send_to(buf, &SockAddr::from(target))?)
    }

    /// Receives one datagram from either family, rendering the source in
    /// textual form.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String, u16)> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        // recv only ever writes initialized bytes into the window it reports.
        let uninit =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (len, from) = socket.recv_from(uninit)?;
        let (from_ip, from_port) = render_source(&from)?;
        Ok((len, from_ip, from_port))
    }

    /// Thin pass-through for connected (TCP) sockets.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        Ok(socket.send(buf)?)
    }

    /// Thin pass-through for connected (TCP) sockets.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        let uninit =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        Ok(socket.recv(uninit)?)
    }

    /// Local address as text, available once bound.
    pub fn local_addr_text(&self) -> Result<(String, u16)> {
        let inner = self.inner.read();
        if inner.state != State::Bound {
            return Err(Error::NotBound);
        }
        Ok((inner.bind_ip.clone(), inner.bind_port))
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        Ok(socket.set_send_buffer_size(size)?)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        Ok(socket.set_recv_buffer_size(size)?)
    }

    pub fn send_buffer_size(&self) -> Result<usize> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        Ok(socket.send_buffer_size()?)
    }

    pub fn recv_buffer_size(&self) -> Result<usize> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        Ok(socket.recv_buffer_size()?)
    }

    /// Waits up to `timeout_ms` for the socket to become readable.
    pub(crate) fn wait_readable(&self, timeout_ms: i32) -> Result<bool> {
        let inner = self.inner.read();
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        #[cfg(unix)]
        let readable = unix::wait_readable(socket.as_raw_fd(), timeout_ms)?;
        #[cfg(windows)]
        let readable = windows::wait_readable(socket.as_raw_socket(), timeout_ms)?;
        Ok(readable)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().state == State::Closed
    }

    /// Releases the OS handle. Safe to call more than once; only the first
    /// call closes anything.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.socket.take().is_some() {
            inner.state = State::Closed;
            log::info!("udp socket closed");
        }
    }
}

fn ensure_buffer_floor(socket: &Socket) {
    match socket.send_buffer_size() {
        Ok(size) if size < UDP_BUFFER_MIN => {
            if let Err(e) = socket.set_send_buffer_size(UDP_BUFFER_MIN) {
                log::warn!("raising send buffer failed: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("send buffer size query failed: {e}"),
    }
    match socket.recv_buffer_size() {
        Ok(size) if size < UDP_BUFFER_MIN => {
            if let Err(e) = socket.set_recv_buffer_size(UDP_BUFFER_MIN) {
                log::warn!("raising recv buffer failed: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("recv buffer size query failed: {e}"),
    }
}

fn local_addr_of(socket: &Socket) -> Result<(String, u16)> {
    let local = socket.local_addr()?;
    render_source(&local)
}

fn render_source(sock_addr: &SockAddr) -> Result<(String, u16)> {
    match sock_addr.as_socket() {
        Some(SocketAddr::V4(v4)) => Ok((addr::format_ipv4(&v4.ip().octets()), v4.port())),
        Some(SocketAddr::V6(v6)) => Ok((addr::format_ipv6(&v6.ip().octets()), v6.port())),
        None => Err(Error::InvalidAddress("unknown address family".into())),
    }
}

impl Drop for DualStackSocket {
    fn drop(&mut self) {
        self.close();
    }
}
