//! Detection of which IP stacks are usable on the local host.
//!
//! A UDP `connect` to a routable public address makes the OS pick a local
//! source address without sending a single packet; a family whose probe
//! comes back with a local address is considered usable. The verdict is
//! cached in a [`StackCell`] so the (cheap but syscall-heavy) probe runs at
//! most once per process in the common case.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::atomic::AtomicCell;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Bitmask over the usable address families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpStack(u8);

impl IpStack {
    pub const NONE: IpStack = IpStack(0b00);
    pub const V4: IpStack = IpStack(0b01);
    pub const V6: IpStack = IpStack(0b10);
    pub const DUAL: IpStack = IpStack(0b11);

    pub fn contains(self, other: IpStack) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
    pub fn is_v4_only(self) -> bool {
        self == IpStack::V4
    }
    pub fn is_v6_only(self) -> bool {
        self == IpStack::V6
    }
    pub fn is_dual(self) -> bool {
        self == IpStack::DUAL
    }
}

impl BitOr for IpStack {
    type Output = IpStack;
    fn bitor(self, rhs: IpStack) -> IpStack {
        IpStack(self.0 | rhs.0)
    }
}

impl BitOrAssign for IpStack {
    fn bitor_assign(&mut self, rhs: IpStack) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for IpStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            IpStack::V4 => "ipv4",
            IpStack::V6 => "ipv6",
            IpStack::DUAL => "dual",
            _ => "none",
        };
        f.write_str(s)
    }
}

// Routable but never contacted: a UDP connect() assigns a route and a local
// source address without emitting traffic.
const PROBE_V4: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 80));
const PROBE_V6: SocketAddr = SocketAddr::V6(SocketAddrV6::new(
    Ipv6Addr::new(0x2000, 0, 0, 0, 0, 0, 0, 0),
    80,
    0,
    0,
));
const MAX_EINTR_RETRY: u32 = 10;

fn probe_family(domain: Domain, target: SocketAddr) -> bool {
    let socket = match Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    let target = SockAddr::from(target);
    let mut attempts = 0u32;
    loop {
        match socket.connect(&target) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                attempts += 1;
                if attempts >= MAX_EINTR_RETRY {
                    log::error!("stack probe connect kept getting interrupted, giving up");
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    // The transient socket closes on drop regardless of the outcome.
    match socket.local_addr() {
        Ok(_) => true,
        Err(e) => {
            log::error!("stack probe getsockname failed: {e}");
            false
        }
    }
}

/// Probes both families and returns the fresh verdict without touching any
/// cache.
pub fn detect() -> IpStack {
    let have_v4 = probe_family(Domain::IPV4, PROBE_V4);
    let have_v6 = probe_family(Domain::IPV6, PROBE_V6);
    let mut stack = IpStack::NONE;
    if have_v4 {
        stack |= IpStack::V4;
    }
    if have_v6 {
        stack |= IpStack::V6;
    }
    log::info!("local ip stack detect: have_v4 {have_v4}, have_v6 {have_v6}");
    stack
}

/// A shareable probe-result cell.
///
/// The process-wide default lives behind [`global`]; tests and embedders can
/// preload their own cell to simulate a v4-only or v6-only host. Racing
/// first-callers may each run the probe; any of their (idempotent) writes is
/// an acceptable outcome, so no lock is taken.
#[derive(Clone, Default)]
pub struct StackCell {
    cell: Arc<AtomicCell<IpStack>>,
}

impl StackCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell preloaded with a fixed verdict; `current` will never probe.
    pub fn preset(stack: IpStack) -> Self {
        let cell = Self::new();
        cell.cell.store(stack);
        cell
    }

    /// The cached verdict when concrete, otherwise a fresh [`detect`] whose
    /// result is cached for the rest of the process.
    pub fn current(&self) -> IpStack {
        let cached = self.cell.load();
        if !cached.is_none() {
            return cached;
        }
        let stack = detect();
        self.cell.store(stack);
        stack
    }

    /// The raw cached value, `NONE` when no probe has landed yet.
    pub fn get(&self) -> IpStack {
        self.cell.load()
    }
}

static GLOBAL_STACK: OnceLock<StackCell> = OnceLock::new();

/// The process-wide probe cell used when no explicit cell is injected.
pub fn global() -> StackCell {
    GLOBAL_STACK.get_or_init(StackCell::new).clone()
}
