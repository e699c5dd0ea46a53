//! IPv4 → IPv6 address synthesis for v6-only paths.
//!
//! NAT64 synthesis goes through the system resolver in any-family mode: on a
//! host behind DNS64/NAT64 the resolver hands back a translated IPv6 record
//! for an IPv4 literal, and the absence of such infrastructure is an
//! expected, non-fatal failure. The deterministic fallback is the v4-mapped
//! `::FFFF:a.b.c.d` form.

use std::ffi::CString;
use std::io;
use std::net::SocketAddr;

use crate::addr::{self, INET6_ADDRSTRLEN};
use crate::error::{Error, Result};

// Any fixed service works; the resolver only needs one to produce socket
// addresses. Numeric to stay independent of /etc/services.
const RESOLVE_SERVICE: &str = "80";

const V4_MAPPED_PREFIX: &str = "::FFFF:";

/// Synthesizes an IPv6 text form for `ipv4` via NAT64/DNS64 lookup.
pub fn nat64(ipv4: &str) -> Result<String> {
    if !addr::is_ipv4_text(ipv4) {
        return Err(Error::InvalidIpv4(ipv4.to_string()));
    }
    let candidates = resolve_any_family(ipv4).map_err(|e| {
        log::debug!("nat64 getaddrinfo failed for {ipv4}: {e}");
        Error::SynthesisFailed(ipv4.to_string())
    })?;
    for candidate in candidates {
        if let SocketAddr::V6(v6) = candidate {
            let text = addr::format_ipv6(&v6.ip().octets());
            log::info!("nat64 synthesized an ipv6: {ipv4} -> {text}");
            return Ok(text);
        }
    }
    Err(Error::SynthesisFailed(ipv4.to_string()))
}

// std's `ToSocketAddrs` parses IP literals itself and never consults the
// platform resolver for them, but NAT64 synthesis only happens inside the
// resolver library (a DNS64-aware getaddrinfo hands back a translated AAAA
// even for an IPv4 literal). So this goes to getaddrinfo directly, unspecified
// family, AI_V4MAPPED | AI_ADDRCONFIG.
#[cfg(unix)]
fn resolve_any_family(host: &str) -> io::Result<Vec<SocketAddr>> {
    use std::ffi::CStr;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    let node = nul_free(host)?;
    let service = nul_free(RESOLVE_SERVICE)?;
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_V4MAPPED | libc::AI_ADDRCONFIG;
    let mut list: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut list) };
    if rc != 0 {
        let detail = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
        return Err(io::Error::new(
            io::ErrorKind::Other,
            detail.to_string_lossy().into_owned(),
        ));
    }
    let mut out = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if !entry.ai_addr.is_null() {
            match entry.ai_family {
                libc::AF_INET => {
                    let sin = unsafe { &*(entry.ai_addr as *const libc::sockaddr_in) };
                    out.push(SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                        u16::from_be(sin.sin_port),
                    )));
                }
                libc::AF_INET6 => {
                    let sin6 = unsafe { &*(entry.ai_addr as *const libc::sockaddr_in6) };
                    out.push(SocketAddr::V6(SocketAddrV6::new(
                        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                        u16::from_be(sin6.sin6_port),
                        0,
                        sin6.sin6_scope_id,
                    )));
                }
                _ => {}
            }
        }
        cursor = entry.ai_next;
    }
    unsafe { libc::freeaddrinfo(list) };
    Ok(out)
}

#[cfg(windows)]
fn resolve_any_family(host: &str) -> io::Result<Vec<SocketAddr>> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    use windows_sys::Win32::Networking::WinSock::{
        freeaddrinfo, getaddrinfo, ADDRINFOA, AF_INET, AF_INET6, AF_UNSPEC, AI_ADDRCONFIG,
        AI_V4MAPPED, SOCKADDR_IN, SOCKADDR_IN6, SOCK_STREAM,
    };

    let node = nul_free(host)?;
    let service = nul_free(RESOLVE_SERVICE)?;
    let mut hints: ADDRINFOA = unsafe { std::mem::zeroed() };
    hints.ai_family = AF_UNSPEC as i32;
    hints.ai_socktype = SOCK_STREAM as i32;
    hints.ai_flags = (AI_V4MAPPED | AI_ADDRCONFIG) as i32;
    let mut list: *mut ADDRINFOA = std::ptr::null_mut();
    let rc = unsafe {
        getaddrinfo(
            node.as_ptr() as *const u8,
            service.as_ptr() as *const u8,
            &hints,
            &mut list,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let mut out = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if !entry.ai_addr.is_null() {
            match entry.ai_family {
                f if f == AF_INET as i32 => {
                    let sin = unsafe { &*(entry.ai_addr as *const SOCKADDR_IN) };
                    out.push(SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::from(u32::from_be(unsafe { sin.sin_addr.S_un.S_addr })),
                        u16::from_be(sin.sin_port),
                    )));
                }
                f if f == AF_INET6 as i32 => {
                    let sin6 = unsafe { &*(entry.ai_addr as *const SOCKADDR_IN6) };
                    out.push(SocketAddr::V6(SocketAddrV6::new(
                        Ipv6Addr::from(unsafe { sin6.sin6_addr.u.Byte }),
                        u16::from_be(sin6.sin6_port),
                        0,
                        unsafe { sin6.Anonymous.sin6_scope_id },
                    )));
                }
                _ => {}
            }
        }
        cursor = entry.ai_next;
    }
    unsafe { freeaddrinfo(list) };
    Ok(out)
}

fn nul_free(text: &str) -> io::Result<CString> {
    CString::new(text).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in host"))
}

/// Writes the v4-mapped form of `ipv4` into `dst`, returning the written
/// length. Mirrors the fixed-buffer contract of the C API: `dst` must hold
/// at least [`INET6_ADDRSTRLEN`] bytes.
pub fn v4_mapped_into(ipv4: &str, dst: &mut [u8]) -> Result<usize> {
    if !addr::is_ipv4_text(ipv4) {
        return Err(Error::InvalidIpv4(ipv4.to_string()));
    }
    let required = V4_MAPPED_PREFIX.len() + ipv4.len() + 1;
    if dst.len() < INET6_ADDRSTRLEN || dst.len() < required {
        return Err(Error::Overflow {
            cap: dst.len(),
            required: required.max(INET6_ADDRSTRLEN),
        });
    }
    dst[..V4_MAPPED_PREFIX.len()].copy_from_slice(V4_MAPPED_PREFIX.as_bytes());
    dst[V4_MAPPED_PREFIX.len()..V4_MAPPED_PREFIX.len() + ipv4.len()]
        .copy_from_slice(ipv4.as_bytes());
    Ok(V4_MAPPED_PREFIX.len() + ipv4.len())
}

/// The v4-mapped form of `ipv4` as an owned string.
pub fn v4_mapped(ipv4: &str) -> Result<String> {
    let mut buf = [0u8; INET6_ADDRSTRLEN];
    let len = v4_mapped_into(ipv4, &mut buf)?;
    // The buffer holds the ASCII prefix plus validated IPv4 text.
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// NAT64 first, v4-mapped fallback. Only when both fail is the address
/// unusable on an IPv6-only path.
pub fn synthesize(ipv4: &str) -> Result<String> {
    match nat64(ipv4) {
        Ok(text) => Ok(text),
        Err(Error::InvalidIpv4(e)) => Err(Error::InvalidIpv4(e)),
        Err(_) => v4_mapped(ipv4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::parse_ipv6;

    #[test]
    fn v4_mapped_form() {
        assert_eq!(v4_mapped("10.0.0.5").unwrap(), "::FFFF:10.0.0.5");
        assert_eq!(v4_mapped("127.0.0.1").unwrap(), "::FFFF:127.0.0.1");
        // The mapped form parses back to a real v4-mapped address.
        let bytes = parse_ipv6(&v4_mapped("10.0.0.5").unwrap()).unwrap();
        assert_eq!(&bytes[10..], &[0xff, 0xff, 10, 0, 0, 5]);
    }

    #[test]
    fn v4_mapped_rejects_bad_input() {
        assert!(v4_mapped("::1").is_err());
        assert!(v4_mapped("not-an-ip").is_err());
        assert!(v4_mapped("").is_err());
    }

    #[test]
    fn v4_mapped_respects_buffer_capacity() {
        let mut big = [0u8; INET6_ADDRSTRLEN];
        let len = v4_mapped_into("10.0.0.5", &mut big).unwrap();
        assert_eq!(&big[..len], b"::FFFF:10.0.0.5");

        let mut small = [0u8; 8];
        assert!(matches!(
            v4_mapped_into("10.0.0.5", &mut small),
            Err(Error::Overflow { .. })
        ));
    }

    #[test]
    fn nat64_rejects_non_ipv4_text() {
        assert!(nat64("::1").is_err());
        assert!(nat64("example.com").is_err());
    }

    #[test]
    fn resolver_sees_ipv4_literals() {
        // The any-family lookup must reach the platform resolver and hand
        // back the literal as a candidate, with the service port applied.
        let candidates = resolve_any_family("127.0.0.1").unwrap();
        assert!(candidates
            .iter()
            .any(|c| matches!(c, SocketAddr::V4(v4) if v4.ip().is_loopback() && v4.port() == 80)));
    }

    #[test]
    fn nat64_verdict_is_conclusive_for_v4_literals() {
        // Without DNS64 the lookup yields no AAAA and fails; behind DNS64 it
        // yields a parseable IPv6 literal. Nothing else is acceptable.
        match nat64("192.0.2.1") {
            Ok(text) => assert!(parse_ipv6(&text).is_ok(), "{text}"),
            Err(Error::SynthesisFailed(input)) => assert_eq!(input, "192.0.2.1"),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn synthesize_always_yields_parseable_ipv6() {
        // Whether or not NAT64 infrastructure exists here, the fallback
        // guarantees a valid IPv6 literal for valid IPv4 input.
        let text = synthesize("10.0.0.5").unwrap();
        assert!(parse_ipv6(&text).is_ok(), "{text}");
        assert!(synthesize("junk").is_err());
    }
}
