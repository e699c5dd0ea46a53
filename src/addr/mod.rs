//! Text/binary conversion for IPv4 and IPv6 addresses.
//!
//! The parsers are written by hand against the textual forms of RFC 4291 and
//! the formatter follows RFC 5952 (longest zero run compressed to `::`,
//! embedded IPv4 tails rendered in dotted-quad form). `std::net` is used only
//! as a container type at the socket boundary; classification and conversion
//! never go through the platform's `inet_pton`/`inet_ntop`.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};

/// Worst-case length of an IPv6 text form, including the terminator slot of
/// the C API this mirrors.
pub const INET6_ADDRSTRLEN: usize = 46;

/// An IP endpoint whose family tag and payload cannot desynchronize.
///
/// Text that parses as neither family yields [`IpAddress::Invalid`], which
/// carries no usable bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddress {
    V4 { ip: [u8; 4], port: u16 },
    V6 { ip: [u8; 16], port: u16 },
    Invalid,
}

impl IpAddress {
    /// Parses `text` as IPv4 first, then IPv6. Unparsable text is `Invalid`.
    pub fn from_text(text: &str, port: u16) -> Self {
        if let Ok(ip) = parse_ipv4(text) {
            return IpAddress::V4 { ip, port };
        }
        if let Ok(ip) = parse_ipv6(text) {
            return IpAddress::V6 { ip, port };
        }
        IpAddress::Invalid
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, IpAddress::Invalid)
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            IpAddress::V4 { port, .. } | IpAddress::V6 { port, .. } => Some(*port),
            IpAddress::Invalid => None,
        }
    }

    /// Canonical text form of the address part.
    pub fn ip_text(&self) -> Option<String> {
        match self {
            IpAddress::V4 { ip, .. } => Some(format_ipv4(ip)),
            IpAddress::V6 { ip, .. } => Some(format_ipv6(ip)),
            IpAddress::Invalid => None,
        }
    }

    /// Recovers an IPv4 payload: the address itself for V4, the last four
    /// bytes for V6 (whether or not it is a true v4-mapped address).
    pub fn extract_ipv4(&self) -> Option<[u8; 4]> {
        match self {
            IpAddress::V4 { ip, .. } => Some(*ip),
            IpAddress::V6 { ip, .. } => Some(extract_ipv4_tail(ip)),
            IpAddress::Invalid => None,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            IpAddress::V4 { ip, port } => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(*ip),
                *port,
            ))),
            IpAddress::V6 { ip, port } => Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(*ip),
                *port,
                0,
                0,
            ))),
            IpAddress::Invalid => None,
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip_text() {
            Some(ip) => write!(f, "{}:{}", ip, self.port().unwrap_or(0)),
            None => write!(f, "<invalid>"),
        }
    }
}

/// Strict dotted-quad parser: exactly four octets, each `0..=255`, no octet
/// with a leading zero other than a lone `0`.
pub fn parse_ipv4(text: &str) -> Result<[u8; 4]> {
    let invalid = || Error::InvalidIpv4(text.to_string());
    let mut out = [0u8; 4];
    let mut done = 0usize;
    let mut octet = 0u32;
    let mut saw_digit = false;
    for &ch in text.as_bytes() {
        match ch {
            b'0'..=b'9' => {
                if saw_digit && octet == 0 {
                    return Err(invalid());
                }
                octet = octet * 10 + u32::from(ch - b'0');
                if octet > 255 {
                    return Err(invalid());
                }
                saw_digit = true;
            }
            b'.' if saw_digit => {
                if done == 3 {
                    return Err(invalid());
                }
                out[done] = octet as u8;
                done += 1;
                octet = 0;
                saw_digit = false;
            }
            _ => return Err(invalid()),
        }
    }
    if !saw_digit || done != 3 {
        return Err(invalid());
    }
    out[3] = octet as u8;
    Ok(out)
}

/// RFC 4291 textual form: at most one `::` run, optional dotted-quad tail for
/// the low 32 bits, optional `%zone` suffix. The zone is stripped before
/// parsing; resolve it separately with [`zone_index`].
pub fn parse_ipv6(text: &str) -> Result<[u8; 16]> {
    let invalid = || Error::InvalidIpv6(text.to_string());
    let src = match text.find('%') {
        Some(at) => &text[..at],
        None => text,
    };
    let s = src.as_bytes();
    let mut tmp = [0u8; 16];
    let mut tp = 0usize;
    let mut colonp: Option<usize> = None;
    let mut i = 0usize;
    // A leading ':' is only legal as part of "::".
    if s.first() == Some(&b':') {
        if s.get(1) != Some(&b':') {
            return Err(invalid());
        }
        i = 1;
    }
    let mut curtok = i;
    let mut seen_xdigits = 0u32;
    let mut val = 0u32;
    while i < s.len() {
        let ch = s[i];
        i += 1;
        if let Some(digit) = (ch as char).to_digit(16) {
            val = (val << 4) | digit;
            seen_xdigits += 1;
            if seen_xdigits > 4 {
                return Err(invalid());
            }
            continue;
        }
        if ch == b':' {
            curtok = i;
            if seen_xdigits == 0 {
                if colonp.is_some() {
                    return Err(invalid());
                }
                colonp = Some(tp);
                continue;
            }
            if i == s.len() {
                // trailing single ':'
                return Err(invalid());
            }
            if tp + 2 > tmp.len() {
                return Err(invalid());
            }
            tmp[tp] = (val >> 8) as u8;
            tmp[tp + 1] = val as u8;
            tp += 2;
            seen_xdigits = 0;
            val = 0;
            continue;
        }
        if ch == b'.' && tp + 4 <= tmp.len() {
            if let Ok(v4) = parse_ipv4(&src[curtok..]) {
                tmp[tp..tp + 4].copy_from_slice(&v4);
                tp += 4;
                seen_xdigits = 0;
                break;
            }
        }
        return Err(invalid());
    }
    if seen_xdigits > 0 {
        if tp + 2 > tmp.len() {
            return Err(invalid());
        }
        tmp[tp] = (val >> 8) as u8;
        tmp[tp + 1] = val as u8;
        tp += 2;
    }
    if let Some(cp) = colonp {
        // Shift everything written after the "::" to the tail of the address.
        let n = tp - cp;
        if tp == tmp.len() {
            return Err(invalid());
        }
        for j in 1..=n {
            tmp[16 - j] = tmp[cp + n - j];
            tmp[cp + n - j] = 0;
        }
        tp = tmp.len();
    }
    if tp != tmp.len() {
        return Err(invalid());
    }
    Ok(tmp)
}

/// Resolves a `%zone` suffix to an interface index. Numeric zones parse
/// directly; named zones go through `if_nametoindex` on unix. An absent or
/// unresolvable zone is 0, never an error.
pub fn zone_index(text: &str) -> u32 {
    let Some(at) = text.find('%') else {
        return 0;
    };
    let zone = &text[at + 1..];
    if zone.is_empty() {
        return 0;
    }
    if let Ok(index) = zone.parse::<u32>() {
        return index;
    }
    #[cfg(unix)]
    if let Ok(name) = std::ffi::CString::new(zone) {
        // An unknown interface resolves to 0 and is silently ignored.
        return unsafe { libc::if_nametoindex(name.as_ptr()) };
    }
    0
}

pub fn format_ipv4(ip: &[u8; 4]) -> String {
    format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])
}

/// RFC 5952 style formatter: lower-case hex, the single longest run of two or
/// more zero groups compressed to `::` (earliest run wins ties), embedded
/// IPv4 tails rendered in dotted-quad form.
pub fn format_ipv6(ip: &[u8; 16]) -> String {
    let mut words = [0u16; 8];
    for (i, byte) in ip.iter().enumerate() {
        words[i / 2] |= u16::from(*byte) << ((1 - (i % 2)) << 3);
    }

    // Find the longest run of zero groups; `>` keeps the earliest on ties.
    let mut best: Option<(usize, usize)> = None;
    let mut cur: Option<(usize, usize)> = None;
    for (i, word) in words.iter().enumerate() {
        if *word == 0 {
            cur = Some(match cur {
                Some((base, len)) => (base, len + 1),
                None => (i, 1),
            });
        } else if let Some(run) = cur.take() {
            if best.map_or(true, |b| run.1 > b.1) {
                best = Some(run);
            }
        }
    }
    if let Some(run) = cur {
        if best.map_or(true, |b| run.1 > b.1) {
            best = Some(run);
        }
    }
    if best.map_or(false, |(_, len)| len < 2) {
        best = None;
    }

    let mut out = String::with_capacity(INET6_ADDRSTRLEN);
    let mut i = 0usize;
    while i < 8 {
        if let Some((base, len)) = best {
            if i >= base && i < base + len {
                if i == base {
                    out.push(':');
                }
                i += 1;
                continue;
            }
        }
        if i != 0 {
            out.push(':');
        }
        // An encapsulated IPv4 address? (::a.b.c.d or ::ffff:a.b.c.d forms)
        if i == 6 {
            if let Some((0, len)) = best {
                if len == 6
                    || (len == 7 && words[7] != 0x0001)
                    || (len == 5 && words[5] == 0xffff)
                {
                    out.push_str(&format_ipv4(&extract_ipv4_tail(ip)));
                    break;
                }
            }
        }
        out.push_str(&format!("{:x}", words[i]));
        i += 1;
    }
    if let Some((base, len)) = best {
        if base + len == 8 {
            out.push(':');
        }
    }
    out
}

/// Authoritative classifier for deciding which parser a generic address
/// string should go through.
pub fn is_ipv4_text(text: &str) -> bool {
    parse_ipv4(text).is_ok()
}

/// True for `0.0.0.0` and `::` spellings of the unspecified address.
pub fn is_unspecified_text(text: &str) -> bool {
    match IpAddress::from_text(text, 0) {
        IpAddress::V4 { ip, .. } => ip == [0u8; 4],
        IpAddress::V6 { ip, .. } => ip == [0u8; 16],
        IpAddress::Invalid => false,
    }
}

/// Last four bytes of an IPv6 address, regardless of whether it is a true
/// v4-mapped address.
pub fn extract_ipv4_tail(ip: &[u8; 16]) -> [u8; 4] {
    [ip[12], ip[13], ip[14], ip[15]]
}

/// IPv4 payload of any address literal: the address itself for IPv4 text,
/// the last four bytes for IPv6 text.
pub fn extract_ipv4_from_text(text: &str) -> Result<[u8; 4]> {
    match IpAddress::from_text(text, 0) {
        IpAddress::Invalid => Err(Error::InvalidAddress(text.to_string())),
        other => Ok(other.extract_ipv4().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_strict() {
        let ok = [
            ("0.0.0.0", [0, 0, 0, 0]),
            ("127.0.0.1", [127, 0, 0, 1]),
            ("8.8.8.8", [8, 8, 8, 8]),
            ("255.255.255.255", [255, 255, 255, 255]),
            ("192.168.10.250", [192, 168, 10, 250]),
        ];
        for (text, expected) in ok {
            assert_eq!(parse_ipv4(text).unwrap(), expected, "{text}");
        }
        let bad = [
            "", "1.1.1", "999.1.1.1", "256.0.0.1", "1.2.3.4.5", "1.2.3.4.", ".1.2.3.4", "1..2.3",
            "01.2.3.4", "1.2.3.04", "a.b.c.d", "1.2.3.4x", " 1.2.3.4", "1.2.3.-4",
        ];
        for text in bad {
            assert!(parse_ipv4(text).is_err(), "{text:?} should not parse");
        }
    }

    #[test]
    fn parse_ipv6_forms() {
        let ok: &[(&str, [u8; 16])] = &[
            ("::", [0; 16]),
            ("::1", {
                let mut b = [0; 16];
                b[15] = 1;
                b
            }),
            ("2001:db8::1", {
                let mut b = [0; 16];
                b[0] = 0x20;
                b[1] = 0x01;
                b[2] = 0x0d;
                b[3] = 0xb8;
                b[15] = 1;
                b
            }),
            ("1:2:3:4:5:6:7:8", [0, 1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0, 7, 0, 8]),
            ("::ffff:127.0.0.1", {
                let mut b = [0; 16];
                b[10] = 0xff;
                b[11] = 0xff;
                b[12] = 127;
                b[15] = 1;
                b
            }),
            ("::1.2.3.4", {
                let mut b = [0; 16];
                b[12] = 1;
                b[13] = 2;
                b[14] = 3;
                b[15] = 4;
                b
            }),
            ("fe80::1%0", {
                let mut b = [0; 16];
                b[0] = 0xfe;
                b[1] = 0x80;
                b[15] = 1;
                b
            }),
        ];
        for (text, expected) in ok {
            assert_eq!(parse_ipv6(text).unwrap(), *expected, "{text}");
        }
        let bad = [
            "", ":", ":::", "::::", "1::2::3", "12345::", "1:2:3:4:5:6:7:8:9", "1:2:3:4:5:6:7:",
            "1:2:3:4:5:6:7", "::ffff:1.2.3.256", "g::1", "1:2:3:4:5:6:7:8::",
        ];
        for text in bad {
            assert!(parse_ipv6(text).is_err(), "{text:?} should not parse");
        }
    }

    #[test]
    fn zone_suffix_is_stripped_and_tolerated() {
        let with_zone = parse_ipv6("fe80::1%nosuchif0").unwrap();
        let without = parse_ipv6("fe80::1").unwrap();
        assert_eq!(with_zone, without);
        // Unknown interface names resolve to 0, never an error.
        assert_eq!(zone_index("fe80::1%nosuchif0"), 0);
        assert_eq!(zone_index("fe80::1%7"), 7);
        assert_eq!(zone_index("fe80::1"), 0);
    }

    #[test]
    fn format_ipv4_canonical() {
        for text in ["0.0.0.0", "127.0.0.1", "10.0.0.5", "255.255.255.255"] {
            assert_eq!(format_ipv4(&parse_ipv4(text).unwrap()), text);
        }
    }

    #[test]
    fn format_ipv6_canonical() {
        let cases: &[(&str, &str)] = &[
            ("::", "::"),
            ("::1", "::1"),
            ("0:0:0:0:0:0:0:1", "::1"),
            ("2001:DB8::1", "2001:db8::1"),
            ("1:2:3:4:5:6:7:8", "1:2:3:4:5:6:7:8"),
            // longest zero run wins
            ("1:0:0:2:0:0:0:3", "1:0:0:2::3"),
            // earliest run wins ties
            ("1:0:0:2:0:0:3:4", "1::2:0:0:3:4"),
            // single zero group is not compressed
            ("1:2:3:0:5:6:7:8", "1:2:3:0:5:6:7:8"),
            // trailing run
            ("1:2:3:4:5:6::", "1:2:3:4:5:6::"),
            ("::ffff:127.0.0.1", "::ffff:127.0.0.1"),
            ("::1.2.3.4", "::1.2.3.4"),
        ];
        for (input, expected) in cases {
            let bytes = parse_ipv6(input).unwrap();
            assert_eq!(format_ipv6(&bytes), *expected, "{input}");
        }
    }

    #[test]
    fn format_ipv6_known_bytes() {
        let mut mapped = [0u8; 16];
        mapped[10] = 0xff;
        mapped[11] = 0xff;
        mapped[12] = 127;
        mapped[15] = 1;
        assert_eq!(format_ipv6(&mapped), "::ffff:127.0.0.1");
        assert_eq!(format_ipv6(&[0; 16]), "::");
    }

    #[test]
    fn format_then_parse_round_trips() {
        let samples: &[[u8; 16]] = &[
            [0; 16],
            [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 5],
            [0x20, 1, 0x0d, 0xb8, 0, 1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6],
            [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2],
        ];
        for bytes in samples {
            let text = format_ipv6(bytes);
            assert_eq!(parse_ipv6(&text).unwrap(), *bytes, "{text}");
        }
    }

    #[test]
    fn ip_address_tagging() {
        assert!(matches!(
            IpAddress::from_text("10.0.0.1", 9000),
            IpAddress::V4 { .. }
        ));
        assert!(matches!(
            IpAddress::from_text("2001:db8::1", 9000),
            IpAddress::V6 { .. }
        ));
        let invalid = IpAddress::from_text("not-an-ip", 9000);
        assert!(!invalid.is_valid());
        assert_eq!(invalid.port(), None);
        assert_eq!(invalid.ip_text(), None);
    }

    #[test]
    fn classification_helpers() {
        assert!(is_ipv4_text("1.2.3.4"));
        assert!(!is_ipv4_text("::1"));
        assert!(!is_ipv4_text("example.com"));
        assert!(is_unspecified_text("0.0.0.0"));
        assert!(is_unspecified_text("::"));
        assert!(!is_unspecified_text("127.0.0.1"));
    }

    #[test]
    fn ipv4_tail_extraction() {
        let mapped = parse_ipv6("::ffff:192.168.1.20").unwrap();
        assert_eq!(extract_ipv4_tail(&mapped), [192, 168, 1, 20]);
        // The tail comes back even for a non-mapped address.
        let plain = parse_ipv6("2001:db8::c0a8:114").unwrap();
        assert_eq!(extract_ipv4_tail(&plain), [0xc0, 0xa8, 0x01, 0x14]);
        assert_eq!(
            extract_ipv4_from_text("192.168.1.20").unwrap(),
            [192, 168, 1, 20]
        );
        assert_eq!(
            extract_ipv4_from_text("::ffff:192.168.1.20").unwrap(),
            [192, 168, 1, 20]
        );
        assert!(extract_ipv4_from_text("junk").is_err());
    }
}
