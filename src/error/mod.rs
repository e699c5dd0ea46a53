use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("invalid ipv4 text: {0:?}")]
    InvalidIpv4(String),
    #[error("invalid ipv6 text: {0:?}")]
    InvalidIpv6(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("socket is closed")]
    SocketClosed,
    #[error("socket is not bound")]
    NotBound,
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("cannot bind {ip}:{port} on an ipv6-only stack")]
    UnmappableBind { ip: String, port: u16 },
    #[error("failed to synthesize an ipv6 address for {0:?}")]
    SynthesisFailed(String),
    #[error("worker already running")]
    AlreadyRunning,
    #[error("out of the storage: capacity is {cap} required is at least {required}")]
    Overflow { cap: usize, required: usize },
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
