use std::io;
use std::os::windows::io::RawSocket;

use windows_sys::Win32::Networking::WinSock::{WSAPoll, POLLRDNORM, SOCKET_ERROR, WSAPOLLFD};

/// Blocks until `socket` is readable or `timeout_ms` elapses.
pub(crate) fn wait_readable(socket: RawSocket, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = WSAPOLLFD {
        fd: socket as usize,
        events: POLLRDNORM as i16,
        revents: 0,
    };
    let rc = unsafe { WSAPoll(&mut pfd, 1, timeout_ms) };
    if rc == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(rc > 0 && pfd.revents & POLLRDNORM as i16 != 0)
}
