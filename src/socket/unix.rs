use std::io;
use std::os::fd::RawFd;

/// Blocks until `fd` is readable or `timeout_ms` elapses. `EINTR` restarts
/// the wait; any other failure is surfaced to the caller.
pub(crate) fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        return Ok(rc > 0 && pfd.revents & libc::POLLIN != 0);
    }
}
