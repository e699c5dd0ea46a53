//! Background receive worker.
//!
//! A [`UdpWorker`] owns a [`DualStackSocket`] and a consumer sink, and runs a
//! polling receive loop on a dedicated OS thread. Every sink callback runs on
//! that thread, so sinks must not block unboundedly and must guard any state
//! they also touch from other threads. Cancellation is cooperative: the stop
//! flag is checked between drain iterations and between poll cycles, so
//! shutdown latency is bounded by the poll interval plus one drain batch.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::socket::{DualStackSocket, UDP_BUFFER_MIN};

/// Upper bound for one readiness wait.
pub const POLL_INTERVAL_MS: i32 = 10;

/// Consumer of everything the worker produces. Held as `Arc<dyn UdpSink>`, so
/// its lifetime necessarily exceeds the worker thread's.
pub trait UdpSink: Send + Sync {
    /// One datagram; ownership of the payload transfers to the sink.
    fn on_receive(&self, payload: BytesMut, from_ip: &str, from_port: u16);

    /// Periodic work, once per poll cycle (keepalives and the like).
    fn on_tick(&self);

    /// Returning true ends the worker loop cleanly.
    fn check_timeout(&self) -> bool;
}

pub struct UdpWorker {
    socket: Arc<DualStackSocket>,
    sink: Arc<dyn UdpSink>,
    stop: Arc<AtomicBool>,
    // Some(handle) while a worker thread is associated with this instance.
    // Start/Stop serialize on this lock.
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpWorker {
    /// Takes an already-created socket so that socket-creation failure
    /// surfaces to the caller before any thread exists.
    pub fn new(socket: Arc<DualStackSocket>, sink: Arc<dyn UdpSink>) -> Self {
        Self {
            socket,
            sink,
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Arc<DualStackSocket> {
        &self.socket
    }

    /// Pass-through send usable from any thread while the worker runs.
    pub fn send_to(&self, buf: &[u8], ip: &str, port: u16) -> Result<usize> {
        self.socket.send_to(buf, ip, port)
    }

    /// Spawns the worker thread. Fails without side effects when a thread is
    /// already associated with this instance.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            log::info!("udp worker already started");
            return Err(Error::AlreadyRunning);
        }
        self.stop.store(false, Ordering::SeqCst);
        let socket = self.socket.clone();
        let sink = self.sink.clone();
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("udp-worker".into())
            .spawn(move || worker_loop(socket, sink, stop))
            .map_err(|e| {
                log::error!("udp worker thread spawn failed: {e}");
                Error::Io(e)
            })?;
        *thread = Some(handle);
        log::info!("udp worker started");
        Ok(())
    }

    /// True while the worker thread is alive. A loop that exited on its own
    /// (timeout or poll failure) reports false here, but still needs a
    /// `stop` before the next `start`.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Requests a stop, joins the worker thread, then closes the socket.
    /// Idempotent, and a safe no-op when not running; concurrent callers
    /// serialize on the internal lock. No sink callback happens after this
    /// returns.
    pub fn stop(&self) {
        let mut thread = self.thread.lock();
        if let Some(handle) = thread.take() {
            self.stop.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                log::error!("udp worker thread panicked");
            }
            self.socket.close();
            log::info!("udp worker stopped");
        }
    }
}

impl Drop for UdpWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(socket: Arc<DualStackSocket>, sink: Arc<dyn UdpSink>, stop: Arc<AtomicBool>) {
    log::info!("udp worker loop in");
    let mut buf = [0u8; UDP_BUFFER_MIN];
    while !stop.load(Ordering::SeqCst) {
        let readable = match socket.wait_readable(POLL_INTERVAL_MS) {
            Ok(readable) => readable,
            Err(e) => {
                log::error!("udp worker readiness wait failed: {e}");
                break;
            }
        };
        if readable {
            // Drain until the socket would block or a stop lands.
            while !stop.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok((len, from_ip, from_port)) => {
                        log::debug!("recv {len} bytes from {from_ip}:{from_port}");
                        sink.on_receive(BytesMut::from(&buf[..len]), &from_ip, from_port);
                    }
                    Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        sink.on_tick();
        if sink.check_timeout() {
            log::info!("udp worker peer timeout");
            break;
        }
    }
    log::info!("udp worker loop out");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::stack::{IpStack, StackCell};
    use socket2::Domain;

    #[derive(Default)]
    struct CountingSink {
        received: AtomicUsize,
        ticks: AtomicUsize,
        timeout: AtomicBool,
        last_payload: Mutex<Option<(Vec<u8>, String, u16)>>,
    }

    impl UdpSink for CountingSink {
        fn on_receive(&self, payload: BytesMut, from_ip: &str, from_port: u16) {
            self.received.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock() = Some((payload.to_vec(), from_ip.to_string(), from_port));
        }
        fn on_tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        fn check_timeout(&self) -> bool {
            self.timeout.load(Ordering::SeqCst)
        }
    }

    fn loopback_socket() -> Arc<DualStackSocket> {
        let _ = env_logger::builder().is_test(true).try_init();
        let socket = DualStackSocket::create_with_stack(
            false,
            false,
            Some(Domain::IPV4),
            StackCell::preset(IpStack::V4),
        )
        .unwrap();
        socket.bind("127.0.0.1", 0).unwrap();
        Arc::new(socket)
    }

    fn loopback_worker(sink: Arc<CountingSink>) -> UdpWorker {
        UdpWorker::new(loopback_socket(), sink)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn second_start_fails_while_running() {
        let sink = Arc::new(CountingSink::default());
        let worker = loopback_worker(sink);
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(Error::AlreadyRunning)));
        assert!(worker.is_running());
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn datagrams_reach_the_sink() {
        let sink = Arc::new(CountingSink::default());
        let worker = loopback_worker(sink.clone());
        let (_, port) = worker.socket().local_addr_text().unwrap();
        worker.start().unwrap();

        let sender = loopback_socket();
        sender.send_to(b"hello", "127.0.0.1", port).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            sink.received.load(Ordering::SeqCst) == 1
        }));
        let (payload, from_ip, from_port) = sink.last_payload.lock().clone().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(from_ip, "127.0.0.1");
        assert_eq!(from_port, sender.local_addr_text().unwrap().1);
        worker.stop();
    }

    #[test]
    fn no_callbacks_after_stop() {
        let sink = Arc::new(CountingSink::default());
        let worker = loopback_worker(sink.clone());
        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            sink.ticks.load(Ordering::SeqCst) > 2
        }));
        worker.stop();
        let frozen = sink.ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.ticks.load(Ordering::SeqCst), frozen);
        assert!(worker.socket().is_closed());
    }

    #[test]
    fn timeout_sink_ends_the_loop_without_stop() {
        let sink = Arc::new(CountingSink::default());
        sink.timeout.store(true, Ordering::SeqCst);
        let worker = loopback_worker(sink.clone());
        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || !worker.is_running()));
        // The tick still runs once before the timeout check ends the loop.
        assert_eq!(sink.ticks.load(Ordering::SeqCst), 1);
        // A fresh start needs an explicit stop first.
        assert!(matches!(worker.start(), Err(Error::AlreadyRunning)));
        worker.stop();
        worker.start().unwrap();
        worker.stop();
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let sink = Arc::new(CountingSink::default());
        let worker = loopback_worker(sink);
        worker.stop();
        worker.stop();
    }
}
