//! Asynchronous traceroute engine.
//!
//! [`TraceContext`] owns one background thread that multiplexes every
//! in-flight probe across every submitted [`TraceContext::start`]
//! request: callers never block, they hand over a request and an
//! eventfd wakes the scheduler thread to pick it up. The scheduling
//! algorithm itself ([`scheduler::Scheduler`]) is decoupled from actual
//! socket I/O ([`prober::Prober`]) so it can be driven directly in
//! tests without a network.
//!
//! Linux-only: hop discovery depends on `IP_RECVERR`'s `sock_extended_err`
//! reporting, which has no portable equivalent.

mod icmp;
mod prober;
mod scheduler;

use std::any::Any;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, warn};

use crate::cm::ConfigSet;
use crate::primitives::SpinLock;
use prober::LinuxProber;
use scheduler::{IncomingRequest, Scheduler};

pub use scheduler::TraceConfig;

/// Per-hop or terminal notification delivered to a trace's callback.
///
/// `Done` fires exactly once, unless [`TraceContext::end`] was called
/// for that trace first, in which case it is suppressed.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent {
    Hop { distance: u8, addr: IpAddr },
    Done,
}

pub type TraceUserData = Arc<dyn Any + Send + Sync>;
pub type TraceCallback = Arc<dyn Fn(TraceEvent, &TraceUserData) + Send + Sync>;

impl TraceConfig {
    /// Reads the recognized `[trace]` keys from a [`ConfigSet`],
    /// defaulting anything missing or unparsable.
    pub fn from_config_set(set: &ConfigSet) -> TraceConfig {
        let d = TraceConfig::default();
        let int = |key: &str, default: u64| -> u64 {
            set.lookup_value("trace", key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        TraceConfig {
            udp_size: int("udp size", d.udp_size as u64) as usize,
            base_port: int("base port", d.base_port as u64) as u16,
            timeout: Duration::from_millis(int("request timeout", d.timeout.as_millis() as u64)),
            pool_size: int("request limit", d.pool_size as u64) as usize,
            default_max_distance: int("hops limit", d.default_max_distance as u64) as u8,
            retries: int("retries", d.retries as u64) as u32,
            bind_address: set
                .lookup_value("trace", "address")
                .filter(|v| v != "any")
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// A handle to a live or completed trace. Dropping it does not end the
/// trace; call [`TraceContext::end`] explicitly.
#[derive(Clone)]
pub struct TraceHandle {
    id: u64,
    end_requested: Arc<AtomicBool>,
}

struct Eventfd(RawFd);

impl Eventfd {
    fn new() -> std::io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Eventfd(fd))
    }

    fn ping(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.0, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(self.0, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Eventfd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

unsafe impl Send for Eventfd {}
unsafe impl Sync for Eventfd {}

struct ContextInner {
    incoming: SpinLock<Vec<IncomingRequest>>,
    wake: Eventfd,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Owns the traceroute background thread and its slot pool.
#[derive(Clone)]
pub struct TraceContext {
    inner: Arc<ContextInner>,
}

impl TraceContext {
    /// Allocates the slot pool, opens the wakeup eventfd, and spawns the
    /// background scheduling thread. Returns `Err` if the thread cannot
    /// be spawned, after releasing everything already allocated.
    pub fn init(config: TraceConfig) -> std::io::Result<TraceContext> {
        let wake = Eventfd::new()?;
        let inner = Arc::new(ContextInner {
            incoming: SpinLock::new(Vec::new()),
            wake,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            thread: std::sync::Mutex::new(None),
        });

        let ctx = TraceContext { inner };
        let thread_ctx = ctx.clone();
        let handle = thread::Builder::new()
            .name("trace-scheduler".to_string())
            .spawn(move || thread_ctx.run(config))
            .map_err(|e| {
                error!("trace: failed to spawn scheduler thread: {e}");
                e
            })?;
        *ctx.inner.thread.lock().unwrap() = Some(handle);
        Ok(ctx)
    }

    /// Stops the background thread; every trace still in flight receives
    /// a terminal `Done` callback (unless [`TraceContext::end`] was
    /// already called for it).
    pub fn release(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.ping();
        if let Some(handle) = self.inner.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Enqueues a new trace. `max_distance=0` is normalized to the
    /// configured default hop count.
    pub fn start(&self, address: &str, max_distance: u8, callback: TraceCallback, user: TraceUserData) -> TraceHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let end_requested = Arc::new(AtomicBool::new(false));
        self.inner.incoming.lock().push(IncomingRequest {
            id,
            address: address.to_string(),
            max_distance,
            callback,
            user,
            end_requested: end_requested.clone(),
        });
        self.inner.wake.ping();
        TraceHandle { id, end_requested }
    }

    /// Marks a trace for silent termination: its final `Done` callback
    /// is suppressed. In-flight probes for it are not proactively
    /// cancelled; they wind down on their own schedule.
    pub fn end(&self, handle: &TraceHandle) {
        handle.end_requested.store(true, Ordering::SeqCst);
    }

    fn run(&self, config: TraceConfig) {
        let bind_address = config.bind_address;
        let mut scheduler = Scheduler::new(config, LinuxProber::new(bind_address));
        let mut timeout = Duration::from_millis(50);
        loop {
            if self.wait_for_wakeup(timeout) {
                self.inner.wake.drain();
            }
            if self.inner.shutdown.load(Ordering::SeqCst) {
                for req in self.inner.incoming.lock().drain(..).collect::<Vec<_>>() {
                    scheduler.accept(req);
                }
                scheduler.shutdown_drain();
                return;
            }
            for req in self.inner.incoming.lock().drain(..).collect::<Vec<_>>() {
                scheduler.accept(req);
            }
            timeout = scheduler.tick();
        }
    }

    fn wait_for_wakeup(&self, timeout: Duration) -> bool {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use std::os::fd::BorrowedFd;
        let fd = unsafe { BorrowedFd::borrow_raw(self.inner.wake.0) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut fds, PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|f| f.contains(PollFlags::POLLIN))
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                warn!("trace: eventfd poll failed: {e}");
                false
            }
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) && self.thread.lock().unwrap().is_some() {
            warn!("TraceContext dropped without calling release(); background thread leaked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::ConfigManager;

    #[test]
    fn zero_max_distance_is_normalized_by_config_default() {
        let cfg = TraceConfig::default();
        assert_eq!(cfg.default_max_distance, 10);
    }

    #[test]
    fn config_from_set_reads_recognized_keys() {
        let set = ConfigManager::new().create_set("test").unwrap();
        set.add_key("trace", "hops limit", "20");
        set.add_key("trace", "base port", "40000");
        let cfg = TraceConfig::from_config_set(&set);
        assert_eq!(cfg.default_max_distance, 20);
        assert_eq!(cfg.base_port, 40000);
        assert_eq!(cfg.udp_size, 40, "unset keys keep their default");
    }
}
