//! OS primitives behind a channel
//!
//! - [`SharedRegion`] - a named, mapped block of memory
//! - [`Signal`] - a named auto-reset event
//! - [`PriorityNudge`] - lowers the calling thread's priority until dropped
//! - [`PeerLiveness`] - "is the other process still there?"
//!
//! Windows uses kernel objects. Every other target gets an in-process
//! namespace with the same semantics, which is what the tests run against
//! and what single-process hosts use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;

#[cfg(not(windows))]
mod local;
#[cfg(windows)]
mod win32;

#[cfg(not(windows))]
use local as imp;
#[cfg(windows)]
use win32 as imp;

pub use imp::{PriorityNudge, SharedRegion, Signal};

/// Liveness check for the process on the other end of a channel
pub trait PeerLiveness: Send {
    /// Process id being watched
    fn pid(&self) -> u32;

    /// `Ok(false)` once the process has exited.
    /// An `Err` means the answer is unknown (e.g. access denied).
    fn is_alive(&mut self) -> Result<bool>;
}

/// Watches a real process by id
pub struct ProcessWatch {
    pid: u32,
    process: imp::ProcessHandleCheck,
}

impl ProcessWatch {
    /// Start watching `pid`
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            process: imp::ProcessHandleCheck::new(pid),
        }
    }
}

impl PeerLiveness for ProcessWatch {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> Result<bool> {
        self.process.is_alive()
    }
}

/// A peer that never goes away (agent hosted in the controller's own process)
#[derive(Debug, Clone, Copy)]
pub struct AlwaysAlive(pub u32);

impl PeerLiveness for AlwaysAlive {
    fn pid(&self) -> u32 {
        self.0
    }

    fn is_alive(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Liveness driven by a shared flag; clones observe the same flag
#[derive(Debug, Clone)]
pub struct ManualLiveness {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ManualLiveness {
    /// A live peer with the given pid
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the peer as exited
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl PeerLiveness for ManualLiveness {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> Result<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }
}

impl<T: PeerLiveness + ?Sized> PeerLiveness for Box<T> {
    fn pid(&self) -> u32 {
        (**self).pid()
    }

    fn is_alive(&mut self) -> Result<bool> {
        (**self).is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unique_name(kind: &str) -> String {
        use std::sync::atomic::AtomicU32;
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "APE_ostest_{kind}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn test_region_is_shared_by_name() {
        let name = unique_name("region");
        let (a, fresh) = SharedRegion::create(&name, 4096).unwrap();
        assert!(fresh);
        let b = SharedRegion::open(&name, 4096).unwrap();

        unsafe {
            *a.as_ptr().add(100) = 0x5A;
            assert_eq!(*b.as_ptr().add(100), 0x5A);
        }
    }

    #[test]
    fn test_second_create_reports_existing() {
        let name = unique_name("region");
        let (_a, fresh_a) = SharedRegion::create(&name, 4096).unwrap();
        let (_b, fresh_b) = SharedRegion::create(&name, 4096).unwrap();
        assert!(fresh_a);
        assert!(!fresh_b);
    }

    #[test]
    fn test_open_missing_region_fails() {
        let name = unique_name("missing");
        assert!(SharedRegion::open(&name, 4096).is_err());
    }

    #[test]
    fn test_signal_is_auto_reset() {
        let name = unique_name("event");
        let a = Signal::create(&name).unwrap();
        let b = Signal::open(&name).unwrap();

        a.set().unwrap();
        assert!(b.wait(Duration::from_millis(100)).unwrap());
        // Consumed by the first wait
        assert!(!b.wait(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_signal_wakes_other_thread() {
        let name = unique_name("event");
        let a = Signal::create(&name).unwrap();
        let b = Signal::open(&name).unwrap();

        let waiter = std::thread::spawn(move || b.wait(Duration::from_secs(5)).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        a.set().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_manual_liveness_clones_share_flag() {
        let watch = ManualLiveness::new(7);
        let mut observer = watch.clone();
        assert!(observer.is_alive().unwrap());
        watch.kill();
        assert!(!observer.is_alive().unwrap());
        assert_eq!(observer.pid(), 7);
    }

    #[test]
    fn test_own_process_is_alive() {
        let mut watch = ProcessWatch::new(std::process::id());
        assert!(watch.is_alive().unwrap());
    }
}
