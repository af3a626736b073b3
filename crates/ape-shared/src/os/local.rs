//! In-process named objects
//!
//! Objects live as long as at least one handle to them does, like kernel
//! objects do. Names are looked up in a process-wide table.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError, Weak};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Default)]
struct Namespace {
    regions: HashMap<String, Weak<Block>>,
    events: HashMap<String, Weak<EventState>>,
}

static NAMESPACE: LazyLock<Mutex<Namespace>> = LazyLock::new(Default::default);

fn namespace() -> std::sync::MutexGuard<'static, Namespace> {
    NAMESPACE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Zeroed, 8-byte aligned backing memory
struct Block {
    ptr: NonNull<u64>,
    words: usize,
    len: usize,
}

// SAFETY: the block is plain memory; access is coordinated by the channel
// handshake exactly as it is for a real cross-process mapping
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn zeroed(len: usize) -> Self {
        let words = len.div_ceil(8);
        let raw = Box::into_raw(vec![0u64; words].into_boxed_slice());
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(raw as *mut u64) };
        Self { ptr, words, len }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr/words came from the boxed slice built in `zeroed`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

/// Named block of memory shared by every holder of the name
pub struct SharedRegion {
    block: Arc<Block>,
}

impl SharedRegion {
    /// Create the region, or attach to it when the name is already taken.
    /// The flag is `true` when this call created it.
    pub fn create(name: &str, size: usize) -> Result<(Self, bool)> {
        let mut ns = namespace();
        if let Some(block) = ns.regions.get(name).and_then(Weak::upgrade) {
            if block.len < size {
                return Err(Error::unavailable(
                    name,
                    format!("existing region is {} bytes, need {size}", block.len),
                ));
            }
            return Ok((Self { block }, false));
        }

        ns.regions.retain(|_, weak| weak.strong_count() > 0);
        let block = Arc::new(Block::zeroed(size));
        ns.regions.insert(name.to_string(), Arc::downgrade(&block));
        Ok((Self { block }, true))
    }

    /// Attach to an existing region
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let ns = namespace();
        let block = ns
            .regions
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::unavailable(name, "no such region"))?;
        if block.len < size {
            return Err(Error::unavailable(
                name,
                format!("region is {} bytes, need {size}", block.len),
            ));
        }
        Ok(Self { block })
    }

    /// Start of the mapped bytes
    pub fn as_ptr(&self) -> *mut u8 {
        self.block.ptr.as_ptr() as *mut u8
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.block.len
    }
}

struct EventState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Named auto-reset event
pub struct Signal {
    state: Arc<EventState>,
}

impl Signal {
    /// Create the event, or attach to it if it already exists
    pub fn create(name: &str) -> Result<Self> {
        let mut ns = namespace();
        if let Some(state) = ns.events.get(name).and_then(Weak::upgrade) {
            return Ok(Self { state });
        }
        ns.events.retain(|_, weak| weak.strong_count() > 0);
        let state = Arc::new(EventState {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        });
        ns.events.insert(name.to_string(), Arc::downgrade(&state));
        Ok(Self { state })
    }

    /// Attach to an existing event
    pub fn open(name: &str) -> Result<Self> {
        namespace()
            .events
            .get(name)
            .and_then(Weak::upgrade)
            .map(|state| Self { state })
            .ok_or_else(|| Error::unavailable(name, "no such event"))
    }

    /// Signal the event, releasing one waiter
    pub fn set(&self) -> Result<()> {
        let mut signaled = self
            .state
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.state.cond.notify_one();
        Ok(())
    }

    /// Wait up to `timeout`. `Ok(true)` if signaled (and reset), `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let guard = self
            .state
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut signaled, _) = self
            .state
            .cond
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);
        let was = *signaled;
        *signaled = false;
        Ok(was)
    }
}

/// Thread priority nudge; thread priorities are not adjusted on this target
pub struct PriorityNudge;

impl PriorityNudge {
    /// Lower the current thread's priority until the guard drops
    pub fn lower() -> Self {
        PriorityNudge
    }
}

pub(super) struct ProcessHandleCheck {
    pid: u32,
}

impl ProcessHandleCheck {
    pub(super) fn new(pid: u32) -> Self {
        Self { pid }
    }

    #[cfg(target_os = "linux")]
    pub(super) fn is_alive(&mut self) -> Result<bool> {
        Ok(std::path::Path::new(&format!("/proc/{}", self.pid)).exists())
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn is_alive(&mut self) -> Result<bool> {
        let _ = self.pid;
        Ok(true)
    }
}
