//! Kernel object backend: named file mappings and named events

use std::time::Duration;

use windows::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, ERROR_INVALID_PARAMETER, GetLastError, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, FILE_MAP_READ, FILE_MAP_WRITE,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE, UnmapViewOfFile,
};
use windows::Win32::System::Threading::{
    CreateEventW, EVENT_MODIFY_STATE, GetCurrentThread, GetThreadPriority, OpenEventW,
    OpenProcess, PROCESS_SYNCHRONIZE, SYNCHRONIZATION_SYNCHRONIZE, SetEvent, SetThreadPriority,
    THREAD_PRIORITY, THREAD_PRIORITY_LOWEST, WaitForSingleObject,
};
use windows::core::PCWSTR;

use crate::error::{Error, Result};

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Named file mapping backed by the paging file
pub struct SharedRegion {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
}

// SAFETY: the mapping handle and view are process-wide; access to the bytes
// is serialized by the channel handshake
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the mapping, or attach to it when the name is already taken.
    /// The flag is `true` when this call created it.
    pub fn create(name: &str, size: usize) -> Result<(Self, bool)> {
        let name_wide = wide(name);

        unsafe {
            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                size as u32,
                PCWSTR(name_wide.as_ptr()),
            );
            // Must be read before any other call resets it
            let already_exists = GetLastError() == ERROR_ALREADY_EXISTS;
            let handle = handle.map_err(|e| Error::unavailable(name, e))?;

            let region = Self::map(name, handle, size)?;
            Ok((region, !already_exists))
        }
    }

    /// Attach to an existing mapping
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let name_wide = wide(name);

        unsafe {
            let handle = OpenFileMappingW(
                (FILE_MAP_READ | FILE_MAP_WRITE).0,
                false,
                PCWSTR(name_wide.as_ptr()),
            )
            .map_err(|e| Error::unavailable(name, e))?;
            Self::map(name, handle, size)
        }
    }

    unsafe fn map(name: &str, handle: HANDLE, size: usize) -> Result<Self> {
        unsafe {
            let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size);
            if view.Value.is_null() {
                let err = windows::core::Error::from_win32();
                let _ = CloseHandle(handle);
                return Err(Error::unavailable(name, err));
            }
            Ok(Self {
                handle,
                view,
                len: size,
            })
        }
    }

    /// Start of the mapped bytes
    pub fn as_ptr(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.handle);
        }
    }
}

/// Named auto-reset event
pub struct Signal {
    handle: HANDLE,
}

// SAFETY: event handles may be used from any thread
unsafe impl Send for Signal {}
unsafe impl Sync for Signal {}

impl Signal {
    /// Create the event, or attach to it if it already exists
    pub fn create(name: &str) -> Result<Self> {
        let name_wide = wide(name);
        let handle = unsafe { CreateEventW(None, false, false, PCWSTR(name_wide.as_ptr())) }
            .map_err(|e| Error::unavailable(name, e))?;
        Ok(Self { handle })
    }

    /// Attach to an existing event
    pub fn open(name: &str) -> Result<Self> {
        let name_wide = wide(name);
        let handle = unsafe {
            OpenEventW(
                EVENT_MODIFY_STATE | SYNCHRONIZATION_SYNCHRONIZE,
                false,
                PCWSTR(name_wide.as_ptr()),
            )
        }
        .map_err(|e| Error::unavailable(name, e))?;
        Ok(Self { handle })
    }

    /// Signal the event, releasing one waiter
    pub fn set(&self) -> Result<()> {
        unsafe { SetEvent(self.handle) }.map_err(|e| Error::unavailable("event", e))
    }

    /// Wait up to `timeout`. `Ok(true)` if signaled, `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
        let status = unsafe { WaitForSingleObject(self.handle, millis) };
        if status == WAIT_OBJECT_0 {
            Ok(true)
        } else if status == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(Error::unavailable(
                "event",
                windows::core::Error::from_win32(),
            ))
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

/// Lowers the current thread's priority until dropped
pub struct PriorityNudge {
    previous: Option<i32>,
}

impl PriorityNudge {
    /// Lower the current thread's priority until the guard drops
    pub fn lower() -> Self {
        unsafe {
            let thread = GetCurrentThread();
            let previous = GetThreadPriority(thread);
            let previous = SetThreadPriority(thread, THREAD_PRIORITY_LOWEST)
                .ok()
                .map(|_| previous);
            Self { previous }
        }
    }
}

impl Drop for PriorityNudge {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            unsafe {
                let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY(previous));
            }
        }
    }
}

pub(super) struct ProcessHandleCheck {
    pid: u32,
    handle: Option<HANDLE>,
}

// SAFETY: process handles may be used from any thread
unsafe impl Send for ProcessHandleCheck {}

impl ProcessHandleCheck {
    pub(super) fn new(pid: u32) -> Self {
        Self { pid, handle: None }
    }

    pub(super) fn is_alive(&mut self) -> Result<bool> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => match unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, self.pid) } {
                Ok(handle) => *self.handle.insert(handle),
                // No such process id any more
                Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => return Ok(false),
                Err(e) => return Err(Error::unavailable(format!("process {}", self.pid), e)),
            },
        };
        // WAIT_TIMEOUT means still running, WAIT_OBJECT_0 means terminated
        Ok(unsafe { WaitForSingleObject(handle, 0) } == WAIT_TIMEOUT)
    }
}

impl Drop for ProcessHandleCheck {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe {
                let _ = CloseHandle(handle);
            }
        }
    }
}
