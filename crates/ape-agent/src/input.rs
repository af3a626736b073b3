//! Mouse transitions observed on one window
//!
//! [`InputMonitor`] keeps a down/up/double-click flag per button. On Windows
//! a thread-scoped `WH_MOUSE` hook feeds it; elsewhere the host calls
//! [`InputMonitor::record`] itself.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ape_shared::{Handle, MouseButton};
use tracing::debug;

use crate::error::HandlerError;

pub use hook::MouseHook;

/// One observed button message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseTransition {
    /// Button pressed
    Down,
    /// Button released
    Up,
    /// Second press of a double click
    DoubleClick,
}

#[derive(Debug, Default, Clone, Copy)]
struct ButtonState {
    down: bool,
    up: bool,
    double_click: bool,
}

#[derive(Default)]
struct MonitorState {
    window: Option<Handle>,
    buttons: [ButtonState; 3],
}

/// Accumulated button transitions for the watched window
#[derive(Default)]
pub struct InputMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl InputMonitor {
    /// Monitor watching nothing
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch `window`, forgetting anything seen before
    pub fn start(&self, window: Handle) {
        let mut state = self.lock();
        state.window = Some(window);
        state.buttons = Default::default();
    }

    /// Stop watching
    pub fn stop(&self) {
        let mut state = self.lock();
        state.window = None;
        state.buttons = Default::default();
    }

    /// Window being watched
    pub fn window(&self) -> Option<Handle> {
        self.lock().window
    }

    /// Note a transition; ignored unless `window` is the watched one
    pub fn record(&self, window: Handle, button: MouseButton, transition: MouseTransition) {
        let mut state = self.lock();
        if state.window != Some(window) {
            return;
        }
        let flags = &mut state.buttons[button as usize];
        match transition {
            MouseTransition::Down => flags.down = true,
            MouseTransition::Up => flags.up = true,
            MouseTransition::DoubleClick => flags.double_click = true,
        }
        self.changed.notify_all();
    }

    /// Block until `button` went down (`mouse_down`) or up. With
    /// `first_click` only a plain press counts as down; otherwise a double
    /// click does too. Flags stay set until the hook is removed, so a whole
    /// click recorded before the first wait satisfies both the down and the
    /// up wait. `alive` is polled every `slice`; a `false` ends the wait with
    /// [`HandlerError::PeerGone`].
    pub fn wait(
        &self,
        button: MouseButton,
        mouse_down: bool,
        first_click: bool,
        timeout: Duration,
        slice: Duration,
        alive: &mut dyn FnMut() -> bool,
    ) -> Result<(), HandlerError> {
        let started = Instant::now();
        let mut state = self.lock();
        loop {
            let flags = state.buttons[button as usize];
            let satisfied = match (mouse_down, first_click) {
                (true, true) => flags.down,
                (true, false) => flags.down || flags.double_click,
                (false, _) => flags.up,
            };
            if satisfied {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                let edge = if mouse_down { "down" } else { "up" };
                return Err(HandlerError::Timeout(format!(
                    "Failed to find {button} mouse {edge}"
                )));
            }

            let (guard, result) = self
                .changed
                .wait_timeout(state, slice.min(timeout - elapsed))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if result.timed_out() {
                drop(state);
                if !alive() {
                    return Err(HandlerError::PeerGone);
                }
                state = self.lock();
            }
        }
    }
}

#[cfg(windows)]
mod hook {
    use std::ffi::c_void;
    use std::sync::{Arc, Mutex, PoisonError};

    use ape_shared::{Handle, MouseButton};
    use tracing::{debug, warn};
    use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        CallNextHookEx, GetWindowThreadProcessId, HC_ACTION, HHOOK, MOUSEHOOKSTRUCT,
        SetWindowsHookExW, UnhookWindowsHookEx, WH_MOUSE, WM_LBUTTONDBLCLK, WM_LBUTTONDOWN,
        WM_LBUTTONUP, WM_MBUTTONDBLCLK, WM_MBUTTONDOWN, WM_MBUTTONUP, WM_NCLBUTTONDBLCLK,
        WM_NCLBUTTONDOWN, WM_NCLBUTTONUP, WM_NCMBUTTONDBLCLK, WM_NCMBUTTONDOWN, WM_NCMBUTTONUP,
        WM_NCRBUTTONDBLCLK, WM_NCRBUTTONDOWN, WM_NCRBUTTONUP, WM_RBUTTONDBLCLK, WM_RBUTTONDOWN,
        WM_RBUTTONUP,
    };

    use super::{InputMonitor, MouseTransition};
    use crate::error::HandlerError;

    /// Monitor the hook procedure reports into
    static MONITOR: Mutex<Option<Arc<InputMonitor>>> = Mutex::new(None);

    fn classify(message: u32) -> Option<(MouseButton, MouseTransition)> {
        use MouseButton::*;
        use MouseTransition::*;
        Some(match message {
            WM_LBUTTONDOWN | WM_NCLBUTTONDOWN => (Left, Down),
            WM_LBUTTONUP | WM_NCLBUTTONUP => (Left, Up),
            WM_LBUTTONDBLCLK | WM_NCLBUTTONDBLCLK => (Left, DoubleClick),
            WM_RBUTTONDOWN | WM_NCRBUTTONDOWN => (Right, Down),
            WM_RBUTTONUP | WM_NCRBUTTONUP => (Right, Up),
            WM_RBUTTONDBLCLK | WM_NCRBUTTONDBLCLK => (Right, DoubleClick),
            WM_MBUTTONDOWN | WM_NCMBUTTONDOWN => (Middle, Down),
            WM_MBUTTONUP | WM_NCMBUTTONUP => (Middle, Up),
            WM_MBUTTONDBLCLK | WM_NCMBUTTONDBLCLK => (Middle, DoubleClick),
            _ => return None,
        })
    }

    unsafe extern "system" fn mouse_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        if code == HC_ACTION as i32
            && let Some((button, transition)) = classify(wparam.0 as u32)
        {
            // SAFETY: for HC_ACTION, lparam points at a MOUSEHOOKSTRUCT
            let info = unsafe { &*(lparam.0 as *const MOUSEHOOKSTRUCT) };
            let monitor = MONITOR.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(monitor) = monitor {
                monitor.record(Handle(info.hwnd.0 as usize as u64), button, transition);
            }
        }
        unsafe { CallNextHookEx(None, code, wparam, lparam) }
    }

    /// Installed `WH_MOUSE` hook on the thread owning one window
    pub struct MouseHook {
        hook: HHOOK,
    }

    // SAFETY: unhooking is allowed from any thread of the process
    unsafe impl Send for MouseHook {}

    impl MouseHook {
        /// Hook the thread that owns `window`, reporting into `monitor`
        pub fn install(window: Handle, monitor: Arc<InputMonitor>) -> Result<Self, HandlerError> {
            let hwnd = HWND(window.0 as usize as *mut c_void);
            let thread_id = unsafe { GetWindowThreadProcessId(hwnd, None) };
            if thread_id == 0 {
                return Err(HandlerError::InvalidOperation(format!(
                    "window {window} has no owning thread"
                )));
            }

            *MONITOR.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
            match unsafe { SetWindowsHookExW(WH_MOUSE, Some(mouse_proc), None, thread_id) } {
                Ok(hook) => {
                    debug!(%window, thread_id, "mouse hook installed");
                    Ok(Self { hook })
                }
                Err(e) => {
                    MONITOR.lock().unwrap_or_else(PoisonError::into_inner).take();
                    warn!(%window, error = %e, "SetWindowsHookEx failed");
                    Err(HandlerError::InvalidOperation(format!(
                        "failed to hook window {window}: {e}"
                    )))
                }
            }
        }
    }

    impl Drop for MouseHook {
        fn drop(&mut self) {
            unsafe {
                let _ = UnhookWindowsHookEx(self.hook);
            }
            MONITOR.lock().unwrap_or_else(PoisonError::into_inner).take();
            debug!("mouse hook removed");
        }
    }
}

#[cfg(not(windows))]
mod hook {
    use std::sync::Arc;

    use ape_shared::Handle;
    use tracing::debug;

    use super::InputMonitor;
    use crate::error::HandlerError;

    /// Hook stand-in; the host reports transitions through [`InputMonitor::record`]
    pub struct MouseHook {
        _monitor: Arc<InputMonitor>,
    }

    impl MouseHook {
        /// Start accepting transitions for `window`
        pub fn install(window: Handle, monitor: Arc<InputMonitor>) -> Result<Self, HandlerError> {
            debug!(%window, "input monitor attached");
            Ok(Self { _monitor: monitor })
        }
    }
}

/// Hook plus monitor, owned by the dispatch loop
pub(crate) struct InputHooks {
    monitor: std::sync::Arc<InputMonitor>,
    hook: Option<MouseHook>,
}

impl InputHooks {
    pub(crate) fn new(monitor: std::sync::Arc<InputMonitor>) -> Self {
        Self {
            monitor,
            hook: None,
        }
    }

    pub(crate) fn monitor(&self) -> &std::sync::Arc<InputMonitor> {
        &self.monitor
    }

    pub(crate) fn add(&mut self, window: Handle) -> Result<(), HandlerError> {
        self.remove();
        self.monitor.start(window);
        match MouseHook::install(window, self.monitor.clone()) {
            Ok(hook) => {
                self.hook = Some(hook);
                Ok(())
            }
            Err(e) => {
                self.monitor.stop();
                Err(e)
            }
        }
    }

    /// False when no hook was installed
    pub(crate) fn remove(&mut self) -> bool {
        let removed = self.hook.take().is_some();
        if removed {
            self.monitor.stop();
            debug!("input hook removed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Handle = Handle(0x42);

    fn wait(monitor: &InputMonitor, down: bool, first: bool, timeout_ms: u64) -> Result<(), HandlerError> {
        monitor.wait(
            MouseButton::Left,
            down,
            first,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
            &mut || true,
        )
    }

    #[test]
    fn test_down_then_up() {
        let monitor = InputMonitor::new();
        monitor.start(WINDOW);
        monitor.record(WINDOW, MouseButton::Left, MouseTransition::Down);
        assert!(wait(&monitor, true, true, 50).is_ok());
        // A satisfied wait leaves the flags in place
        assert!(wait(&monitor, true, true, 20).is_ok());
        assert!(wait(&monitor, false, false, 20).is_err());

        monitor.record(WINDOW, MouseButton::Left, MouseTransition::Up);
        assert!(wait(&monitor, false, false, 50).is_ok());
    }

    #[test]
    fn test_click_before_waits_satisfies_down_and_up() {
        let monitor = InputMonitor::new();
        monitor.start(WINDOW);
        monitor.record(WINDOW, MouseButton::Left, MouseTransition::Down);
        monitor.record(WINDOW, MouseButton::Left, MouseTransition::Up);

        assert!(wait(&monitor, true, true, 50).is_ok());
        assert!(wait(&monitor, false, false, 50).is_ok());

        // Re-arming the hook starts from a clean state
        monitor.start(WINDOW);
        assert!(wait(&monitor, false, false, 20).is_err());
    }

    #[test]
    fn test_double_click_only_counts_without_first_click() {
        let monitor = InputMonitor::new();
        monitor.start(WINDOW);
        monitor.record(WINDOW, MouseButton::Left, MouseTransition::DoubleClick);
        assert!(wait(&monitor, true, true, 20).is_err());
        assert!(wait(&monitor, true, false, 20).is_ok());
    }

    #[test]
    fn test_other_windows_and_buttons_ignored() {
        let monitor = InputMonitor::new();
        monitor.start(WINDOW);
        monitor.record(Handle(7), MouseButton::Left, MouseTransition::Down);
        monitor.record(WINDOW, MouseButton::Right, MouseTransition::Down);
        let err = wait(&monitor, true, true, 30).unwrap_err();
        assert_eq!(err.to_string(), "Failed to find Left mouse down");
    }

    #[test]
    fn test_wait_wakes_on_event_from_other_thread() {
        let monitor = Arc::new(InputMonitor::new());
        monitor.start(WINDOW);
        let feeder = monitor.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            feeder.record(WINDOW, MouseButton::Left, MouseTransition::Up);
        });
        assert!(wait(&monitor, false, false, 2_000).is_ok());
    }

    #[test]
    fn test_wait_aborts_when_controller_gone() {
        let monitor = InputMonitor::new();
        monitor.start(WINDOW);
        let started = Instant::now();
        let err = monitor
            .wait(
                MouseButton::Middle,
                true,
                false,
                Duration::from_secs(10),
                Duration::from_millis(10),
                &mut || false,
            )
            .unwrap_err();
        assert!(matches!(err, HandlerError::PeerGone));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_discards_state() {
        let monitor = InputMonitor::new();
        monitor.start(WINDOW);
        monitor.record(WINDOW, MouseButton::Left, MouseTransition::Down);
        monitor.stop();
        assert_eq!(monitor.window(), None);
        monitor.record(WINDOW, MouseButton::Left, MouseTransition::Down);
        assert!(wait(&monitor, true, true, 20).is_err());
    }
}
