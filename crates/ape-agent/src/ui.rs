//! The hosted application as seen by the agent
//!
//! [`UiHost`] enumerates windows and controls; [`Dispatcher`] runs work on
//! the thread that owns them. Every call into host objects goes through
//! [`invoke`], never directly from the dispatch loop's thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread::{JoinHandle, ThreadId};

use ape_shared::{DEFAULT_DOMAIN, Handle, Technology};
use tracing::debug;

use crate::error::{HandlerError, panic_message};
use crate::object::Object;

/// Snapshot of one window or control
#[derive(Debug, Clone)]
pub struct UiElement {
    /// OS handle
    pub handle: Handle,
    /// Containing window, null for top-level windows
    pub parent: Handle,
    /// UI technology, when known
    pub technology: Option<Technology>,
    /// Control name
    pub name: Option<String>,
    /// Namespace of the control's type
    pub type_namespace: Option<String>,
    /// Name of the control's type
    pub type_name: Option<String>,
    /// Module declaring the type
    pub module_name: Option<String>,
    /// Assembly declaring the type
    pub assembly_name: Option<String>,
    /// Display text
    pub text: Option<String>,
    /// Visible on screen
    pub visible: bool,
    /// The control itself
    pub object: Object,
}

impl UiElement {
    /// Visible element with no criteria filled in
    pub fn new(handle: Handle, object: Object) -> Self {
        Self {
            handle,
            parent: Handle::NULL,
            technology: None,
            name: None,
            type_namespace: None,
            type_name: None,
            module_name: None,
            assembly_name: None,
            text: None,
            visible: true,
            object,
        }
    }

    /// Set the containing window
    pub fn parent(mut self, parent: Handle) -> Self {
        self.parent = parent;
        self
    }

    /// Set the control name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the display text
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the technology
    pub fn technology(mut self, technology: Technology) -> Self {
        self.technology = Some(technology);
        self
    }

    /// Set the type description
    pub fn type_info(
        mut self,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        module_name: impl Into<String>,
        assembly_name: impl Into<String>,
    ) -> Self {
        self.type_namespace = Some(namespace.into());
        self.type_name = Some(type_name.into());
        self.module_name = Some(module_name.into());
        self.assembly_name = Some(assembly_name.into());
        self
    }

    /// Mark as hidden
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// The application the agent is hosted in
///
/// Enumeration methods are always called on the UI thread.
pub trait UiHost: Send + Sync {
    /// Top-level windows, in z-order
    fn top_level(&self) -> Vec<UiElement>;

    /// Direct children of `parent`
    fn children(&self, parent: Handle) -> Vec<UiElement>;

    /// Element owning `handle`
    fn resolve(&self, handle: Handle) -> Option<UiElement>;

    /// All descendants of `parent`, depth first
    fn descendants(&self, parent: Handle) -> Vec<UiElement> {
        let mut found = Vec::new();
        let mut pending = self.children(parent);
        pending.reverse();
        while let Some(element) = pending.pop() {
            let mut children = self.children(element.handle);
            children.reverse();
            found.push(element);
            pending.append(&mut children);
        }
        found
    }

    /// True when `handle` lies somewhere below `ancestor`
    fn is_child(&self, ancestor: Handle, handle: Handle) -> bool {
        let mut current = self.resolve(handle).map(|e| e.parent);
        while let Some(parent) = current {
            if parent.is_null() {
                return false;
            }
            if parent == ancestor {
                return true;
            }
            current = self.resolve(parent).map(|e| e.parent);
        }
        false
    }

    /// True when both handles share a parent
    fn is_sibling(&self, sibling: Handle, handle: Handle) -> bool {
        match (self.resolve(sibling), self.resolve(handle)) {
            (Some(a), Some(b)) => a.handle != b.handle && a.parent == b.parent,
            _ => false,
        }
    }

    /// Collect garbage up to `generation`
    fn collect_garbage(&self, _generation: i32) {}

    /// Logical domains in the process
    fn domain_names(&self) -> Vec<String> {
        vec![DEFAULT_DOMAIN.to_string()]
    }

    /// Full path of the module that created `window`
    fn module_filename(&self, window: Handle) -> Option<String> {
        window_module_path(window)
    }
}

#[cfg(windows)]
fn window_module_path(window: Handle) -> Option<String> {
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging::GetWindowModuleFileNameW;

    let mut buffer = [0u16; 1024];
    // SAFETY: the buffer outlives the call; an unknown handle yields 0
    let len = unsafe {
        GetWindowModuleFileNameW(HWND(window.0 as usize as *mut std::ffi::c_void), &mut buffer)
    } as usize;
    (len > 0).then(|| String::from_utf16_lossy(&buffer[..len.min(buffer.len())]))
}

#[cfg(not(windows))]
fn window_module_path(_window: Handle) -> Option<String> {
    None
}

/// Work queued onto the UI thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on the thread that owns the host's UI objects
pub trait Dispatcher: Send + Sync {
    /// True when called from the UI thread itself
    fn is_ui_thread(&self) -> bool;

    /// Queue `job` for the UI thread
    fn post(&self, job: Job) -> Result<(), HandlerError>;
}

/// Run `f` on the UI thread and wait for its result. Panics in `f` come back
/// as [`HandlerError::Panic`].
pub fn invoke<R, F>(dispatcher: &dyn Dispatcher, f: F) -> Result<R, HandlerError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    if dispatcher.is_ui_thread() {
        return catch_unwind(AssertUnwindSafe(f)).map_err(|p| HandlerError::Panic(panic_message(p)));
    }

    let (tx, rx) = mpsc::sync_channel(1);
    dispatcher.post(Box::new(move || {
        let result = catch_unwind(AssertUnwindSafe(f)).map_err(panic_message);
        let _ = tx.send(result);
    }))?;

    match rx.recv() {
        Ok(result) => result.map_err(HandlerError::Panic),
        // Job dropped unrun
        Err(_) => Err(HandlerError::DispatcherGone),
    }
}

/// Dispatcher for hosts whose objects may be used from any thread
pub struct Inline;

impl Dispatcher for Inline {
    fn is_ui_thread(&self) -> bool {
        true
    }

    fn post(&self, job: Job) -> Result<(), HandlerError> {
        job();
        Ok(())
    }
}

/// Dedicated thread pumping posted jobs in order
pub struct UiThread {
    sender: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    id: ThreadId,
}

impl UiThread {
    /// Start the pump thread
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;
        let id = thread.thread().id();
        debug!(name, "UI thread started");
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            id,
        })
    }
}

impl Dispatcher for UiThread {
    fn is_ui_thread(&self) -> bool {
        std::thread::current().id() == self.id
    }

    fn post(&self, job: Job) -> Result<(), HandlerError> {
        self.sender
            .as_ref()
            .ok_or(HandlerError::DispatcherGone)?
            .send(job)
            .map_err(|_| HandlerError::DispatcherGone)
    }
}

impl Drop for UiThread {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take()
            && thread.thread().id() != std::thread::current().id()
        {
            let _ = thread.join();
        }
    }
}
