//! Finding controls by identifier criteria
//!
//! A search pass runs on the UI thread against a fresh enumeration; passes
//! repeat at a fixed interval until a match turns up or the timeout passes.
//! Criteria are checked in a fixed order (name, technology, type namespace,
//! type name, module, assembly, ancestry, text) before the ordinal index is
//! counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ape_shared::{ControlIdentifier, Handle};
use regex::Regex;
use tracing::{debug, trace};

use crate::error::HandlerError;
use crate::ui::{Dispatcher, UiElement, UiHost, invoke};

/// A located control and the identifier reported back for it
#[derive(Debug, Clone)]
pub struct Found {
    /// The control
    pub element: UiElement,
    /// Identity sent to the controller
    pub identifier: ControlIdentifier,
}

struct Criteria {
    ident: ControlIdentifier,
    text: Option<Regex>,
}

fn wanted(want: &Option<String>, got: &Option<String>) -> bool {
    want.as_ref().is_none_or(|w| got.as_ref() == Some(w))
}

impl Criteria {
    fn new(ident: ControlIdentifier) -> Result<Self, HandlerError> {
        let text = ident.text.as_deref().map(Regex::new).transpose()?;
        Ok(Self { ident, text })
    }

    fn matches_type(&self, e: &UiElement) -> bool {
        let ident = &self.ident;
        wanted(&ident.name, &e.name)
            && ident.technology.is_none_or(|t| e.technology == Some(t))
            && wanted(&ident.type_namespace, &e.type_namespace)
            && wanted(&ident.type_name, &e.type_name)
            && wanted(&ident.module_name, &e.module_name)
            && wanted(&ident.assembly_name, &e.assembly_name)
    }

    // A control without text never matches a pattern
    fn matches_text(&self, e: &UiElement) -> bool {
        match &self.text {
            None => true,
            Some(re) => e.text.as_deref().is_some_and(|t| re.is_match(t)),
        }
    }

    fn counts(&self, seen: &mut u32) -> bool {
        *seen += 1;
        self.ident.index == 0 || *seen == self.ident.index
    }

    fn scan(&self, host: &dyn UiHost) -> Option<UiElement> {
        let ident = &self.ident;
        let mut seen = 0;

        if ident.parent_handle.is_null() {
            for e in host.top_level() {
                if !self.matches_type(&e) || !self.matches_text(&e) {
                    continue;
                }
                if self.counts(&mut seen) && e.visible {
                    return Some(e);
                }
            }
            return None;
        }

        host.descendants(ident.parent_handle)
            .into_iter()
            .filter(|e| e.visible && self.matches_type(e))
            .filter(|e| ident.child_of.is_null() || host.is_child(ident.child_of, e.handle))
            .filter(|e| ident.sibling_of.is_null() || host.is_sibling(ident.sibling_of, e.handle))
            .filter(|e| self.matches_text(e))
            .find(|_| self.counts(&mut seen))
    }
}

fn top_level_of(host: &dyn UiHost, element: &UiElement) -> Handle {
    let mut top = element.handle;
    let mut parent = element.parent;
    while !parent.is_null() {
        top = parent;
        parent = host.resolve(parent).map_or(Handle::NULL, |e| e.parent);
    }
    if top == element.handle { Handle::NULL } else { top }
}

/// Locate and relocate against one host
pub struct Locator<'a> {
    host: &'a Arc<dyn UiHost>,
    dispatcher: &'a dyn Dispatcher,
    timeout: Duration,
    interval: Duration,
}

impl<'a> Locator<'a> {
    /// Search `host`, polling every `interval` for up to `timeout`
    pub fn new(
        host: &'a Arc<dyn UiHost>,
        dispatcher: &'a dyn Dispatcher,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            host,
            dispatcher,
            timeout,
            interval,
        }
    }

    /// Element owning `handle`
    pub fn resolve(&self, handle: Handle) -> Result<Option<UiElement>, HandlerError> {
        let host = self.host.clone();
        invoke(self.dispatcher, move || host.resolve(handle))
    }

    /// First control matching `ident`, or `None` once the timeout passed
    pub fn find(&self, ident: &ControlIdentifier) -> Result<Option<Found>, HandlerError> {
        if !ident.handle.is_null() {
            let host = self.host.clone();
            let handle = ident.handle;
            let top_level = ident.parent_handle.is_null();
            let resolved = invoke(self.dispatcher, move || {
                host.resolve(handle).map(|e| {
                    let parent = if top_level { top_level_of(&*host, &e) } else { Handle::NULL };
                    (e, parent)
                })
            })?;
            return Ok(resolved.map(|(element, top)| {
                let parent = if top_level { top } else { ident.parent_handle };
                self.found(ident, element, parent)
            }));
        }

        let criteria = Arc::new(Criteria::new(ident.clone())?);
        let started = Instant::now();
        let mut passes = 0u32;
        loop {
            passes += 1;
            let host = self.host.clone();
            let pass = criteria.clone();
            if let Some(element) = invoke(self.dispatcher, move || pass.scan(&*host))? {
                debug!(handle = %element.handle, passes, "control located");
                return Ok(Some(self.found(ident, element, ident.parent_handle)));
            }
            if started.elapsed() >= self.timeout {
                debug!(passes, name = ?ident.name, "locate timed out");
                return Ok(None);
            }
            trace!(passes, "no match yet");
            std::thread::sleep(self.interval);
        }
    }

    fn found(&self, ident: &ControlIdentifier, element: UiElement, parent: Handle) -> Found {
        let identifier = ControlIdentifier {
            parent_handle: parent,
            handle: element.handle,
            name: element.name.clone(),
            technology: element.technology,
            type_namespace: element.type_namespace.clone(),
            type_name: element.type_name.clone(),
            module_name: element.module_name.clone(),
            assembly_name: element.assembly_name.clone(),
            index: ident.index,
            text: element.text.clone(),
            child_of: ident.child_of,
            sibling_of: ident.sibling_of,
        };
        Found {
            element,
            identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use crate::ui::{Inline, UiThread};
    use ape_shared::Technology;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Desktop {
        shown: AtomicBool,
    }

    fn form(handle: u64, name: &str, text: &str) -> UiElement {
        UiElement::new(Handle(handle), Object::new(handle))
            .name(name)
            .text(text)
            .technology(Technology::WinForms)
            .type_info("Demo", "Form", "demo.exe", "Demo")
    }

    fn child(handle: u64, parent: u64, name: &str) -> UiElement {
        UiElement::new(Handle(handle), Object::new(handle))
            .parent(Handle(parent))
            .name(name)
            .type_info("Demo", "Button", "demo.exe", "Demo")
    }

    impl UiHost for Desktop {
        fn top_level(&self) -> Vec<UiElement> {
            let mut windows = vec![
                form(1, "MainForm", "Hello"),
                form(2, "Dialog", "first").hidden(),
                form(3, "Dialog", "second"),
                form(4, "Dialog", "third"),
            ];
            if self.shown.load(Ordering::SeqCst) {
                windows.push(form(5, "Late", ""));
            }
            windows
        }

        fn children(&self, parent: Handle) -> Vec<UiElement> {
            match parent.0 {
                1 => vec![
                    child(10, 1, "ok").hidden(),
                    child(11, 1, "ok").text("OK"),
                    child(12, 1, "panel"),
                ],
                12 => vec![child(13, 12, "ok").text("Nested")],
                _ => vec![],
            }
        }

        fn resolve(&self, handle: Handle) -> Option<UiElement> {
            match handle.0 {
                1 => Some(form(1, "MainForm", "Hello")),
                11 => Some(child(11, 1, "ok")),
                12 => Some(child(12, 1, "panel")),
                13 => Some(child(13, 12, "ok")),
                _ => None,
            }
        }
    }

    fn host() -> Arc<dyn UiHost> {
        Arc::new(Desktop {
            shown: AtomicBool::new(false),
        })
    }

    fn locate(host: &Arc<dyn UiHost>, ident: &ControlIdentifier) -> Option<Found> {
        Locator::new(host, &Inline, Duration::from_millis(100), Duration::from_millis(15))
            .find(ident)
            .unwrap()
    }

    #[test]
    fn test_top_level_by_name() {
        let host = host();
        let found = locate(&host, &ControlIdentifier::named("MainForm")).unwrap();
        assert_eq!(found.element.handle, Handle(1));
        assert_eq!(found.identifier.text.as_deref(), Some("Hello"));
        assert_eq!(found.identifier.type_name.as_deref(), Some("Form"));
        assert_eq!(found.identifier.technology, Some(Technology::WinForms));
    }

    #[test]
    fn test_index_counts_hidden_top_level_windows() {
        let host = host();
        // The hidden first dialog still takes index 1
        let first = locate(&host, &ControlIdentifier::named("Dialog").nth(1));
        assert!(first.is_none());
        let second = locate(&host, &ControlIdentifier::named("Dialog").nth(2)).unwrap();
        assert_eq!(second.element.handle, Handle(3));
        assert_eq!(second.identifier.index, 2);
        // Index 0 takes the first visible match
        let any = locate(&host, &ControlIdentifier::named("Dialog")).unwrap();
        assert_eq!(any.element.handle, Handle(3));
    }

    #[test]
    fn test_text_is_a_regex() {
        let host = host();
        let found = locate(&host, &ControlIdentifier::default().with_text("^th")).unwrap();
        assert_eq!(found.element.handle, Handle(4));

        let bad = Locator::new(&host, &Inline, Duration::ZERO, Duration::ZERO)
            .find(&ControlIdentifier::default().with_text("("));
        assert!(matches!(bad, Err(HandlerError::Pattern(_))));
    }

    #[test]
    fn test_children_skip_hidden_before_counting() {
        let host = host();
        let ident = ControlIdentifier::named("ok").under(Handle(1));
        let found = locate(&host, &ident).unwrap();
        assert_eq!(found.element.handle, Handle(11));
        assert_eq!(found.identifier.parent_handle, Handle(1));

        let second = locate(&host, &ident.clone().nth(2)).unwrap();
        assert_eq!(second.element.handle, Handle(13));
    }

    #[test]
    fn test_children_ancestry() {
        let host = host();
        let mut ident = ControlIdentifier::named("ok").under(Handle(1));
        ident.child_of = Handle(12);
        assert_eq!(locate(&host, &ident).unwrap().element.handle, Handle(13));

        let mut ident = ControlIdentifier::named("ok").under(Handle(1));
        ident.sibling_of = Handle(12);
        assert_eq!(locate(&host, &ident).unwrap().element.handle, Handle(11));
    }

    #[test]
    fn test_by_handle_reports_top_level() {
        let host = host();
        let found = locate(&host, &ControlIdentifier::from_handle(Handle(13))).unwrap();
        assert_eq!(found.identifier.parent_handle, Handle(1));
        assert_eq!(found.identifier.name.as_deref(), Some("ok"));

        let form = locate(&host, &ControlIdentifier::from_handle(Handle(1))).unwrap();
        assert!(form.identifier.parent_handle.is_null());

        assert!(locate(&host, &ControlIdentifier::from_handle(Handle(99))).is_none());
    }

    #[test]
    fn test_not_found_waits_for_timeout() {
        let host = host();
        let locator = Locator::new(&host, &Inline, Duration::from_millis(200), Duration::from_millis(15));
        let started = Instant::now();
        assert!(locator.find(&ControlIdentifier::named("Missing")).unwrap().is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(200 + 15 * 10), "{elapsed:?}");
    }

    #[test]
    fn test_window_appearing_mid_search() {
        let desktop = Arc::new(Desktop {
            shown: AtomicBool::new(false),
        });
        let flip = desktop.clone();
        let host: Arc<dyn UiHost> = desktop;
        let ui = UiThread::spawn("locate-ui").unwrap();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            flip.shown.store(true, Ordering::SeqCst);
        });

        let found = Locator::new(&host, &ui, Duration::from_secs(5), Duration::from_millis(15))
            .find(&ControlIdentifier::named("Late"))
            .unwrap()
            .unwrap();
        assert_eq!(found.element.handle, Handle(5));
    }
}
