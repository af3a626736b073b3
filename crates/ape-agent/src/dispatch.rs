//! The agent's batch loop
//!
//! Each turn: wait for the controller, run the batch's commands in order,
//! write the outputs and one trailing result record, drop every object
//! slot, hand the turn back.
//!
//! Outputs go to an output index that trails the request index, so a reply
//! never overwrites a request that has not been read yet. Output strings are
//! appended after the request payload in the arena for the same reason.

use std::fmt::Write as _;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ape_shared::{
    Action, BatchOutcome, Bootstrap, Channel, ChannelId, ControlIdentifier, Error, Handle,
    Handshake, MAX_MESSAGES, MAX_PARAMETERS, MemberKind, MessageStore, MouseButton, ObjectSlot,
    PeerLiveness, ProcessWatch, Result, Role, StringArena, TypeTag, Value, signature_key,
};
use tracing::{debug, trace, warn};

use crate::AgentConfig;
use crate::cache::InvocationCache;
use crate::error::{HandlerError, panic_message};
use crate::input::{InputHooks, InputMonitor};
use crate::locate::Locator;
use crate::object::{Item, Object};
use crate::registry::TypeRegistry;
use crate::slots::ObjectTable;
use crate::ui::{Dispatcher, Inline, UiHost, invoke};

/// What the loop does after a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Teardown,
}

enum Step {
    Done,
    Reply(Vec<Value>),
    Teardown,
}

/// One request record, copied out of shared memory before it runs
struct Request {
    action: Action,
    source: u32,
    dest: u32,
    member_kind: u32,
    name: Option<String>,
    params: Vec<Value>,
    signature: u64,
}

impl Request {
    fn read(store: &MessageStore<'_>, arena: &StringArena<'_>, index: usize) -> Result<Self> {
        let record = store.record(index)?;
        let count = record.parameter_count as usize;
        if count > MAX_PARAMETERS {
            return Err(Error::MalformedMessage(format!(
                "record {index} claims {count} parameters"
            )));
        }
        let name = arena.read(record.name_offset as u32, record.name_length)?;
        let params = record.parameters[..count]
            .iter()
            .map(|slot| Value::decode(slot, arena))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            action: Action::try_from(record.action)?,
            source: record.source_slot,
            dest: record.dest_slot,
            member_kind: record.member_kind,
            name,
            params,
            signature: record.signature_key,
        })
    }

    fn param(&self, index: usize) -> Result<&Value, HandlerError> {
        self.params.get(index).ok_or_else(|| {
            HandlerError::InvalidOperation(format!("{:?} needs parameter {index}", self.action))
        })
    }

    fn handle(&self, index: usize) -> Result<Handle, HandlerError> {
        let value = self.param(index)?;
        value
            .as_handle()
            .ok_or_else(|| HandlerError::mismatch("Handle", value))
    }

    fn int32(&self, index: usize) -> Result<i32, HandlerError> {
        match self.param(index)? {
            Value::Int32(v) => Ok(*v),
            other => Err(HandlerError::mismatch("Int32", other)),
        }
    }

    fn uint32(&self, index: usize) -> Result<u32, HandlerError> {
        match self.param(index)? {
            Value::UInt32(v) => Ok(*v),
            other => Err(HandlerError::mismatch("UInt32", other)),
        }
    }

    fn boolean(&self, index: usize) -> Result<bool, HandlerError> {
        let value = self.param(index)?;
        value
            .as_bool()
            .ok_or_else(|| HandlerError::mismatch("Boolean", value))
    }

    fn source(&self) -> Result<ObjectSlot, HandlerError> {
        Ok(ObjectSlot::new(self.source as usize)?)
    }

    fn dest(&self) -> Result<ObjectSlot, HandlerError> {
        Ok(ObjectSlot::new(self.dest as usize)?)
    }

    fn member_kind(&self) -> Result<MemberKind, HandlerError> {
        Ok(MemberKind::try_from(self.member_kind)?)
    }

    fn tags(&self) -> Vec<TypeTag> {
        self.params.iter().map(Value::tag).collect()
    }
}

/// Output position within the current turn
struct Responder {
    next: usize,
    cursor: usize,
}

impl Responder {
    fn push(
        &mut self,
        store: &mut MessageStore<'_>,
        arena: &mut StringArena<'_>,
        values: &[Value],
    ) -> Result<()> {
        let record = store.record_mut(self.next)?;
        record.clear();
        for (slot, value) in record.parameters.iter_mut().zip(values) {
            value.encode(slot, arena, &mut self.cursor)?;
        }
        record.parameter_count = values.len().min(MAX_PARAMETERS) as u32;
        self.next += 1;
        Ok(())
    }
}

struct Failure {
    error: HandlerError,
    action: Action,
    index: usize,
}

impl Failure {
    fn into_outcome(self, count: usize) -> BatchOutcome {
        let mut stack = format!(
            "at {:?} (message {} of {count})",
            self.action,
            self.index + 1
        );
        let mut cause = std::error::Error::source(&self.error);
        while let Some(inner) = cause {
            let _ = write!(stack, "\r\ncaused by: {inner}");
            cause = inner.source();
        }
        BatchOutcome::Failure {
            type_name: self.error.type_name().to_string(),
            message: self.error.to_string(),
            stack,
        }
    }
}

/// Last component of a module path, whichever separator it uses
fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

fn must_be_first(index: usize, action: Action) -> Result<(), HandlerError> {
    if index == 0 {
        Ok(())
    } else {
        Err(HandlerError::InvalidOperation(format!(
            "{action:?} must be the first message"
        )))
    }
}

/// Per-agent execution state
pub(crate) struct Dispatch {
    host: Arc<dyn UiHost>,
    registry: Arc<TypeRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    config: AgentConfig,
    slots: ObjectTable,
    cache: InvocationCache,
    input: InputHooks,
}

impl Dispatch {
    fn new(host: Arc<dyn UiHost>, registry: Arc<TypeRegistry>, config: AgentConfig) -> Self {
        Self {
            host,
            registry,
            dispatcher: Arc::new(Inline),
            config,
            slots: ObjectTable::new(),
            cache: InvocationCache::new(),
            input: InputHooks::new(Arc::new(InputMonitor::new())),
        }
    }

    /// Run the batch currently in `channel` and write its response
    pub(crate) fn run_batch(
        &mut self,
        channel: &mut Channel,
        alive: &mut dyn FnMut() -> bool,
    ) -> Result<Flow> {
        let (mut store, mut arena) = channel.parts()?;
        let count = store.count();
        let mut out = Responder {
            next: 0,
            cursor: store.arena_cursor(),
        };
        debug!(count, "batch received");

        let outcome = match self.execute_all(count, &mut store, &mut arena, &mut out, alive) {
            Ok(Flow::Teardown) => {
                self.slots.clear_all();
                return Ok(Flow::Teardown);
            }
            Ok(Flow::Continue) => BatchOutcome::Success,
            Err(failure) => {
                warn!(
                    index = failure.index,
                    action = ?failure.action,
                    error = %failure.error,
                    "batch failed"
                );
                store.clear_all();
                out = Responder { next: 0, cursor: 0 };
                failure.into_outcome(count)
            }
        };

        outcome.encode(store.record_mut(out.next)?, &mut arena, &mut out.cursor)?;
        store.set_count(out.next + 1);
        store.set_arena_cursor(out.cursor);
        self.slots.clear_all();
        debug!(outputs = out.next, success = outcome == BatchOutcome::Success, "batch answered");
        Ok(Flow::Continue)
    }

    fn execute_all(
        &mut self,
        count: usize,
        store: &mut MessageStore<'_>,
        arena: &mut StringArena<'_>,
        out: &mut Responder,
        alive: &mut dyn FnMut() -> bool,
    ) -> Result<Flow, Failure> {
        let fail = |error: HandlerError, action, index| Failure {
            error,
            action,
            index,
        };
        if count > MAX_MESSAGES {
            let error = Error::BatchCapacity {
                capacity: MAX_MESSAGES,
            };
            return Err(fail(error.into(), Action::None, 0));
        }

        for index in 0..count {
            let request =
                Request::read(store, arena, index).map_err(|e| fail(e.into(), Action::None, index))?;
            let action = request.action;
            store
                .record_mut(index)
                .map_err(|e| fail(e.into(), action, index))?
                .action = Action::None as u32;
            trace!(index, ?action, "dispatching");

            let step = catch_unwind(AssertUnwindSafe(|| self.execute(index, request, &mut *alive)))
                .unwrap_or_else(|payload| Err(HandlerError::Panic(panic_message(payload))))
                .map_err(|e| fail(e, action, index))?;

            match step {
                Step::Done => {}
                Step::Reply(values) => out
                    .push(store, arena, &values)
                    .map_err(|e| fail(e.into(), action, index))?,
                Step::Teardown => return Ok(Flow::Teardown),
            }
        }
        Ok(Flow::Continue)
    }

    fn execute(
        &mut self,
        index: usize,
        request: Request,
        alive: &mut dyn FnMut() -> bool,
    ) -> Result<Step, HandlerError> {
        match request.action {
            Action::Locate => self.locate(&request),
            Action::Relocate => self.relocate(&request),
            Action::QueryMember => self.query_member(&request),
            Action::PollMember => self.poll_member(&request),
            Action::FetchResult => self.fetch_result(&request),
            Action::AddInputHook => {
                must_be_first(index, request.action)?;
                self.input.add(request.handle(0)?)?;
                Ok(Step::Done)
            }
            Action::RemoveInputHook => {
                if index == 0 {
                    return Err(HandlerError::InvalidOperation(
                        "RemoveInputHook must not be the first message".to_string(),
                    ));
                }
                request.handle(0)?;
                if !self.input.remove() {
                    return Err(HandlerError::InvalidOperation(
                        "no input hook is installed".to_string(),
                    ));
                }
                Ok(Step::Done)
            }
            Action::WaitForInputState => {
                must_be_first(index, request.action)?;
                let button = MouseButton::try_from(request.int32(0)? as u32)?;
                let mouse_down = request.boolean(1)?;
                let first_click = request.boolean(2)?;
                self.input.monitor().wait(
                    button,
                    mouse_down,
                    first_click,
                    self.config.timeout,
                    self.config.poll_interval,
                    alive,
                )?;
                Ok(Step::Done)
            }
            Action::GarbageCollect => {
                must_be_first(index, request.action)?;
                let generation = request.int32(0)?;
                self.host.collect_garbage(generation);
                std::thread::sleep(self.config.gc_settle);
                Ok(Step::Done)
            }
            Action::SetTimeouts => {
                must_be_first(index, request.action)?;
                self.config.timeout = Duration::from_millis(request.uint32(0)?.into());
                debug!(timeout = ?self.config.timeout, "timeout changed");
                Ok(Step::Done)
            }
            Action::GetAppDomains => {
                must_be_first(index, request.action)?;
                let names = self.host.domain_names().join("\t");
                Ok(Step::Reply(vec![Value::from(names)]))
            }
            Action::GetModuleFilename => {
                must_be_first(index, request.action)?;
                let window = request.handle(0)?;
                let path = self.host.module_filename(window).unwrap_or_default();
                debug!(%window, %path, "module file name");
                Ok(Step::Reply(vec![Value::from(file_name(&path).to_string())]))
            }
            Action::Teardown => Ok(Step::Teardown),
            Action::None | Action::Result => Err(HandlerError::Protocol(Error::UnsupportedOperand(
                format!("{:?} is not a request", request.action),
            ))),
        }
    }

    fn locator(&self) -> Locator<'_> {
        Locator::new(
            &self.host,
            &*self.dispatcher,
            self.config.timeout,
            self.config.locate_interval,
        )
    }

    fn holds_null(&self, slot: ObjectSlot) -> bool {
        matches!(self.slots.peek(slot), None | Some(Item::Value(Value::Empty)))
    }

    fn target(&self, slot: ObjectSlot) -> Result<Object, HandlerError> {
        match self.slots.get(slot)? {
            Item::Object(object) => Ok(object.clone()),
            Item::Value(value) => Err(HandlerError::mismatch(format!("an object in {slot}"), value)),
        }
    }

    fn locate(&mut self, request: &Request) -> Result<Step, HandlerError> {
        let dest = request.dest()?;
        let ident = ControlIdentifier::from_values(&request.params)?;
        let found = self
            .locator()
            .find(&ident)?
            .ok_or(HandlerError::ControlNotFound)?;
        self.slots.put(dest, Item::Object(found.element.object));
        Ok(Step::Reply(found.identifier.to_values().to_vec()))
    }

    fn relocate(&mut self, request: &Request) -> Result<Step, HandlerError> {
        let dest = request.dest()?;
        request.handle(0)?;
        let handle = request.handle(1)?;
        let element = self
            .locator()
            .resolve(handle)?
            .ok_or(HandlerError::ControlNotFound)?;
        self.slots.put(dest, Item::Object(element.object));
        Ok(Step::Done)
    }

    fn missing(&self, target: &Object, kind: MemberKind, name: &str, params: &[TypeTag]) -> HandlerError {
        HandlerError::MissingMember {
            type_name: self
                .registry
                .type_name(target.type_id())
                .unwrap_or(target.type_name())
                .to_string(),
            kind,
            name: name.to_string(),
            params: params.to_vec(),
        }
    }

    fn query_member(&mut self, request: &Request) -> Result<Step, HandlerError> {
        let kind = request.member_kind()?;
        let name = request.name.clone().unwrap_or_default();
        let dest = request.dest()?;

        // Member access on null yields null
        if kind != MemberKind::Constructor && self.holds_null(request.source()?) {
            trace!(member = %name, slot = %dest, "null source, null result");
            self.slots.put(dest, Item::null());
            return Ok(Step::Done);
        }

        let mut slot_refs = 0;
        let args = request
            .params
            .iter()
            .map(|value| match value {
                Value::Slot(slot) => {
                    slot_refs += 1;
                    self.slots.get(*slot).cloned()
                }
                other => Ok(Item::Value(other.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if slot_refs > 1 {
            return Err(HandlerError::InvalidOperation(
                "an invocation may reference at most one object slot".to_string(),
            ));
        }

        let tags: Arc<[TypeTag]> = if slot_refs == 0 {
            self.cache.parameter_types(request.signature, &request.tags())
        } else {
            request.tags().into()
        };

        let result = if kind == MemberKind::Constructor {
            let construct = self
                .cache
                .constructor(&self.registry, &name, &tags, request.signature)
                .ok_or_else(|| HandlerError::MissingConstructor {
                    type_name: name.clone(),
                    params: tags.to_vec(),
                })?;
            invoke(&*self.dispatcher, move || construct(&args))??
        } else {
            let target = self.target(request.source()?)?;
            let member = self
                .cache
                .member(&self.registry, target.type_id(), kind, &name, &tags, request.signature)
                .ok_or_else(|| self.missing(&target, kind, &name, &tags))?;
            invoke(&*self.dispatcher, move || member(&target, &args))??
        };

        trace!(member = %name, ?kind, slot = %dest, "member result stored");
        self.slots.put(dest, result);
        Ok(Step::Done)
    }

    fn poll_member(&mut self, request: &Request) -> Result<Step, HandlerError> {
        let kind = request.member_kind()?;
        if !matches!(kind, MemberKind::Field | MemberKind::Property) {
            return Err(HandlerError::InvalidOperation(format!(
                "cannot poll a {kind:?}"
            )));
        }
        let name = request.name.clone().unwrap_or_default();
        let expected = request.param(0)?.clone();
        let target = self.target(request.source()?)?;
        let getter = self
            .cache
            .member(&self.registry, target.type_id(), kind, &name, &[], signature_key(&[]))
            .ok_or_else(|| self.missing(&target, kind, &name, &[]))?;

        let started = Instant::now();
        loop {
            let (get, object) = (getter.clone(), target.clone());
            let current = match invoke(&*self.dispatcher, move || get(&object, &[]))?? {
                Item::Value(value) => value,
                Item::Object(object) => return Err(HandlerError::mismatch("a value", object)),
            };
            if current == expected {
                return Ok(Step::Done);
            }
            if started.elapsed() >= self.config.timeout {
                return Err(HandlerError::Timeout(format!(
                    "Polling failed to match item {name}: expected {expected:?}, last read {current:?}"
                )));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn fetch_result(&mut self, request: &Request) -> Result<Step, HandlerError> {
        let value = match self.slots.peek(request.source()?) {
            None => Value::Empty,
            Some(Item::Value(value)) => value.clone(),
            Some(Item::Object(object)) => {
                return Err(HandlerError::mismatch("a value to return", object));
            }
        };
        Ok(Step::Reply(vec![value]))
    }
}

/// Agent end of a channel
pub struct Agent<L: PeerLiveness = ProcessWatch> {
    channel: Channel,
    handshake: Handshake<L>,
    bootstrap: Option<Bootstrap>,
    dispatch: Dispatch,
}

impl Agent<ProcessWatch> {
    /// Attach to the channel a controller created for this process
    pub fn connect(
        controller_pid: u32,
        domain: &str,
        host: Arc<dyn UiHost>,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self> {
        let id = ChannelId::new(controller_pid, std::process::id(), domain);
        Self::connect_with(
            id,
            host,
            registry,
            ProcessWatch::new(controller_pid),
            AgentConfig::default(),
        )
    }
}

impl<L: PeerLiveness> Agent<L> {
    /// Attach to `id` with an explicit controller liveness check
    pub fn connect_with(
        id: ChannelId,
        host: Arc<dyn UiHost>,
        registry: Arc<TypeRegistry>,
        controller: L,
        config: AgentConfig,
    ) -> Result<Self> {
        let mut channel = Channel::open(id, false)?;
        let bootstrap = channel.take_bootstrap()?;
        if let Some(b) = &bootstrap {
            debug!(working_directory = %b.working_directory, domain = %b.domain, "bootstrap received");
        }
        Ok(Self {
            channel,
            handshake: Handshake::new(Role::Agent, controller, config.handshake),
            bootstrap,
            dispatch: Dispatch::new(host, registry, config),
        })
    }

    /// Run UI work through `dispatcher` instead of the calling thread
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatch.dispatcher = dispatcher;
        self
    }

    /// Startup information left by the controller, if any
    pub fn bootstrap(&self) -> Option<&Bootstrap> {
        self.bootstrap.as_ref()
    }

    /// Monitor fed by the input hook
    pub fn input_monitor(&self) -> Arc<InputMonitor> {
        self.dispatch.input.monitor().clone()
    }

    /// Serve batches until teardown (`Ok`) or until the controller exits
    /// (`Err(PeerExited)`). The channel is closed either way.
    pub fn run(mut self) -> Result<()> {
        debug!(channel = %self.channel.id(), "agent serving");
        let result = self.serve();
        self.dispatch.input.remove();
        self.dispatch.slots.clear_all();
        self.channel.close();
        result
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            self.handshake.wait(&self.channel)?;
            let handshake = &mut self.handshake;
            let flow = self
                .dispatch
                .run_batch(&mut self.channel, &mut || handshake.peer_alive())?;
            if flow == Flow::Teardown {
                debug!("teardown requested");
                return Ok(());
            }
            self.handshake.send(&self.channel)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{object_at, value_at};
    use crate::ui::UiElement;
    use ape_shared::{AlwaysAlive, Technology};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Window {
        text: Mutex<String>,
    }

    struct Desktop {
        main: Arc<Window>,
        collected: AtomicU32,
    }

    impl Desktop {
        fn element(&self) -> UiElement {
            UiElement::new(Handle(0x100), Object::from_arc(self.main.clone()))
                .name("MainForm")
                .text(self.main.text.lock().unwrap().clone())
                .technology(Technology::WinForms)
        }
    }

    impl UiHost for Desktop {
        fn top_level(&self) -> Vec<UiElement> {
            vec![self.element()]
        }

        fn children(&self, _parent: Handle) -> Vec<UiElement> {
            vec![]
        }

        fn resolve(&self, handle: Handle) -> Option<UiElement> {
            (handle == Handle(0x100)).then(|| self.element())
        }

        fn collect_garbage(&self, generation: i32) {
            self.collected.store(generation as u32 + 1, Ordering::SeqCst);
        }

        fn domain_names(&self) -> Vec<String> {
            vec!["DefaultDomain".into(), "Plugins".into()]
        }

        fn module_filename(&self, window: Handle) -> Option<String> {
            (window == Handle(0x100)).then(|| r"C:\Apps\Demo\demo.exe".to_string())
        }
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register::<Window>("Demo.Window")
            .property("Text", |w| Ok(Item::value(w.text.lock().unwrap().clone())))
            .method("SetText", &[TypeTag::String], |w, args| {
                *w.text.lock().unwrap() = value_at(args, 0)?.as_str().unwrap_or_default().into();
                Ok(Item::null())
            })
            .method("Fail", &[], |_, _| {
                Err(HandlerError::raised("ArgumentException", "refused"))
            })
            .method("Explode", &[], |_, _| panic!("control disposed"))
            .method("Same", &[TypeTag::SlotRef], |w, args| {
                Ok(Item::value(std::ptr::eq(w, object_at::<Window>(args, 0)?)))
            });
        registry
    }

    struct Fixture {
        controller: Channel,
        agent: Agent<AlwaysAlive>,
        desktop: Arc<Desktop>,
    }

    fn fixture() -> Fixture {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let id = ChannelId::new(
            std::process::id(),
            80_000 + COUNTER.fetch_add(1, Ordering::SeqCst),
            "AgentTest",
        );
        let controller = Channel::open(id.clone(), true).unwrap();
        let desktop = Arc::new(Desktop {
            main: Arc::new(Window {
                text: Mutex::new("Hello".into()),
            }),
            collected: AtomicU32::new(0),
        });
        let config = AgentConfig {
            timeout: Duration::from_millis(150),
            gc_settle: Duration::from_millis(1),
            ..Default::default()
        };
        let agent = Agent::connect_with(
            id,
            desktop.clone(),
            Arc::new(registry()),
            AlwaysAlive(1),
            config,
        )
        .unwrap();
        Fixture {
            controller,
            agent,
            desktop,
        }
    }

    struct Req {
        action: Action,
        source: u32,
        dest: u32,
        kind: Option<MemberKind>,
        name: Option<&'static str>,
        params: Vec<Value>,
    }

    fn req(action: Action, params: Vec<Value>) -> Req {
        Req {
            action,
            source: 0,
            dest: 0,
            kind: None,
            name: None,
            params,
        }
    }

    fn locate_main(dest: u32) -> Req {
        Req {
            dest,
            ..req(
                Action::Locate,
                ControlIdentifier::named("MainForm").to_values().to_vec(),
            )
        }
    }

    fn query(source: u32, dest: u32, kind: MemberKind, name: &'static str, params: Vec<Value>) -> Req {
        Req {
            source,
            dest,
            kind: Some(kind),
            name: Some(name),
            ..req(Action::QueryMember, params)
        }
    }

    fn fetch(source: u32) -> Req {
        Req {
            source,
            ..req(Action::FetchResult, vec![])
        }
    }

    impl Fixture {
        fn run(&mut self, requests: &[Req]) -> Flow {
            {
                let (mut store, mut arena) = self.controller.parts().unwrap();
                let mut cursor = 0;
                for (i, r) in requests.iter().enumerate() {
                    let record = store.record_mut(i).unwrap();
                    record.clear();
                    record.action = r.action as u32;
                    record.source_slot = r.source;
                    record.dest_slot = r.dest;
                    record.member_kind = r.kind.map_or(0, |k| k as u32);
                    if let Some(name) = r.name {
                        let (offset, length) = arena.write(&mut cursor, name).unwrap();
                        record.name_offset = offset as i32;
                        record.name_length = length;
                    }
                    for (slot, value) in record.parameters.iter_mut().zip(&r.params) {
                        value.encode(slot, &mut arena, &mut cursor).unwrap();
                    }
                    record.parameter_count = r.params.len() as u32;
                    let tags: Vec<_> = r.params.iter().map(Value::tag).collect();
                    record.signature_key = signature_key(&tags);
                }
                store.set_count(requests.len());
                store.set_arena_cursor(cursor);
            }
            let agent = &mut self.agent;
            agent
                .dispatch
                .run_batch(&mut agent.channel, &mut || true)
                .unwrap()
        }

        fn response(&mut self) -> (Vec<Vec<Value>>, BatchOutcome) {
            let (store, arena) = self.controller.parts().unwrap();
            let count = store.count();
            let outcome = BatchOutcome::decode(store.record(count - 1).unwrap(), &arena).unwrap();
            let outputs = (0..count - 1)
                .map(|i| {
                    let record = store.record(i).unwrap();
                    record.parameters[..record.parameter_count as usize]
                        .iter()
                        .map(|p| Value::decode(p, &arena).unwrap())
                        .collect()
                })
                .collect();
            (outputs, outcome)
        }

        fn failure(&mut self) -> (String, String) {
            match self.response() {
                (outputs, BatchOutcome::Failure { type_name, message, .. }) => {
                    assert!(outputs.is_empty());
                    (type_name, message)
                }
                (_, BatchOutcome::Success) => panic!("batch unexpectedly succeeded"),
            }
        }
    }

    #[test]
    fn test_locate_query_fetch() {
        let mut f = fixture();
        let flow = f.run(&[
            locate_main(0),
            query(0, 1, MemberKind::Property, "Text", vec![]),
            fetch(1),
        ]);
        assert_eq!(flow, Flow::Continue);

        let (outputs, outcome) = f.response();
        assert_eq!(outcome, BatchOutcome::Success);
        assert_eq!(outputs.len(), 2);
        let ident = ControlIdentifier::from_values(&outputs[0]).unwrap();
        assert_eq!(ident.handle, Handle(0x100));
        assert_eq!(ident.text.as_deref(), Some("Hello"));
        assert_eq!(outputs[1], vec![Value::from("Hello")]);
        assert!(f.agent.dispatch.slots.is_empty());
    }

    #[test]
    fn test_output_strings_follow_request_strings() {
        let mut f = fixture();
        f.run(&[
            locate_main(0),
            query(0, 1, MemberKind::Property, "Text", vec![]),
            fetch(1),
        ]);
        // "MainForm" in the identifier, "Text" as the member name
        let request_end = ("MainForm".len() + "Text".len()) * 2;
        let (store, _) = f.controller.parts().unwrap();
        let record = store.record(1).unwrap();
        assert!(record.parameters[0].string_offset as usize >= request_end);
    }

    #[test]
    fn test_not_found_fails_whole_batch() {
        let mut f = fixture();
        let started = Instant::now();
        f.run(&[
            Req {
                dest: 0,
                ..req(
                    Action::Locate,
                    ControlIdentifier::named("Missing").to_values().to_vec(),
                )
            },
            query(0, 1, MemberKind::Property, "Text", vec![]),
            fetch(1),
        ]);
        assert!(started.elapsed() >= Duration::from_millis(150));

        let (type_name, message) = f.failure();
        assert_eq!(type_name, "ControlNotFound");
        assert_eq!(message, "Failed to find control");

        let (store, _) = f.controller.parts().unwrap();
        assert_eq!(store.count(), 1);
        for i in 1..ape_shared::MESSAGE_RECORDS {
            assert_eq!(store.record(i).unwrap().action, Action::None as u32);
        }
        assert!(f.agent.dispatch.slots.is_empty());
    }

    #[test]
    fn test_failure_stops_later_commands() {
        let mut f = fixture();
        f.run(&[
            locate_main(0),
            query(0, 1, MemberKind::Method, "SetText", vec!["changed".into()]),
            query(0, 2, MemberKind::Method, "Fail", vec![]),
            query(0, 3, MemberKind::Method, "SetText", vec!["after".into()]),
        ]);
        let (type_name, message) = f.failure();
        assert_eq!(type_name, "ArgumentException");
        assert_eq!(message, "refused");
        assert_eq!(*f.desktop.main.text.lock().unwrap(), "changed");
    }

    #[test]
    fn test_panic_becomes_failure() {
        let mut f = fixture();
        f.run(&[locate_main(0), query(0, 1, MemberKind::Method, "Explode", vec![])]);
        let (type_name, message) = f.failure();
        assert_eq!(type_name, "panic");
        assert_eq!(message, "control disposed");

        // The next batch runs normally
        f.run(&[locate_main(0), query(0, 1, MemberKind::Property, "Text", vec![]), fetch(1)]);
        assert_eq!(f.response().1, BatchOutcome::Success);
    }

    #[test]
    fn test_missing_member() {
        let mut f = fixture();
        f.run(&[locate_main(0), query(0, 1, MemberKind::Method, "SetText", vec![Value::Int32(1)])]);
        let (type_name, message) = f.failure();
        assert_eq!(type_name, "MissingMember");
        assert!(message.contains("Demo.Window"), "{message}");
    }

    #[test]
    fn test_slot_reference_argument() {
        let mut f = fixture();
        f.run(&[
            locate_main(0),
            Req {
                source: 0,
                dest: 1,
                ..req(
                    Action::Relocate,
                    vec![Value::Handle(Handle::NULL), Value::Handle(Handle(0x100))],
                )
            },
            query(0, 2, MemberKind::Method, "Same", vec![Value::Slot(ObjectSlot::new(1).unwrap())]),
            fetch(2),
        ]);
        let (outputs, outcome) = f.response();
        assert_eq!(outcome, BatchOutcome::Success);
        assert_eq!(outputs.last().unwrap(), &vec![Value::Boolean(true)]);
    }

    #[test]
    fn test_fetch_of_empty_slot_is_empty() {
        let mut f = fixture();
        f.run(&[locate_main(0), query(0, 1, MemberKind::Property, "Text", vec![]), fetch(5)]);
        let (outputs, _) = f.response();
        assert_eq!(outputs[1], vec![Value::Empty]);
    }

    #[test]
    fn test_member_of_null_is_null() {
        let mut f = fixture();
        f.run(&[
            locate_main(0),
            query(5, 6, MemberKind::Property, "Text", vec![]),
            query(6, 7, MemberKind::Method, "SetText", vec!["x".into()]),
            fetch(6),
            fetch(7),
        ]);
        let (outputs, outcome) = f.response();
        assert_eq!(outcome, BatchOutcome::Success);
        assert_eq!(outputs[1], vec![Value::Empty]);
        assert_eq!(outputs[2], vec![Value::Empty]);
        assert_eq!(*f.desktop.main.text.lock().unwrap(), "Hello");
    }

    #[test]
    fn test_member_of_plain_value_fails() {
        let mut f = fixture();
        f.run(&[
            locate_main(0),
            query(0, 1, MemberKind::Property, "Text", vec![]),
            query(1, 2, MemberKind::Property, "Text", vec![]),
        ]);
        assert_eq!(f.failure().0, "TypeMismatch");
    }

    #[test]
    fn test_fetch_of_object_fails() {
        let mut f = fixture();
        f.run(&[locate_main(0), fetch(0)]);
        assert_eq!(f.failure().0, "TypeMismatch");
    }

    #[test]
    fn test_poll_member() {
        let mut f = fixture();
        let window = f.desktop.main.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            *window.text.lock().unwrap() = "Ready".into();
        });
        let poll = |target: &str| Req {
            kind: Some(MemberKind::Property),
            name: Some("Text"),
            ..req(Action::PollMember, vec![Value::from(target)])
        };

        f.run(&[locate_main(0), poll("Ready")]);
        assert_eq!(f.response().1, BatchOutcome::Success);

        f.run(&[locate_main(0), poll("Never")]);
        let (type_name, message) = f.failure();
        assert_eq!(type_name, "Timeout");
        assert!(message.starts_with("Polling failed to match item Text"), "{message}");
    }

    #[test]
    fn test_positional_rules() {
        let mut f = fixture();
        f.run(&[locate_main(0), req(Action::SetTimeouts, vec![Value::UInt32(10)])]);
        assert_eq!(f.failure().1, "SetTimeouts must be the first message");

        f.run(&[req(Action::RemoveInputHook, vec![Value::Handle(Handle(1))])]);
        assert_eq!(f.failure().1, "RemoveInputHook must not be the first message");

        f.run(&[req(Action::GarbageCollect, vec![Value::Int32(2)])]);
        assert_eq!(f.response().1, BatchOutcome::Success);
        assert_eq!(f.desktop.collected.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_set_timeouts_and_domains() {
        let mut f = fixture();
        f.run(&[req(Action::SetTimeouts, vec![Value::UInt32(1234)])]);
        assert_eq!(f.response().1, BatchOutcome::Success);
        assert_eq!(f.agent.dispatch.config.timeout, Duration::from_millis(1234));

        f.run(&[req(Action::GetAppDomains, vec![])]);
        let (outputs, _) = f.response();
        assert_eq!(outputs, vec![vec![Value::from("DefaultDomain\tPlugins")]]);
    }

    #[test]
    fn test_module_filename() {
        let mut f = fixture();
        f.run(&[req(Action::GetModuleFilename, vec![Value::Handle(Handle(0x100))])]);
        let (outputs, outcome) = f.response();
        assert_eq!(outcome, BatchOutcome::Success);
        assert_eq!(outputs, vec![vec![Value::from("demo.exe")]]);

        // Unknown windows have no module
        f.run(&[req(Action::GetModuleFilename, vec![Value::Handle(Handle(0x999))])]);
        assert_eq!(f.response().0, vec![vec![Value::from("")]]);

        f.run(&[
            locate_main(0),
            req(Action::GetModuleFilename, vec![Value::Handle(Handle(0x100))]),
        ]);
        assert_eq!(f.failure().1, "GetModuleFilename must be the first message");

        f.run(&[req(Action::GetModuleFilename, vec![Value::Int32(0x100)])]);
        assert_eq!(f.failure().0, "TypeMismatch");
    }

    #[test]
    fn test_file_name_of_either_separator() {
        assert_eq!(file_name(r"C:\Apps\demo.exe"), "demo.exe");
        assert_eq!(file_name("/opt/demo/demo-app"), "demo-app");
        assert_eq!(file_name("plain"), "plain");
        assert_eq!(file_name(""), "");
    }

    #[test]
    fn test_wrong_parameter_type() {
        let mut f = fixture();
        f.run(&[req(Action::SetTimeouts, vec![Value::Int32(5)])]);
        assert_eq!(f.failure().0, "TypeMismatch");
    }

    #[test]
    fn test_teardown_sends_nothing() {
        let mut f = fixture();
        assert_eq!(f.run(&[req(Action::Teardown, vec![])]), Flow::Teardown);
        assert_eq!(f.controller.store().unwrap().count(), 1);
        assert!(f.agent.dispatch.slots.is_empty());
    }

    #[test]
    fn test_oversized_batch_is_rejected() {
        let mut f = fixture();
        f.controller.store().unwrap().set_count(MAX_MESSAGES + 1);
        let agent = &mut f.agent;
        agent.dispatch.run_batch(&mut agent.channel, &mut || true).unwrap();
        assert!(matches!(f.failure(), (t, _) if t == "ProtocolError"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_input_hook_round_trip() {
        use crate::input::MouseTransition;

        let mut f = fixture();
        let window = Value::Handle(Handle(0x100));
        f.run(&[req(Action::AddInputHook, vec![window.clone()])]);
        assert_eq!(f.response().1, BatchOutcome::Success);

        let monitor = f.agent.input_monitor();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            monitor.record(Handle(0x100), MouseButton::Left, MouseTransition::Down);
        });
        let wait = vec![Value::Int32(0), Value::Boolean(true), Value::Boolean(true)];
        f.run(&[req(Action::WaitForInputState, wait.clone())]);
        assert_eq!(f.response().1, BatchOutcome::Success);

        // Nothing recorded since: times out
        f.run(&[req(Action::WaitForInputState, wait)]);
        assert_eq!(f.failure().1, "Failed to find Left mouse down");

        f.run(&[locate_main(0), req(Action::RemoveInputHook, vec![window])]);
        assert_eq!(f.response().1, BatchOutcome::Success);
        assert_eq!(f.agent.input_monitor().window(), None);
    }
}
