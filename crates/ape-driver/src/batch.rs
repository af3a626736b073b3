//! Batch assembly
//!
//! Commands are checked against the batch's ordering flags, its capacity and
//! the remaining arena space before anything is written, so a rejected
//! command never changes shared memory, not even when it would have opened
//! a new batch.

use std::time::Duration;

use ape_shared::{
    Action, ControlIdentifier, Error, Handle, MAX_MESSAGES, MAX_PARAMETERS, MemberKind,
    MessageRecord, MessageStore, MouseButton, ObjectSlot, Result, StringArena, TypeTag, Value,
    signature_key,
};
use tracing::trace;

/// Where a command sits in the locate → query → fetch order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Locate,
    Query,
    Fetch,
    Standalone,
    Unordered,
}

/// One command, not yet written to shared memory
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    action: Action,
    source: Option<ObjectSlot>,
    dest: Option<ObjectSlot>,
    member_kind: Option<MemberKind>,
    name: Option<String>,
    params: Vec<Value>,
}

impl Command {
    fn new(action: Action, params: Vec<Value>) -> Self {
        Self {
            action,
            source: None,
            dest: None,
            member_kind: None,
            name: None,
            params,
        }
    }

    /// Find a control and keep it in `dest`
    pub fn locate(dest: ObjectSlot, ident: &ControlIdentifier) -> Self {
        Self {
            dest: Some(dest),
            ..Self::new(Action::Locate, ident.to_values().to_vec())
        }
    }

    /// Resolve a known handle into `dest`
    pub fn relocate(dest: ObjectSlot, parent: Handle, handle: Handle) -> Self {
        Self {
            dest: Some(dest),
            ..Self::new(Action::Relocate, vec![parent.into(), handle.into()])
        }
    }

    /// Access or invoke a member of the object in `source`, result into `dest`.
    /// For constructors `name` is the type's registered name and `source` is unused.
    pub fn query_member(
        source: ObjectSlot,
        dest: ObjectSlot,
        kind: MemberKind,
        name: &str,
        params: &[Value],
    ) -> Result<Self> {
        if params.len() > MAX_PARAMETERS {
            return Err(Error::UnsupportedOperand(format!(
                "{} parameters, at most {MAX_PARAMETERS}",
                params.len()
            )));
        }
        let slot_refs = params.iter().filter(|p| p.tag() == TypeTag::SlotRef).count();
        if slot_refs > 1 {
            return Err(Error::UnsupportedOperand(format!(
                "{slot_refs} slot references, at most one"
            )));
        }
        Ok(Self {
            source: Some(source),
            dest: Some(dest),
            member_kind: Some(kind),
            name: Some(name.to_string()),
            ..Self::new(Action::QueryMember, params.to_vec())
        })
    }

    /// Re-read a field or property until it equals `target`
    pub fn poll_member(source: ObjectSlot, kind: MemberKind, name: &str, target: Value) -> Self {
        Self {
            source: Some(source),
            member_kind: Some(kind),
            name: Some(name.to_string()),
            ..Self::new(Action::PollMember, vec![target])
        }
    }

    /// Return the value in `source`
    pub fn fetch_result(source: ObjectSlot) -> Self {
        Self {
            source: Some(source),
            ..Self::new(Action::FetchResult, vec![])
        }
    }

    /// Start recording mouse transitions on `window`
    pub fn add_input_hook(window: Handle) -> Self {
        Self::new(Action::AddInputHook, vec![window.into()])
    }

    /// Stop recording mouse transitions
    pub fn remove_input_hook(window: Handle) -> Self {
        Self::new(Action::RemoveInputHook, vec![window.into()])
    }

    /// Wait for `button` to go down (or up)
    pub fn wait_for_input_state(button: MouseButton, mouse_down: bool, first_click: bool) -> Self {
        Self::new(
            Action::WaitForInputState,
            vec![
                Value::Int32(button as i32),
                Value::Boolean(mouse_down),
                Value::Boolean(first_click),
            ],
        )
    }

    /// Collect garbage up to `generation`
    pub fn garbage_collect(generation: i32) -> Self {
        Self::new(Action::GarbageCollect, vec![Value::Int32(generation)])
    }

    /// Change the agent's wait timeout
    pub fn set_timeouts(timeout: Duration) -> Self {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        Self::new(Action::SetTimeouts, vec![Value::UInt32(millis)])
    }

    /// List the agent process's logical domains
    pub fn get_app_domains() -> Self {
        Self::new(Action::GetAppDomains, vec![])
    }

    /// Ask for the file name of the module that created `window`
    pub fn get_module_filename(window: Handle) -> Self {
        Self::new(Action::GetModuleFilename, vec![window.into()])
    }

    /// Stop the agent
    pub fn teardown() -> Self {
        Self::new(Action::Teardown, vec![])
    }

    /// Action this command carries
    pub fn action(&self) -> Action {
        self.action
    }

    fn phase(&self) -> Phase {
        match self.action {
            Action::Locate | Action::Relocate => Phase::Locate,
            Action::QueryMember | Action::PollMember => Phase::Query,
            Action::FetchResult => Phase::Fetch,
            Action::RemoveInputHook => Phase::Unordered,
            _ => Phase::Standalone,
        }
    }

    fn arena_bytes(&self) -> usize {
        let text = |s: &str| s.encode_utf16().count() * 2;
        let name = self.name.as_deref().map_or(0, text);
        let params: usize = self.params.iter().filter_map(Value::as_str).map(text).sum();
        name + params
    }

    fn write(&self, record: &mut MessageRecord, arena: &mut StringArena<'_>, cursor: &mut usize) -> Result<()> {
        record.clear();
        record.action = self.action as u32;
        record.source_slot = self.source.map_or(0, |s| s.index() as u32);
        record.dest_slot = self.dest.map_or(0, |s| s.index() as u32);
        record.member_kind = self.member_kind.map_or(0, |k| k as u32);
        if let Some(name) = &self.name {
            let (offset, length) = arena.write(cursor, name)?;
            record.name_offset = offset as i32;
            record.name_length = length;
        }
        for (slot, value) in record.parameters.iter_mut().zip(&self.params) {
            value.encode(slot, arena, cursor)?;
        }
        record.parameter_count = self.params.len() as u32;
        let tags: Vec<TypeTag> = self.params.iter().map(Value::tag).collect();
        record.signature_key = signature_key(&tags);
        Ok(())
    }
}

/// Ordering flags, command count and arena cursor of the batch being built
#[derive(Debug, Default)]
pub struct BatchBuilder {
    open: bool,
    count: usize,
    cursor: usize,
    located: bool,
    queried: bool,
    fetched: bool,
}

impl BatchBuilder {
    /// No batch open
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands in the open batch
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when the open batch holds no commands
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True between the first append and [`BatchBuilder::finish`]
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn check(&self, command: &Command, arena_capacity: usize) -> Result<()> {
        match command.phase() {
            Phase::Query if !self.located => {
                return Err(Error::ProtocolSequence(
                    "a control must be located before it is queried",
                ));
            }
            Phase::Query if self.fetched => {
                return Err(Error::ProtocolSequence(
                    "cannot query a control after getting values from it",
                ));
            }
            Phase::Fetch if !(self.located && self.queried) => {
                return Err(Error::ProtocolSequence(
                    "a control must be located and queried before a result is fetched",
                ));
            }
            _ => {}
        }

        if self.count >= MAX_MESSAGES {
            return Err(Error::BatchCapacity {
                capacity: MAX_MESSAGES,
            });
        }

        let needed = command.arena_bytes();
        let available = arena_capacity.saturating_sub(self.cursor);
        if needed > available {
            return Err(Error::ArenaOverflow { needed, available });
        }
        Ok(())
    }

    /// Validate `command` and write it as the next record. The first append
    /// after [`BatchBuilder::finish`] starts a new batch.
    pub fn append(
        &mut self,
        command: &Command,
        store: &mut MessageStore<'_>,
        arena: &mut StringArena<'_>,
    ) -> Result<()> {
        let fresh = BatchBuilder {
            open: true,
            ..Default::default()
        };
        let current = if self.open { &*self } else { &fresh };
        current.check(command, arena.capacity())?;
        if !self.open {
            *self = fresh;
            store.reset();
        }

        command.write(store.record_mut(self.count)?, arena, &mut self.cursor)?;
        match command.phase() {
            Phase::Locate => self.located = true,
            Phase::Query => self.queried = true,
            Phase::Fetch => self.fetched = true,
            Phase::Standalone => {
                self.located = true;
                self.queried = true;
                self.fetched = true;
            }
            Phase::Unordered => {}
        }
        self.count += 1;
        store.set_count(self.count);
        store.set_arena_cursor(self.cursor);
        trace!(action = ?command.action, count = self.count, "command queued");
        Ok(())
    }

    /// Close the batch for sending; returns its command count
    pub fn finish(&mut self) -> Result<usize> {
        if !self.open || self.count == 0 {
            return Err(Error::ProtocolSequence("the batch holds no commands"));
        }
        self.open = false;
        Ok(self.count)
    }
}
