//! Channel: the two shared regions plus the event, opened by name
//!
//! Both sides derive the same names from `(controller pid, agent pid,
//! domain)`, so neither has to tell the other where to look.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::arena::StringArena;
use crate::error::{Error, Result};
use crate::layout::{MESSAGE_REGION_SIZE, MessageRecord, MessageStoreHeader, read_wide, write_wide};
use crate::message::MessageStore;
use crate::os::{SharedRegion, Signal};
use crate::{CHANNEL_NAME_PREFIX, LAYOUT_VERSION, MAGIC, MESSAGE_RECORDS, STRING_ARENA_SIZE};

/// Named objects making up a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Message-slot region
    Message,
    /// String arena
    String,
    /// Auto-reset event
    Event,
}

impl RegionKind {
    fn as_str(&self) -> &'static str {
        match self {
            RegionKind::Message => "Message",
            RegionKind::String => "String",
            RegionKind::Event => "Event",
        }
    }
}

/// Identity of a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    /// Driver process
    pub controller_pid: u32,
    /// Process hosting the agent
    pub agent_pid: u32,
    /// Logical domain inside the agent's process
    pub domain: String,
}

impl ChannelId {
    /// Build an id
    pub fn new(controller_pid: u32, agent_pid: u32, domain: impl Into<String>) -> Self {
        Self {
            controller_pid,
            agent_pid,
            domain: domain.into(),
        }
    }

    /// Kernel object name for one part of the channel
    pub fn name(&self, kind: RegionKind) -> String {
        format!(
            "{CHANNEL_NAME_PREFIX}{}_{}_{}_{}",
            self.controller_pid,
            kind.as_str(),
            self.domain,
            self.agent_pid
        )
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}:{}",
            self.controller_pid, self.agent_pid, self.domain
        )
    }
}

/// Startup information handed from the controller to a new agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    /// Controller's working directory
    pub working_directory: String,
    /// Domain the agent should serve
    pub domain: String,
}

struct Mapped {
    messages: SharedRegion,
    strings: SharedRegion,
    signal: Signal,
}

/// An open channel
pub struct Channel {
    id: ChannelId,
    mapped: Option<Mapped>,
    freshly_created: bool,
}

impl Channel {
    /// Map (and with `create`, create) both regions and the event
    pub fn open(id: ChannelId, create: bool) -> Result<Self> {
        let message_name = id.name(RegionKind::Message);
        let string_name = id.name(RegionKind::String);
        let event_name = id.name(RegionKind::Event);

        let (messages, strings, signal, fresh) = if create {
            let (messages, fresh) = SharedRegion::create(&message_name, MESSAGE_REGION_SIZE)?;
            let (strings, _) = SharedRegion::create(&string_name, STRING_ARENA_SIZE)?;
            let signal = Signal::create(&event_name)?;
            (messages, strings, signal, fresh)
        } else {
            let messages = SharedRegion::open(&message_name, MESSAGE_REGION_SIZE)?;
            let strings = SharedRegion::open(&string_name, STRING_ARENA_SIZE)?;
            let signal = Signal::open(&event_name)?;
            (messages, strings, signal, false)
        };

        // SAFETY: the region is at least MESSAGE_REGION_SIZE bytes and page aligned
        let header = unsafe { &mut *(messages.as_ptr() as *mut MessageStoreHeader) };
        if fresh {
            header.magic = MAGIC;
            header.version = LAYOUT_VERSION;
            header.controller_pid = id.controller_pid;
            header.agent_pid = id.agent_pid;
            header.message_count = AtomicU32::new(0);
            header.last_waker = AtomicU32::new(0);
            header.arena_cursor = AtomicU32::new(0);
            header.bootstrap_ready = AtomicU32::new(0);
        } else if header.magic != MAGIC || header.version != LAYOUT_VERSION {
            return Err(Error::unavailable(
                message_name,
                format!(
                    "bad header (magic {:#x}, layout {})",
                    header.magic, header.version
                ),
            ));
        }

        debug!(channel = %id, fresh, "channel open");
        Ok(Self {
            id,
            mapped: Some(Mapped {
                messages,
                strings,
                signal,
            }),
            freshly_created: fresh,
        })
    }

    /// Channel identity
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// True when this `open` created the regions rather than attaching
    pub fn freshly_created(&self) -> bool {
        self.freshly_created
    }

    /// False after [`Channel::close`]
    pub fn is_open(&self) -> bool {
        self.mapped.is_some()
    }

    fn mapped(&self) -> Result<&Mapped> {
        self.mapped
            .as_ref()
            .ok_or_else(|| Error::unavailable(self.id.name(RegionKind::Message), "channel closed"))
    }

    /// Shared header
    pub fn header(&self) -> Result<&MessageStoreHeader> {
        let mapped = self.mapped()?;
        // SAFETY: checked in `open`; header fields shared across turns are atomics
        Ok(unsafe { &*(mapped.messages.as_ptr() as *const MessageStoreHeader) })
    }

    /// The event both sides wait on
    pub fn signal(&self) -> Result<&Signal> {
        Ok(&self.mapped()?.signal)
    }

    /// Message store and string arena of the current turn
    pub fn parts(&mut self) -> Result<(MessageStore<'_>, StringArena<'_>)> {
        let mapped = self.mapped()?;
        // SAFETY: the header and the record array are disjoint, the string
        // region is a separate mapping, and the handshake gives this side
        // exclusive use of both for the duration of its turn
        unsafe {
            let base = mapped.messages.as_ptr();
            let header = &*(base as *const MessageStoreHeader);
            let records = std::slice::from_raw_parts_mut(
                base.add(size_of::<MessageStoreHeader>()) as *mut MessageRecord,
                MESSAGE_RECORDS,
            );
            let strings = std::slice::from_raw_parts_mut(mapped.strings.as_ptr(), STRING_ARENA_SIZE);
            Ok((MessageStore::new(header, records), StringArena::new(strings)))
        }
    }

    /// Message store of the current turn
    pub fn store(&mut self) -> Result<MessageStore<'_>> {
        Ok(self.parts()?.0)
    }

    /// Publish startup information for the agent
    pub fn write_bootstrap(&mut self, bootstrap: &Bootstrap) -> Result<()> {
        let mapped = self.mapped()?;
        // SAFETY: the agent reads the block only after `bootstrap_ready` is set
        let header = unsafe { &mut *(mapped.messages.as_ptr() as *mut MessageStoreHeader) };
        write_wide(&mut header.working_directory, &bootstrap.working_directory);
        write_wide(&mut header.domain, &bootstrap.domain);
        header.bootstrap_ready.store(1, Ordering::Release);
        Ok(())
    }

    /// Consume the startup information, once
    pub fn take_bootstrap(&mut self) -> Result<Option<Bootstrap>> {
        let mapped = self.mapped()?;
        // SAFETY: see `write_bootstrap`
        let header = unsafe { &mut *(mapped.messages.as_ptr() as *mut MessageStoreHeader) };
        if header.bootstrap_ready.swap(0, Ordering::AcqRel) == 0 {
            return Ok(None);
        }
        let bootstrap = Bootstrap {
            working_directory: read_wide(&header.working_directory),
            domain: read_wide(&header.domain),
        };
        header.working_directory.fill(0);
        header.domain.fill(0);
        Ok(Some(bootstrap))
    }

    /// Unmap both regions and close the event. Safe to call more than once.
    pub fn close(&mut self) {
        if self.mapped.take().is_some() {
            debug!(channel = %self.id, "channel closed");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::Action;

    /// Unique channel id per test so parallel tests never share objects
    pub(crate) fn unique_id() -> ChannelId {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        ChannelId::new(
            std::process::id(),
            90_000 + COUNTER.fetch_add(1, Ordering::SeqCst),
            "UnitTest",
        )
    }

    #[test]
    fn test_channel_names() {
        let id = ChannelId::new(10, 20, "DefaultDomain");
        assert_eq!(id.name(RegionKind::Message), "APE_10_Message_DefaultDomain_20");
        assert_eq!(id.name(RegionKind::String), "APE_10_String_DefaultDomain_20");
        assert_eq!(id.name(RegionKind::Event), "APE_10_Event_DefaultDomain_20");
    }

    #[test]
    fn test_create_then_open() {
        let id = unique_id();
        let mut host = Channel::open(id.clone(), true).unwrap();
        assert!(host.freshly_created());

        let mut agent = Channel::open(id, false).unwrap();
        assert!(!agent.freshly_created());

        host.store().unwrap().record_mut(3).unwrap().action = Action::Locate as u32;
        assert_eq!(
            agent.store().unwrap().record(3).unwrap().action,
            Action::Locate as u32
        );
        assert_eq!(agent.header().unwrap().magic, MAGIC);
    }

    #[test]
    fn test_second_create_attaches() {
        let id = unique_id();
        let _first = Channel::open(id.clone(), true).unwrap();
        let second = Channel::open(id, true).unwrap();
        assert!(!second.freshly_created());
    }

    #[test]
    fn test_open_without_creator_fails() {
        let err = Channel::open(unique_id(), false).err().unwrap();
        assert!(matches!(err, Error::ChannelUnavailable { .. }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut channel = Channel::open(unique_id(), true).unwrap();
        channel.close();
        channel.close();
        assert!(!channel.is_open());
        assert!(channel.store().is_err());
    }

    #[test]
    fn test_bootstrap_is_consumed_once() {
        let id = unique_id();
        let mut host = Channel::open(id.clone(), true).unwrap();
        let mut agent = Channel::open(id, false).unwrap();

        let bootstrap = Bootstrap {
            working_directory: "C:\\work".into(),
            domain: "Domain2".into(),
        };
        host.write_bootstrap(&bootstrap).unwrap();

        assert_eq!(agent.take_bootstrap().unwrap(), Some(bootstrap));
        assert_eq!(agent.take_bootstrap().unwrap(), None);
    }

    #[test]
    fn test_strings_are_shared() {
        let id = unique_id();
        let mut host = Channel::open(id.clone(), true).unwrap();
        let mut agent = Channel::open(id, false).unwrap();

        let (_, mut arena) = host.parts().unwrap();
        let mut cursor = 0;
        let (off, len) = arena.write(&mut cursor, "Hello").unwrap();

        let (_, arena) = agent.parts().unwrap();
        assert_eq!(arena.read(off, len).unwrap().as_deref(), Some("Hello"));
    }
}
