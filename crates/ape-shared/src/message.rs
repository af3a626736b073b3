//! Command vocabulary and the typed view over the message-slot array

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::layout::{MessageRecord, MessageStoreHeader};
use crate::{MESSAGE_RECORDS, OBJECT_SLOTS};

/// What a message asks the agent to do
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Consumed or unused record
    None = 0,
    /// Find a control by identifier criteria
    Locate = 1,
    /// Re-resolve a control from its handle alone
    Relocate = 2,
    /// Access or invoke a member, storing the result in a slot
    QueryMember = 3,
    /// Read a member until it equals a target value
    PollMember = 4,
    /// Copy a slot's value into the response
    FetchResult = 5,
    /// Start recording mouse transitions on a window
    AddInputHook = 6,
    /// Stop recording mouse transitions
    RemoveInputHook = 7,
    /// Block until a mouse button went down and up
    WaitForInputState = 8,
    /// Ask the host to collect garbage
    GarbageCollect = 9,
    /// Change the agent's wait timeout
    SetTimeouts = 10,
    /// List the host's logical domains
    GetAppDomains = 11,
    /// Unmap and stop the agent
    Teardown = 12,
    /// Trailing success/failure record
    Result = 13,
    /// File name of the module that created a window
    GetModuleFilename = 14,
}

impl TryFrom<u32> for Action {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Action::None,
            1 => Action::Locate,
            2 => Action::Relocate,
            3 => Action::QueryMember,
            4 => Action::PollMember,
            5 => Action::FetchResult,
            6 => Action::AddInputHook,
            7 => Action::RemoveInputHook,
            8 => Action::WaitForInputState,
            9 => Action::GarbageCollect,
            10 => Action::SetTimeouts,
            11 => Action::GetAppDomains,
            12 => Action::Teardown,
            13 => Action::Result,
            14 => Action::GetModuleFilename,
            other => return Err(Error::UnsupportedOperand(format!("action {other}"))),
        })
    }
}

/// Which kind of member a query addresses
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Stored field
    Field = 1,
    /// Property getter (or indexer when parameters are present)
    Property = 2,
    /// Method call
    Method = 3,
    /// Constructor of the type named by the member name
    Constructor = 4,
    /// Element of an array-like object
    ArrayElement = 5,
}

impl TryFrom<u32> for MemberKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => MemberKind::Field,
            2 => MemberKind::Property,
            3 => MemberKind::Method,
            4 => MemberKind::Constructor,
            5 => MemberKind::ArrayElement,
            other => return Err(Error::UnsupportedOperand(format!("member kind {other}"))),
        })
    }
}

/// Mouse button watched by the input hook
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    /// Primary button
    Left = 0,
    /// Secondary button
    Right = 1,
    /// Wheel button
    Middle = 2,
}

impl TryFrom<u32> for MouseButton {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => MouseButton::Left,
            1 => MouseButton::Right,
            2 => MouseButton::Middle,
            other => return Err(Error::UnsupportedOperand(format!("mouse button {other}"))),
        })
    }
}

impl std::fmt::Display for MouseButton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MouseButton::Left => "Left",
            MouseButton::Right => "Right",
            MouseButton::Middle => "Middle",
        })
    }
}

/// Index into the agent's object slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectSlot(u8);

impl ObjectSlot {
    /// Validate a slot index
    pub fn new(index: usize) -> Result<Self> {
        if index < OBJECT_SLOTS {
            Ok(ObjectSlot(index as u8))
        } else {
            Err(Error::UnsupportedOperand(format!("object slot {index}")))
        }
    }

    /// Position in the table
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Every slot, in order
    pub fn all() -> impl Iterator<Item = ObjectSlot> {
        (0..OBJECT_SLOTS as u8).map(ObjectSlot)
    }
}

impl std::fmt::Display for ObjectSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// View over the header and records of a mapped message region
///
/// Only the side whose turn it is may hold a `MessageStore`; the handshake,
/// not this type, guarantees exclusivity.
pub struct MessageStore<'a> {
    header: &'a MessageStoreHeader,
    records: &'a mut [MessageRecord],
}

impl<'a> MessageStore<'a> {
    /// Wrap an already mapped header and record array
    pub fn new(header: &'a MessageStoreHeader, records: &'a mut [MessageRecord]) -> Self {
        debug_assert_eq!(records.len(), MESSAGE_RECORDS);
        Self { header, records }
    }

    /// Shared header
    pub fn header(&self) -> &MessageStoreHeader {
        self.header
    }

    /// Valid records in the current batch
    pub fn count(&self) -> usize {
        self.header.message_count.load(Ordering::Acquire) as usize
    }

    /// Publish the number of valid records
    pub fn set_count(&mut self, count: usize) {
        self.header
            .message_count
            .store(count as u32, Ordering::Release);
    }

    /// Bytes of the string arena used by the current batch
    pub fn arena_cursor(&self) -> usize {
        self.header.arena_cursor.load(Ordering::Acquire) as usize
    }

    /// Publish the string arena cursor
    pub fn set_arena_cursor(&mut self, cursor: usize) {
        self.header
            .arena_cursor
            .store(cursor as u32, Ordering::Release);
    }

    /// Record at `index`
    pub fn record(&self, index: usize) -> Result<&MessageRecord> {
        self.records
            .get(index)
            .ok_or_else(|| Error::MalformedMessage(format!("record {index} out of range")))
    }

    /// Mutable record at `index`
    pub fn record_mut(&mut self, index: usize) -> Result<&mut MessageRecord> {
        self.records
            .get_mut(index)
            .ok_or_else(|| Error::MalformedMessage(format!("record {index} out of range")))
    }

    /// Clear every record, not only the ones in use
    pub fn clear_all(&mut self) {
        self.records.iter_mut().for_each(MessageRecord::clear);
    }

    /// Empty the batch: count and arena cursor back to zero
    pub fn reset(&mut self) {
        self.set_count(0);
        self.set_arena_cursor(0);
    }
}
