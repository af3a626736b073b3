//! Fixed binary layout of the message region
//!
//! Region layout:
//! ```text
//! ┌──────────────────────────────┐
//! │ MessageStoreHeader (2048 B)  │  <- magic, pids, count, last waker, bootstrap
//! ├──────────────────────────────┤
//! │ MessageRecord 0   (424 B)    │
//! │ ...                          │  <- MESSAGE_RECORDS records
//! │ MessageRecord 20  (424 B)    │
//! └──────────────────────────────┘
//! ```
//!
//! Both processes must agree byte for byte, so every record is `#[repr(C)]`
//! with explicit padding and its size is asserted at compile time.

use std::mem::size_of;
use std::sync::atomic::AtomicU32;

use crate::arena::NULL_LENGTH;
use crate::{MAX_PARAMETERS, MESSAGE_RECORDS};

/// UTF-16 units reserved for the controller's working directory
pub const MAX_WORKING_DIRECTORY_LEN: usize = 512;

/// UTF-16 units reserved for the logical domain name
pub const MAX_DOMAIN_LEN: usize = 128;

/// One typed parameter inside a message (32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSlot {
    /// [`crate::TypeTag`] discriminant
    pub tag: u32,
    /// String length in UTF-16 units, `-1` for null (String tag only)
    pub string_length: i32,
    /// Byte offset into the string arena (String tag only)
    pub string_offset: u32,
    /// Padding
    pub reserved: u32,
    /// Little-endian scalar payload; which bytes are valid depends on `tag`
    pub payload: [u8; 16],
}

/// One message slot (424 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    /// [`crate::Action`] discriminant, reset to `None` once consumed
    pub action: u32,
    /// Object slot the command reads from
    pub source_slot: u32,
    /// Object slot the command writes to
    pub dest_slot: u32,
    /// [`crate::MemberKind`] discriminant
    pub member_kind: u32,
    /// Byte offset of the member name in the string arena
    pub name_offset: i32,
    /// Member name length in UTF-16 units, `-1` for none
    pub name_length: i32,
    /// Valid entries in `parameters`
    pub parameter_count: u32,
    /// Padding
    pub reserved: u32,
    /// Hash over the parameter tags, see [`crate::signature_key`]
    pub signature_key: u64,
    /// Typed parameters (request) or outputs (response)
    pub parameters: [ParameterSlot; MAX_PARAMETERS],
}

impl MessageRecord {
    /// A cleared record
    pub const EMPTY: MessageRecord = MessageRecord {
        action: 0,
        source_slot: 0,
        dest_slot: 0,
        member_kind: 0,
        name_offset: 0,
        name_length: NULL_LENGTH,
        parameter_count: 0,
        reserved: 0,
        signature_key: 0,
        parameters: [ParameterSlot {
            tag: 0,
            string_length: 0,
            string_offset: 0,
            reserved: 0,
            payload: [0; 16],
        }; MAX_PARAMETERS],
    };

    /// Reset every field so the record can never be read twice
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }
}

impl Default for MessageRecord {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Header at the start of the message region (2048 bytes)
#[repr(C)]
pub struct MessageStoreHeader {
    /// Magic value to verify valid shared memory
    pub magic: u32,
    /// [`crate::LAYOUT_VERSION`] of the creator
    pub version: u32,
    /// Process ID of the controller
    pub controller_pid: u32,
    /// Process ID of the agent's host process
    pub agent_pid: u32,
    /// Valid records in the slot array
    pub message_count: AtomicU32,
    /// [`crate::Role`] that last woke up
    pub last_waker: AtomicU32,
    /// Bytes of the string arena in use by the current batch
    pub arena_cursor: AtomicU32,
    /// Non-zero while the bootstrap block holds unread data
    pub bootstrap_ready: AtomicU32,
    /// Controller working directory (UTF-16, null-terminated)
    pub working_directory: [u16; MAX_WORKING_DIRECTORY_LEN],
    /// Logical domain the agent should serve (UTF-16, null-terminated)
    pub domain: [u16; MAX_DOMAIN_LEN],
    /// Reserved for future use / padding
    pub reserved: [u8; 736],
}

/// Size of the message region in bytes
pub const MESSAGE_REGION_SIZE: usize =
    size_of::<MessageStoreHeader>() + MESSAGE_RECORDS * size_of::<MessageRecord>();

const _: () = assert!(size_of::<ParameterSlot>() == 32);
const _: () = assert!(size_of::<MessageRecord>() == 424);
const _: () = assert!(size_of::<MessageStoreHeader>() == 2048);
const _: () = assert!(size_of::<MessageStoreHeader>() % std::mem::align_of::<MessageRecord>() == 0);

/// Encode `text` into a fixed UTF-16 buffer, null-terminated and truncated to fit
pub(crate) fn write_wide(buffer: &mut [u16], text: &str) {
    buffer.fill(0);
    let capacity = buffer.len().saturating_sub(1);
    for (slot, unit) in buffer.iter_mut().zip(text.encode_utf16().take(capacity)) {
        *slot = unit;
    }
}

/// Decode a null-terminated UTF-16 buffer
pub(crate) fn read_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}
