//! Shared types and IPC protocol for APE remote control
//!
//! Communication between the controller (driver) and the agent injected into
//! the target application uses two named shared memory regions and one named
//! auto-reset event.
//!
//! # Architecture
//!
//! - [`Channel`] - Maps the message-slot region and the string arena
//! - [`Handshake`] - Turn-taking protocol between [`Role::Controller`] and [`Role::Agent`]
//! - [`MessageStore`] - Typed view over the fixed message-slot array
//! - [`StringArena`] - UTF-16 payload area referenced by offset/length pairs
//!
//! # Message Protocol
//!
//! A batch is up to [`MAX_MESSAGES`] [`MessageRecord`]s. Each record carries an
//! [`Action`], object slot references and up to [`MAX_PARAMETERS`] tagged
//! values (see [`value`]). The agent answers in place and appends one trailing
//! result record (see [`outcome`]).

#![deny(missing_docs)]

pub mod arena;
pub mod channel;
pub mod error;
pub mod handshake;
pub mod ident;
pub mod layout;
pub mod message;
pub mod os;
pub mod outcome;
pub mod signature;
pub mod value;

pub use arena::StringArena;
pub use channel::{Bootstrap, Channel, ChannelId, RegionKind};
pub use error::{Error, Result};
pub use handshake::{Handshake, HandshakeConfig, HandshakeState, Role};
pub use ident::{ControlIdentifier, Technology};
pub use layout::{MessageRecord, MessageStoreHeader, ParameterSlot};
pub use message::{Action, MemberKind, MessageStore, MouseButton, ObjectSlot};
pub use os::{AlwaysAlive, ManualLiveness, PeerLiveness, ProcessWatch};
pub use outcome::BatchOutcome;
pub use signature::signature_key;
pub use value::{Decimal, Handle, TypeTag, Value};

/// Prefix of every named kernel object belonging to a channel
pub const CHANNEL_NAME_PREFIX: &str = "APE_";

/// Commands a single batch may carry
pub const MAX_MESSAGES: usize = 20;

/// Records in the message region: every command slot plus the trailing result
pub const MESSAGE_RECORDS: usize = MAX_MESSAGES + 1;

/// Typed parameters per message (a control identifier uses all of them)
pub const MAX_PARAMETERS: usize = 12;

/// Object slots held by the agent between commands of one batch
pub const OBJECT_SLOTS: usize = 10;

/// Size of the string arena (1 MiB)
pub const STRING_ARENA_SIZE: usize = 1024 * 1024;

/// Magic value to identify a valid message region ("APE\0")
pub const MAGIC: u32 = 0x0045_5041;

/// Bumped whenever a record layout changes
pub const LAYOUT_VERSION: u32 = 1;

/// Logical domain used when the caller does not name one
pub const DEFAULT_DOMAIN: &str = "DefaultDomain";
