//! Tagged values carried in [`ParameterSlot`]s
//!
//! The tag decides which payload bytes are meaningful. Scalars live in the
//! slot's 16-byte little-endian payload, strings live in the [`StringArena`]
//! and the slot only records where.

use crate::arena::{NULL_LENGTH, StringArena};
use crate::error::{Error, Result};
use crate::layout::ParameterSlot;
use crate::message::ObjectSlot;

/// Wire discriminant of a [`Value`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// No value
    Empty = 0,
    /// `bool`, one byte
    Boolean = 3,
    /// UTF-16 code unit
    Char = 4,
    /// `i8`
    SByte = 5,
    /// `u8`
    Byte = 6,
    /// `i16`
    Int16 = 7,
    /// `u16`
    UInt16 = 8,
    /// `i32`
    Int32 = 9,
    /// `u32`
    UInt32 = 10,
    /// `i64`
    Int64 = 11,
    /// `u64`
    UInt64 = 12,
    /// `f32`
    Single = 13,
    /// `f64`
    Double = 14,
    /// 128-bit decimal as four 32-bit words
    Decimal = 15,
    /// 64-bit tick count
    DateTime = 16,
    /// Pointer-sized OS handle
    Handle = 17,
    /// UTF-16 string in the arena
    String = 18,
    /// Index into the agent's object slot table
    SlotRef = 19,
}

impl TryFrom<u32> for TypeTag {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => TypeTag::Empty,
            3 => TypeTag::Boolean,
            4 => TypeTag::Char,
            5 => TypeTag::SByte,
            6 => TypeTag::Byte,
            7 => TypeTag::Int16,
            8 => TypeTag::UInt16,
            9 => TypeTag::Int32,
            10 => TypeTag::UInt32,
            11 => TypeTag::Int64,
            12 => TypeTag::UInt64,
            13 => TypeTag::Single,
            14 => TypeTag::Double,
            15 => TypeTag::Decimal,
            16 => TypeTag::DateTime,
            17 => TypeTag::Handle,
            18 => TypeTag::String,
            19 => TypeTag::SlotRef,
            other => return Err(Error::UnsupportedOperand(format!("type tag {other}"))),
        })
    }
}

/// 128-bit decimal in the `lo, mid, hi, flags` word order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal(pub [u32; 4]);

impl Decimal {
    /// Largest scale a decimal carries
    pub const MAX_SCALE: u8 = 28;

    /// Build from a signed 96-bit mantissa and a base-10 scale (0..=28).
    /// Wider mantissas and larger scales are rejected.
    pub fn new(mantissa: i128, scale: u8) -> Result<Self> {
        let magnitude = mantissa.unsigned_abs();
        if magnitude >> 96 != 0 {
            return Err(Error::UnsupportedOperand(format!(
                "decimal mantissa {mantissa} exceeds 96 bits"
            )));
        }
        if scale > Self::MAX_SCALE {
            return Err(Error::UnsupportedOperand(format!(
                "decimal scale {scale} exceeds {}",
                Self::MAX_SCALE
            )));
        }
        let flags = ((scale as u32) << 16) | if mantissa < 0 { 0x8000_0000 } else { 0 };
        Ok(Decimal([
            magnitude as u32,
            (magnitude >> 32) as u32,
            (magnitude >> 64) as u32,
            flags,
        ]))
    }

    /// Signed mantissa
    pub fn mantissa(&self) -> i128 {
        let [lo, mid, hi, flags] = self.0;
        let magnitude = (lo as i128) | ((mid as i128) << 32) | ((hi as i128) << 64);
        if flags & 0x8000_0000 != 0 { -magnitude } else { magnitude }
    }

    /// Base-10 scale
    pub fn scale(&self) -> u8 {
        ((self.0[3] >> 16) & 0xFF) as u8
    }
}

/// Opaque OS handle (window handle, process handle, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
    /// The null handle
    pub const NULL: Handle = Handle(0);

    /// True for the null handle
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A decoded tagged value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value
    #[default]
    Empty,
    /// Boolean
    Boolean(bool),
    /// UTF-16 code unit
    Char(u16),
    /// Signed byte
    SByte(i8),
    /// Unsigned byte
    Byte(u8),
    /// 16-bit signed
    Int16(i16),
    /// 16-bit unsigned
    UInt16(u16),
    /// 32-bit signed
    Int32(i32),
    /// 32-bit unsigned
    UInt32(u32),
    /// 64-bit signed
    Int64(i64),
    /// 64-bit unsigned
    UInt64(u64),
    /// 32-bit float
    Single(f32),
    /// 64-bit float
    Double(f64),
    /// 128-bit decimal
    Decimal(Decimal),
    /// Tick count
    DateTime(i64),
    /// OS handle
    Handle(Handle),
    /// String; `None` is null, distinct from `Some("")`
    String(Option<String>),
    /// Object held in an agent slot
    Slot(ObjectSlot),
}

impl Value {
    /// Wire tag of this value
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Empty => TypeTag::Empty,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Char(_) => TypeTag::Char,
            Value::SByte(_) => TypeTag::SByte,
            Value::Byte(_) => TypeTag::Byte,
            Value::Int16(_) => TypeTag::Int16,
            Value::UInt16(_) => TypeTag::UInt16,
            Value::Int32(_) => TypeTag::Int32,
            Value::UInt32(_) => TypeTag::UInt32,
            Value::Int64(_) => TypeTag::Int64,
            Value::UInt64(_) => TypeTag::UInt64,
            Value::Single(_) => TypeTag::Single,
            Value::Double(_) => TypeTag::Double,
            Value::Decimal(_) => TypeTag::Decimal,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Handle(_) => TypeTag::Handle,
            Value::String(_) => TypeTag::String,
            Value::Slot(_) => TypeTag::SlotRef,
        }
    }

    /// Borrow the text of a non-null string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer view of any integral value that fits in an `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::SByte(v) => Some(v as i64),
            Value::Byte(v) => Some(v as i64),
            Value::Int16(v) => Some(v as i64),
            Value::UInt16(v) => Some(v as i64),
            Value::Int32(v) => Some(v as i64),
            Value::UInt32(v) => Some(v as i64),
            Value::Int64(v) => Some(v),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Boolean(v) => Some(v),
            _ => None,
        }
    }

    /// Handle payload
    pub fn as_handle(&self) -> Option<Handle> {
        match *self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// Write this value into `slot`, appending string data to `arena` at `cursor`
    pub fn encode(
        &self,
        slot: &mut ParameterSlot,
        arena: &mut StringArena<'_>,
        cursor: &mut usize,
    ) -> Result<()> {
        let mut payload = [0u8; 16];
        let mut string_offset = 0;
        let mut string_length = 0;

        match self {
            Value::Empty => {}
            Value::Boolean(v) => payload[0] = *v as u8,
            Value::Char(v) => payload[..2].copy_from_slice(&v.to_le_bytes()),
            Value::SByte(v) => payload[..1].copy_from_slice(&v.to_le_bytes()),
            Value::Byte(v) => payload[0] = *v,
            Value::Int16(v) => payload[..2].copy_from_slice(&v.to_le_bytes()),
            Value::UInt16(v) => payload[..2].copy_from_slice(&v.to_le_bytes()),
            Value::Int32(v) => payload[..4].copy_from_slice(&v.to_le_bytes()),
            Value::UInt32(v) => payload[..4].copy_from_slice(&v.to_le_bytes()),
            Value::Int64(v) | Value::DateTime(v) => {
                payload[..8].copy_from_slice(&v.to_le_bytes())
            }
            Value::UInt64(v) => payload[..8].copy_from_slice(&v.to_le_bytes()),
            Value::Single(v) => payload[..4].copy_from_slice(&v.to_le_bytes()),
            Value::Double(v) => payload[..8].copy_from_slice(&v.to_le_bytes()),
            Value::Decimal(d) => {
                for (i, word) in d.0.iter().enumerate() {
                    payload[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
                }
            }
            Value::Handle(h) => payload[..8].copy_from_slice(&h.0.to_le_bytes()),
            Value::String(None) => string_length = NULL_LENGTH,
            Value::String(Some(text)) => {
                (string_offset, string_length) = arena.write(cursor, text)?;
            }
            Value::Slot(s) => payload[..4].copy_from_slice(&(s.index() as u32).to_le_bytes()),
        }

        *slot = ParameterSlot {
            tag: self.tag() as u32,
            string_length,
            string_offset,
            reserved: 0,
            payload,
        };
        Ok(())
    }

    /// Read the value stored in `slot`
    pub fn decode(slot: &ParameterSlot, arena: &StringArena<'_>) -> Result<Value> {
        let p = &slot.payload;
        let b2 = [p[0], p[1]];
        let b4 = [p[0], p[1], p[2], p[3]];
        let b8 = [p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]];

        Ok(match TypeTag::try_from(slot.tag)? {
            TypeTag::Empty => Value::Empty,
            TypeTag::Boolean => Value::Boolean(p[0] != 0),
            TypeTag::Char => Value::Char(u16::from_le_bytes(b2)),
            TypeTag::SByte => Value::SByte(p[0] as i8),
            TypeTag::Byte => Value::Byte(p[0]),
            TypeTag::Int16 => Value::Int16(i16::from_le_bytes(b2)),
            TypeTag::UInt16 => Value::UInt16(u16::from_le_bytes(b2)),
            TypeTag::Int32 => Value::Int32(i32::from_le_bytes(b4)),
            TypeTag::UInt32 => Value::UInt32(u32::from_le_bytes(b4)),
            TypeTag::Int64 => Value::Int64(i64::from_le_bytes(b8)),
            TypeTag::UInt64 => Value::UInt64(u64::from_le_bytes(b8)),
            TypeTag::Single => Value::Single(f32::from_le_bytes(b4)),
            TypeTag::Double => Value::Double(f64::from_le_bytes(b8)),
            TypeTag::Decimal => {
                let mut words = [0u32; 4];
                for (i, word) in words.iter_mut().enumerate() {
                    *word = u32::from_le_bytes([p[i * 4], p[i * 4 + 1], p[i * 4 + 2], p[i * 4 + 3]]);
                }
                Value::Decimal(Decimal(words))
            }
            TypeTag::DateTime => Value::DateTime(i64::from_le_bytes(b8)),
            TypeTag::Handle => Value::Handle(Handle(u64::from_le_bytes(b8))),
            TypeTag::String => Value::String(arena.read(slot.string_offset, slot.string_length)?),
            TypeTag::SlotRef => Value::Slot(ObjectSlot::new(u32::from_le_bytes(b4) as usize)?),
        })
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from! {
    bool => Boolean,
    i8 => SByte,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Single,
    f64 => Double,
    Decimal => Decimal,
    Handle => Handle,
    ObjectSlot => Slot,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Some(v.to_string()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Some(v))
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        Value::String(v)
    }
}
