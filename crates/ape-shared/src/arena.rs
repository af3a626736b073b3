//! String arena: UTF-16 payloads referenced by (offset, length) pairs
//!
//! The arena is append-only within a batch. Offsets are byte offsets from the
//! start of the region, lengths are UTF-16 code units. A length of `-1`
//! denotes "no string" (null), which is distinct from the empty string.

use crate::error::{Error, Result};

/// Length value that marks an absent string
pub const NULL_LENGTH: i32 = -1;

/// View over the string arena bytes
pub struct StringArena<'a> {
    bytes: &'a mut [u8],
}

impl<'a> StringArena<'a> {
    /// Wrap a byte region
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Append `text` as UTF-16LE at `cursor`, advancing it.
    /// Returns the byte offset and the length in code units.
    pub fn write(&mut self, cursor: &mut usize, text: &str) -> Result<(u32, i32)> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let needed = units.len() * 2;
        let available = self.capacity().saturating_sub(*cursor);
        if needed > available {
            return Err(Error::ArenaOverflow { needed, available });
        }
        Ok(self.put(cursor, &units))
    }

    /// Like [`StringArena::write`] but cuts the text to whatever still fits
    pub fn write_truncated(&mut self, cursor: &mut usize, text: &str) -> (u32, i32) {
        let available_units = self.capacity().saturating_sub(*cursor) / 2;
        let mut units: Vec<u16> = text.encode_utf16().collect();
        if units.len() > available_units {
            units.truncate(available_units);
            // Don't leave half a surrogate pair behind
            if let Some(&last) = units.last()
                && (0xD800..0xDC00).contains(&last)
            {
                units.pop();
            }
        }
        self.put(cursor, &units)
    }

    fn put(&mut self, cursor: &mut usize, units: &[u16]) -> (u32, i32) {
        let offset = *cursor;
        for (i, unit) in units.iter().enumerate() {
            let at = offset + i * 2;
            self.bytes[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        *cursor = offset + units.len() * 2;
        (offset as u32, units.len() as i32)
    }

    /// Read a string previously written with [`StringArena::write`]
    pub fn read(&self, offset: u32, length: i32) -> Result<Option<String>> {
        if length == NULL_LENGTH {
            return Ok(None);
        }
        if length < 0 {
            return Err(Error::MalformedMessage(format!(
                "negative string length {length}"
            )));
        }
        let start = offset as usize;
        let end = start + length as usize * 2;
        if end > self.capacity() {
            return Err(Error::MalformedMessage(format!(
                "string [{start}..{end}) outside arena of {} bytes",
                self.capacity()
            )));
        }
        let units: Vec<u16> = self.bytes[start..end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Some(String::from_utf16_lossy(&units)))
    }
}
