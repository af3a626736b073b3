//! Per-batch object table addressed by [`ObjectSlot`]

use ape_shared::{OBJECT_SLOTS, ObjectSlot};

use crate::error::HandlerError;
use crate::object::Item;

/// Ten slots that keep host objects alive between commands of one batch
pub struct ObjectTable {
    slots: [Option<Item>; OBJECT_SLOTS],
}

impl ObjectTable {
    /// Every slot empty
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Content of `slot`, or [`HandlerError::EmptySlot`]
    pub fn get(&self, slot: ObjectSlot) -> Result<&Item, HandlerError> {
        self.peek(slot).ok_or(HandlerError::EmptySlot(slot))
    }

    /// Content of `slot`, if any
    pub fn peek(&self, slot: ObjectSlot) -> Option<&Item> {
        self.slots[slot.index()].as_ref()
    }

    /// Store into `slot`, replacing what was there
    pub fn put(&mut self, slot: ObjectSlot, item: Item) {
        self.slots[slot.index()] = Some(item);
    }

    /// Drop every reference held
    pub fn clear_all(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// True when no slot holds anything
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
