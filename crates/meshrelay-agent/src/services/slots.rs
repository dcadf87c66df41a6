// ============================================
// File: crates/meshrelay-agent/src/services/slots.rs
// ============================================
//! # Slot Table
//!
//! ## Creation Reason
//! Hop-local stream and association ids are indices into a per-agent
//! arena. A freed index is reused with a bumped generation so a stale id
//! from an old stream never addresses a new one.
//!
//! ## Id Layout
//! ```text
//!  63   62            32 31             0
//! ┌───┬────────────────┬────────────────┐
//! │ 0 │   generation   │     index      │
//! └───┴────────────────┴────────────────┘
//!  reply bit (set on the wire by the far end, never by the table)
//! ```
//! Generations start at 1, so no valid id is ever 0.
//!
//! ## Last Modified
//! v0.1.0 - Initial slot table

/// Top bit of a wire stream id; marks frames travelling back toward the
/// agent that allocated the id.
pub const REPLY_BIT: u64 = 1 << 63;

const MAX_GENERATION: u32 = 0x7FFF_FFFF;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational arena keyed by `u64` ids.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn encode(index: u32, generation: u32) -> u64 {
        (u64::from(generation) << 32) | u64::from(index)
    }

    fn decode(id: u64) -> Option<(usize, u32)> {
        if id & REPLY_BIT != 0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let generation = (id >> 32) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let index = id as u32;
        (generation != 0).then_some((index as usize, generation))
    }

    /// Stores `value`; the closure receives the new id before insertion.
    ///
    /// Returns `None` when the index space is exhausted.
    pub fn insert_with(&mut self, make: impl FnOnce(u64) -> T) -> Option<u64> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = if slot.generation >= MAX_GENERATION {
            1
        } else {
            slot.generation + 1
        };
        let id = Self::encode(index, slot.generation);
        slot.value = Some(make(id));
        self.len += 1;
        Some(id)
    }

    /// Stores `value` and returns its id.
    pub fn insert(&mut self, value: T) -> Option<u64> {
        self.insert_with(|_| value)
    }

    /// Value for a live id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&T> {
        let (index, generation) = Self::decode(id)?;
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Removes and returns the value for a live id.
    pub fn remove(&mut self, id: u64) -> Option<T> {
        let (index, generation) = Self::decode(id)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        #[allow(clippy::cast_possible_truncation)]
        self.free.push(index as u32);
        self.len -= 1;
        Some(value)
    }

    /// Number of live values.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when nothing is stored.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live values.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_nonzero_without_reply_bit() {
        let mut table = SlotTable::new();
        for i in 0..100 {
            let id = table.insert(i).unwrap();
            assert_ne!(id, 0);
            assert_eq!(id & REPLY_BIT, 0);
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_stale_id_misses_after_reuse() {
        let mut table = SlotTable::new();
        let first = table.insert("old").unwrap();
        assert_eq!(table.remove(first), Some("old"));

        let second = table.insert("new").unwrap();
        assert_ne!(first, second);
        assert_eq!(first as u32, second as u32);
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"new"));
        assert_eq!(table.remove(first), None);
    }

    #[test]
    fn test_reply_bit_and_zero_rejected() {
        let mut table = SlotTable::new();
        let id = table.insert(1).unwrap();
        assert_eq!(table.get(id | REPLY_BIT), None);
        assert_eq!(table.get(0), None);
    }

    #[test]
    fn test_insert_with_sees_id() {
        let mut table = SlotTable::new();
        let id = table.insert_with(|id| id * 2).unwrap();
        assert_eq!(table.get(id), Some(&(id * 2)));
    }

    #[test]
    fn test_values_and_double_remove() {
        let mut table = SlotTable::new();
        let a = table.insert(1).unwrap();
        table.insert(2).unwrap();
        assert_eq!(table.values().copied().sum::<i32>(), 3);

        table.remove(a);
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
    }
}
