//! Arena storage for ownership-graph nodes.
//!
//! The ownership DAG stores its nodes in an arena and refers to them by
//! index, never by pointer. Structural edits (context creation, migration,
//! ownership transfer) remove nodes while other code still holds indices
//! to them, so every index carries a generation counter: a stale index to
//! a recycled slot fails the generation check instead of aliasing a new
//! node.
//!
//! Each slot keeps its generation across the occupied/vacant boundary;
//! the counter bumps on removal, so the stale window opens the moment a
//! node is deleted, not when the slot is reused. Vacant slots are tracked
//! on an explicit free stack, reused LIFO.
//!
//! No unsafe code; relies on bounds checking and generation validation.

use core::fmt;
use core::hash::{Hash, Hasher};

/// An index into an [`Arena`], tagged with a generation counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Creates an arena index from raw parts (primarily for testing).
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the raw slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.index, self.generation)
    }
}

impl Hash for ArenaIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let packed = (u64::from(self.index) << 32) | u64::from(self.generation);
        state.write_u64(packed);
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn live(&self, generation: u32) -> Option<&T> {
        if self.generation == generation {
            self.value.as_ref()
        } else {
            None
        }
    }
}

/// A generational arena: stable indices, slot reuse, stale-index detection.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates a new empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Returns true if the arena has no occupied slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a value and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none(), "free stack pointed to live slot");
            slot.value = Some(value);
            return ArenaIndex {
                index,
                generation: slot.generation,
            };
        }
        assert!(self.slots.len() < u32::MAX as usize, "arena capacity exceeded");
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ArenaIndex {
            index,
            generation: 0,
        }
    }

    /// Returns a reference to the value at `index`, or `None` if the index
    /// is stale or out of bounds.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        self.slots
            .get(index.index as usize)
            .and_then(|slot| slot.live(index.generation))
    }

    /// Returns a mutable reference to the value at `index`.
    #[must_use]
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        let slot = self.slots.get_mut(index.index as usize)?;
        if slot.generation == index.generation {
            slot.value.as_mut()
        } else {
            None
        }
    }

    /// Removes and returns the value at `index`. The slot's generation
    /// bumps immediately, so every outstanding copy of `index` is stale
    /// from this point on; the slot itself is recycled LIFO.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.index as usize)?;
        if slot.generation != index.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index.index);
        value
    }

    /// Returns true if `index` refers to a live value.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over `(index, value)` pairs of occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ArenaIndex {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Arena;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn recycled_slot_invalidates_old_index() {
        let mut arena = Arena::new();
        let a = arena.insert(1_u32);
        arena.remove(a);
        let b = arena.insert(2_u32);
        // Same slot, new generation.
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn double_remove_returns_nothing() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(a), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let _b = arena.insert("b");
        arena.remove(a);
        let live: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec!["b"]);
    }
}
