//! Generational arena. Entries are addressed by handles that go stale when their entry is removed, so a handle
//! kept past removal is detected instead of silently reaching whatever took its slot.

use std::marker::PhantomData;

use anyhow::Result;

use crate::Error;

/// Handle to an entry in an [`Arena`]. Cheap to copy, never keeps the entry alive.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""), Copy(bound = ""), PartialEq(bound = ""), Eq(bound = ""), Hash(bound = ""))]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    #[derivative(Debug = "ignore")]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Slot index of this handle
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was created
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Storage for values addressed by [`Handle`]s. Freed slots are reused with a bumped generation.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: vec![],
            free: vec![],
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` and return its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        let (index, generation) = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let generation = match slot {
                    Slot::Vacant { generation } => *generation,
                    Slot::Occupied { generation, .. } => generation.wrapping_add(1),
                };
                *slot = Slot::Occupied {
                    generation,
                    value,
                };
                (index, generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    value,
                });
                (index, 0)
            }
        };
        Handle {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Look up an entry.
    /// # Errors
    /// * Fails with [`Error::InvalidHandle`] if the entry was removed.
    pub fn get(&self, handle: Handle<T>) -> Result<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => Ok(value),
            _ => Err(Error::InvalidHandle.into()),
        }
    }

    /// Look up an entry mutably.
    /// # Errors
    /// * Fails with [`Error::InvalidHandle`] if the entry was removed.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => Ok(value),
            _ => Err(Error::InvalidHandle.into()),
        }
    }

    /// Whether `handle` refers to a live entry
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_ok()
    }

    /// Remove an entry and return it. Every copy of `handle` goes stale.
    /// # Errors
    /// * Fails with [`Error::InvalidHandle`] if the entry was already removed.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T> {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return Err(Error::InvalidHandle.into());
        };
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let next = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                let Slot::Occupied { value, .. } = std::mem::replace(slot, next) else {
                    return Err(Error::InvalidHandle.into());
                };
                self.free.push(handle.index);
                self.len -= 1;
                Ok(value)
            }
            _ => Err(Error::InvalidHandle.into()),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                Handle {
                    index: index as u32,
                    generation: *generation,
                    _marker: PhantomData,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }
}
