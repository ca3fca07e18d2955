use std::mem::MaybeUninit;

/// Byte pattern written over dead slot storage in debug builds, to make use-after-free visible.
#[cfg(debug_assertions)]
const POISON_BYTE: u8 = 0xFE;

/// One storage cell of a page: room for a `T` plus the generation of its current occupant.
///
/// A generation of zero means the slot is empty and `value` is uninitialized. Any other value
/// means `value` holds a live `T` that was stamped with that generation when it was stored.
///
/// Slots never move: they are written in place when their page is created and are only ever
/// accessed through pointers into that page.
#[repr(C)]
pub(crate) struct Slot<T> {
    value: MaybeUninit<T>,
    generation: u32,
}

impl<T> Slot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub(crate) fn empty() -> Self {
        let mut slot = Self {
            value: MaybeUninit::uninit(),
            generation: 0,
        };

        slot.poison();
        slot
    }

    #[must_use]
    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.generation == 0
    }

    /// Returns the stored value if the slot currently holds the occupant stamped with
    /// `generation`.
    #[must_use]
    #[inline]
    pub(crate) fn get(&self, generation: u32) -> Option<&T> {
        if self.is_empty() || self.generation != generation {
            return None;
        }

        // SAFETY: A non-zero generation means `value` was initialized by `init()` and has not
        // been destroyed or taken since.
        Some(unsafe { self.value.assume_init_ref() })
    }

    /// Returns the stored value if the slot currently holds the occupant stamped with
    /// `generation`.
    #[must_use]
    #[inline]
    pub(crate) fn get_mut(&mut self, generation: u32) -> Option<&mut T> {
        if self.is_empty() || self.generation != generation {
            return None;
        }

        // SAFETY: A non-zero generation means `value` was initialized by `init()` and has not
        // been destroyed or taken since.
        Some(unsafe { self.value.assume_init_mut() })
    }

    /// Stores `value` in the slot and stamps it with `generation`.
    ///
    /// # Panics
    ///
    /// Panics if `generation` is zero. In debug builds, panics if the slot is not empty.
    pub(crate) fn init(&mut self, generation: u32, value: T) {
        assert!(generation != 0, "slot generation zero is reserved for empty slots");
        debug_assert!(
            self.is_empty(),
            "slot already holds an occupant of generation {}",
            self.generation
        );

        self.value.write(value);
        self.generation = generation;
    }

    /// Drops the stored value and marks the slot as empty.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the slot is already empty.
    pub(crate) fn destroy(&mut self) {
        debug_assert!(!self.is_empty(), "cannot destroy an empty slot");

        // Mark as empty first, so a panicking destructor cannot lead to a double drop.
        self.generation = 0;

        // SAFETY: The slot was occupied, so `value` is initialized. We just marked the slot
        // as empty, so nothing will read or drop the value again.
        unsafe {
            self.value.assume_init_drop();
        }

        self.poison();
    }

    /// Moves the stored value out and marks the slot as empty.
    ///
    /// # Panics
    ///
    /// Panics if the slot is empty.
    #[must_use]
    pub(crate) fn take(&mut self) -> T {
        assert!(!self.is_empty(), "cannot take a value out of an empty slot");

        self.generation = 0;

        // SAFETY: The slot was occupied, so `value` is initialized. We just marked the slot
        // as empty, so this is the only read of the value.
        let value = unsafe { self.value.assume_init_read() };

        self.poison();
        value
    }

    #[cfg_attr(test, mutants::skip)] // Debug aid only, no observable contract.
    #[inline]
    fn poison(&mut self) {
        #[cfg(debug_assertions)]
        {
            // SAFETY: The storage is uninitialized, so any byte pattern is acceptable and
            // nothing will interpret these bytes as a `T` before `init()` overwrites them.
            unsafe {
                self.value
                    .as_mut_ptr()
                    .cast::<u8>()
                    .write_bytes(POISON_BYTE, size_of::<T>());
            }
        }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if !self.is_empty() {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    /// Test helper that counts how many times it has been dropped.
    struct DropCounter {
        drops: Rc<Cell<usize>>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn new_slot_is_empty() {
        let slot = Slot::<u64>::empty();

        assert!(slot.is_empty());
        assert_eq!(slot.generation(), 0);
        assert!(slot.get(0).is_none());
        assert!(slot.get(1).is_none());
    }

    #[test]
    fn init_then_get_with_matching_generation() {
        let mut slot = Slot::empty();
        slot.init(5, "node".to_string());

        assert!(!slot.is_empty());
        assert_eq!(slot.generation(), 5);
        assert_eq!(slot.get(5).map(String::as_str), Some("node"));
        assert!(slot.get(4).is_none());
        assert!(slot.get(6).is_none());
    }

    #[test]
    fn get_mut_modifies_value() {
        let mut slot = Slot::empty();
        slot.init(1, 10_u32);

        *slot.get_mut(1).unwrap() += 5;
        assert!(slot.get_mut(2).is_none());

        assert_eq!(slot.get(1), Some(&15));
    }

    #[test]
    fn destroy_drops_value_and_empties_slot() {
        let drops = Rc::new(Cell::new(0));
        let mut slot = Slot::empty();
        slot.init(
            1,
            DropCounter {
                drops: Rc::clone(&drops),
            },
        );

        slot.destroy();

        assert_eq!(drops.get(), 1);
        assert!(slot.is_empty());
        assert!(slot.get(1).is_none());
    }

    #[test]
    fn take_moves_value_without_dropping() {
        let drops = Rc::new(Cell::new(0));
        let mut slot = Slot::empty();
        slot.init(
            2,
            DropCounter {
                drops: Rc::clone(&drops),
            },
        );

        let value = slot.take();
        assert_eq!(drops.get(), 0);
        assert!(slot.is_empty());

        drop(value);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn dropping_occupied_slot_drops_value() {
        let drops = Rc::new(Cell::new(0));
        let mut slot = Slot::empty();
        slot.init(
            1,
            DropCounter {
                drops: Rc::clone(&drops),
            },
        );

        drop(slot);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn slot_can_be_reused_with_higher_generation() {
        let mut slot = Slot::empty();
        slot.init(1, 'a');
        slot.destroy();
        slot.init(2, 'b');

        assert!(slot.get(1).is_none());
        assert_eq!(slot.get(2), Some(&'b'));
    }

    #[test]
    #[should_panic]
    fn init_with_zero_generation_panics() {
        let mut slot = Slot::empty();
        slot.init(0, 1_u8);
    }

    #[test]
    #[should_panic]
    fn take_from_empty_slot_panics() {
        let mut slot = Slot::<u8>::empty();
        _ = slot.take();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn double_destroy_panics_in_debug() {
        let mut slot = Slot::empty();
        slot.init(1, 1_u8);
        slot.destroy();
        slot.destroy();
    }
}
