use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::{Slot, TypeTag};

/// Size in bytes of every page.
pub const PAGE_BYTES: usize = 16 * 1024;

/// Alignment of every page. Equal to the page size, so the start of a page can be recovered from
/// the address of any slot inside it by rounding down.
pub const PAGE_ALIGNMENT: usize = PAGE_BYTES;

const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_BYTES, PAGE_ALIGNMENT) {
    Ok(layout) => layout,
    Err(_) => panic!("page size must be a non-zero power of two"),
};

#[cfg(debug_assertions)]
const FENCE_VALUE: u32 = 0x1234_5678;

/// Written once at the start of every page, identifying the element type the page stores.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct PageHeader {
    type_tag: TypeTag,

    /// Lets debug builds detect a rounded-down address that is not actually a page start.
    #[cfg(debug_assertions)]
    fence: u32,
}

impl PageHeader {
    #[must_use]
    pub(crate) fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Recovers the header of the page that contains `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a page that is alive for the lifetime `'a`.
    #[must_use]
    pub(crate) unsafe fn from_interior_ptr<'a>(ptr: NonNull<u8>) -> &'a Self {
        let offset = ptr.addr().get() & (PAGE_ALIGNMENT - 1);

        // SAFETY: The caller guarantees `ptr` is inside a live page. Pages are aligned to
        // PAGE_ALIGNMENT and hold their header at offset zero, so stepping back by the offset
        // within the alignment lands exactly on the header.
        let header = unsafe { ptr.byte_sub(offset).cast::<Self>().as_ref() };

        #[cfg(debug_assertions)]
        assert_eq!(
            header.fence, FENCE_VALUE,
            "address {:#x} is not inside a node page",
            ptr.addr().get()
        );

        header
    }
}

/// Returns the start address of the page that would contain `address`.
#[must_use]
#[inline]
pub(crate) fn page_start(address: usize) -> usize {
    address & !(PAGE_ALIGNMENT - 1)
}

/// Exclusive owner of one page of slots for elements of type `T`.
///
/// The page is a single `PAGE_BYTES` allocation aligned to `PAGE_ALIGNMENT`, laid out as a
/// [`PageHeader`] followed by `CAPACITY` slots. The page never moves or resizes and never holds
/// references to its contents, so slot pointers stay valid for as long as the page lives.
///
/// Dropping the page drops every value still stored in its slots, then releases the memory.
pub(crate) struct Page<T: 'static> {
    ptr: NonNull<u8>,

    _slots: PhantomData<Slot<T>>,
}

impl<T: 'static> Page<T> {
    /// Byte offset of the first slot, after the header and any padding the slot needs.
    const SLOTS_OFFSET: usize = size_of::<PageHeader>().next_multiple_of(align_of::<Slot<T>>());

    /// Number of slots in each page.
    #[allow(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "evaluated at compile time, where overflow is a compile error"
    )]
    pub(crate) const CAPACITY: usize = (PAGE_BYTES - Self::SLOTS_OFFSET) / size_of::<Slot<T>>();

    /// Allocates a new page with every slot empty.
    ///
    /// Allocation failure is not recoverable: it aborts through [`handle_alloc_error`].
    #[must_use]
    pub(crate) fn new() -> Self {
        const {
            assert!(
                align_of::<Slot<T>>() <= PAGE_ALIGNMENT,
                "node types cannot be aligned more strictly than a page"
            );
            assert!(Self::CAPACITY >= 1, "node type is too large to fit in a page");
        }

        // SAFETY: PAGE_LAYOUT has a non-zero size.
        let ptr = unsafe { alloc(PAGE_LAYOUT) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(PAGE_LAYOUT);
        };

        // SAFETY: The allocation is PAGE_BYTES long and aligned to PAGE_ALIGNMENT, which satisfies
        // the size and alignment of the header that goes at its start.
        unsafe {
            ptr.cast::<PageHeader>().write(PageHeader {
                type_tag: TypeTag::of::<T>(),
                #[cfg(debug_assertions)]
                fence: FENCE_VALUE,
            });
        }

        let page = Self {
            ptr,
            _slots: PhantomData,
        };

        for index in 0..Self::CAPACITY {
            // SAFETY: slot_ptr() only returns in-bounds, properly aligned slot addresses and
            // nothing has been written there yet, so there is no previous value to drop.
            unsafe {
                page.slot_ptr(index).write(Slot::empty());
            }
        }

        #[cfg(test)]
        accounting::record_allocation();

        debug!(
            page = page.address(),
            node_type = std::any::type_name::<T>(),
            capacity = Self::CAPACITY,
            "allocated node page"
        );

        page
    }

    /// Returns a pointer to the slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub(crate) fn slot_ptr(&self, index: usize) -> NonNull<Slot<T>> {
        assert!(
            index < Self::CAPACITY,
            "slot {index} index out of bounds in page of capacity {}",
            Self::CAPACITY
        );

        // Cannot overflow: the bounds check above keeps us inside the page.
        let offset = Self::SLOTS_OFFSET.wrapping_add(index.wrapping_mul(size_of::<Slot<T>>()));

        // SAFETY: The offset is within the PAGE_BYTES allocation, per the bounds check above.
        unsafe { self.ptr.byte_add(offset).cast::<Slot<T>>() }
    }

    /// Returns the index of the slot `slot` points to, or `None` if it is not a slot of this page.
    #[must_use]
    pub(crate) fn slot_index(&self, slot: NonNull<Slot<T>>) -> Option<usize> {
        let offset = slot
            .addr()
            .get()
            .checked_sub(self.address())?
            .checked_sub(Self::SLOTS_OFFSET)?;

        if offset.checked_rem(size_of::<Slot<T>>())? != 0 {
            return None;
        }

        let index = offset.checked_div(size_of::<Slot<T>>())?;
        (index < Self::CAPACITY).then_some(index)
    }

    /// The start address of the page allocation.
    #[must_use]
    #[inline]
    pub(crate) fn address(&self) -> usize {
        self.ptr.addr().get()
    }

    #[must_use]
    pub(crate) fn header(&self) -> &PageHeader {
        // SAFETY: The page is alive while we hold &self and new() wrote the header at its start.
        unsafe { self.ptr.cast::<PageHeader>().as_ref() }
    }
}

impl<T: 'static> Drop for Page<T> {
    fn drop(&mut self) {
        // Drop every slot in place. Occupied slots drop their values as part of this.
        for index in 0..Self::CAPACITY {
            // SAFETY: Every slot was initialized in new() and each one is dropped exactly once.
            unsafe {
                ptr::drop_in_place(self.slot_ptr(index).as_ptr());
            }
        }

        // SAFETY: We allocated this memory with PAGE_LAYOUT in new() and nothing refers to it
        // any more, since all slots have been dropped above.
        unsafe {
            dealloc(self.ptr.as_ptr(), PAGE_LAYOUT);
        }

        #[cfg(test)]
        accounting::record_deallocation();

        debug!(
            page = self.address(),
            node_type = std::any::type_name::<T>(),
            "released node page"
        );
    }
}

impl<T: 'static> std::fmt::Debug for Page<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

// SAFETY: The page exclusively owns its allocation and the values stored in it, so moving it to
// another thread is exactly like moving the values themselves.
unsafe impl<T: Send + 'static> Send for Page<T> {}

// SAFETY: Shared access to the page only ever produces shared access to the stored values.
unsafe impl<T: Sync + 'static> Sync for Page<T> {}

/// Per-thread counters of page allocations, used by tests to verify that pages are released.
#[cfg(test)]
pub(crate) mod accounting {
    use std::cell::Cell;

    thread_local! {
        static ALLOCATED: Cell<usize> = const { Cell::new(0) };
        static RELEASED: Cell<usize> = const { Cell::new(0) };
    }

    pub(crate) fn record_allocation() {
        ALLOCATED.with(|count| count.set(count.get().wrapping_add(1)));
    }

    pub(crate) fn record_deallocation() {
        RELEASED.with(|count| count.set(count.get().wrapping_add(1)));
    }

    /// Returns the number of pages allocated and released so far on the current thread.
    pub(crate) fn counts() -> (usize, usize) {
        (ALLOCATED.with(Cell::get), RELEASED.with(Cell::get))
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    #[repr(C)]
    struct Pod16 {
        a: u64,
        b: u64,
    }

    assert_impl_all!(Page<u32>: Send, Sync);
    assert_not_impl_any!(Page<Rc<u32>>: Send, Sync);

    #[test]
    fn page_is_aligned_and_tagged() {
        let page = Page::<Pod16>::new();

        assert_eq!(page.address() % PAGE_ALIGNMENT, 0);
        assert!(page.header().type_tag().is::<Pod16>());
    }

    #[test]
    fn capacity_fits_in_page() {
        let end = Page::<Pod16>::SLOTS_OFFSET + Page::<Pod16>::CAPACITY * size_of::<Slot<Pod16>>();
        assert!(end <= PAGE_BYTES);
        assert!(end + size_of::<Slot<Pod16>>() > PAGE_BYTES);

        assert!(Page::<u8>::CAPACITY > Page::<Pod16>::CAPACITY);
        assert_eq!(Page::<[u8; 8000]>::CAPACITY, 2);
    }

    #[test]
    fn new_page_slots_are_empty() {
        let page = Page::<u64>::new();

        for index in 0..Page::<u64>::CAPACITY {
            let slot = unsafe { page.slot_ptr(index).as_ref() };
            assert!(slot.is_empty());
        }
    }

    #[test]
    #[should_panic]
    fn slot_ptr_out_of_bounds_panics() {
        let page = Page::<u64>::new();
        _ = page.slot_ptr(Page::<u64>::CAPACITY);
    }

    #[test]
    fn slot_index_round_trips_and_rejects_foreign_addresses() {
        let page = Page::<Pod16>::new();
        let other = Page::<Pod16>::new();

        for index in [0, 1, Page::<Pod16>::CAPACITY - 1] {
            assert_eq!(page.slot_index(page.slot_ptr(index)), Some(index));
        }

        assert_eq!(page.slot_index(other.slot_ptr(0)), None);

        let misaligned = unsafe { page.slot_ptr(1).byte_add(4) };
        assert_eq!(page.slot_index(misaligned), None);
    }

    #[test]
    fn header_is_recovered_from_interior_pointer() {
        let page = Page::<String>::new();
        let last = page.slot_ptr(Page::<String>::CAPACITY - 1);

        assert_eq!(page_start(last.addr().get()), page.address());

        let header = unsafe { PageHeader::from_interior_ptr(last.cast::<u8>()) };
        assert!(header.type_tag().is::<String>());
        assert!(!header.type_tag().is::<u64>());
    }

    #[test]
    fn dropping_page_drops_live_values_and_releases_memory() {
        struct Tracked(Rc<Cell<usize>>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let (allocated_before, released_before) = accounting::counts();

        let page = Page::<Tracked>::new();
        for (generation, index) in [(1, 0), (1, 3), (7, 5)] {
            let slot = unsafe { page.slot_ptr(index).as_mut() };
            slot.init(generation, Tracked(Rc::clone(&drops)));
        }

        drop(page);

        assert_eq!(drops.get(), 3);

        let (allocated_after, released_after) = accounting::counts();
        assert_eq!(allocated_after - allocated_before, 1);
        assert_eq!(released_after - released_before, 1);
    }
}
