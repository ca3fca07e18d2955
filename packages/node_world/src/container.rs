use std::any::type_name;
use std::ptr::NonNull;
use std::{fmt, thread};

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, trace};

use crate::{
    DropPolicy, Error, NodeContainerBuilder, NodeRef, Page, PageHeader, Result, Slot, TypeTag,
    UntypedNodeRef, page_start,
};

/// A growable, paged store of nodes of one type, handing out generation-checked handles.
///
/// Nodes are stored in fixed-size pages that are allocated on demand and never move or shrink
/// while the container lives, so a node stays at the same address from insertion until removal.
/// Freed slots are kept on a free list and reused most-recently-freed first. Every reuse stamps
/// the slot with a new generation, so handles to earlier occupants stop resolving.
///
/// # Examples
///
/// ```
/// use node_world::NodeContainer;
///
/// let mut container = NodeContainer::new();
///
/// let first = container.add("first".to_string());
/// let second = container.add("second".to_string());
/// assert_eq!(container.len(), 2);
///
/// container.remove(first);
/// assert_eq!(container.get(first), None);
/// assert_eq!(container.get(second).map(String::as_str), Some("second"));
///
/// // The freed slot is reused, but the old handle stays invalid.
/// let third = container.add("third".to_string());
/// assert_eq!(container.get(first), None);
/// assert_eq!(container.get(third).map(String::as_str), Some("third"));
/// ```
///
/// # Thread safety
///
/// The container has no internal synchronization. It is [`Send`] if `T` is [`Send`] and [`Sync`]
/// if `T` is [`Sync`]; all mutation requires an exclusive reference.
pub struct NodeContainer<T: 'static> {
    /// Pages are only ever appended. Their memory is released when the container is dropped.
    pages: Vec<Page<T>>,

    /// Maps the start address of each page to its index in `pages`. This is how a handle is
    /// verified to belong to this container before any memory behind it is touched.
    page_directory: HashMap<usize, usize>,

    /// Stack of slots that held a node before. The most recently freed slot is reused first.
    free_list: Vec<FreeSlot<T>>,

    /// Index, counted across all pages in order, of the first slot that has never held a node.
    /// Every slot from here to the end of the last page is empty and is handed out only once
    /// the free list is exhausted.
    fresh_cursor: usize,

    /// Number of live nodes.
    length: usize,

    /// Number of slots whose generation is exhausted and that will never be reused.
    retired: usize,

    drop_policy: DropPolicy,
}

/// An empty slot waiting for reuse, with the generation of its most recent occupant
/// (zero if it never had one).
struct FreeSlot<T> {
    slot: NonNull<Slot<T>>,
    generation: u32,
}

// SAFETY: A free list entry is an inert address. It is only dereferenced by the container that
// owns the slot, which is itself subject to the thread safety rules of `T`.
unsafe impl<T> Send for FreeSlot<T> {}

// SAFETY: See `Send` above.
unsafe impl<T> Sync for FreeSlot<T> {}

impl<T: 'static> NodeContainer<T> {
    /// Number of nodes that fit in each page of this container.
    pub const PAGE_CAPACITY: usize = Page::<T>::CAPACITY;

    /// Creates an empty container with the default configuration.
    ///
    /// No memory is allocated until the first node is added.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring and constructing a [`NodeContainer`].
    ///
    /// # Example
    ///
    /// ```
    /// use node_world::{DropPolicy, NodeContainer};
    ///
    /// let container = NodeContainer::<u64>::builder()
    ///     .drop_policy(DropPolicy::MustNotDropItems)
    ///     .build();
    ///
    /// assert!(container.is_empty());
    /// ```
    #[inline]
    pub fn builder() -> NodeContainerBuilder<T> {
        NodeContainerBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(drop_policy: DropPolicy) -> Self {
        Self {
            pages: Vec::new(),
            page_directory: HashMap::new(),
            free_list: Vec::new(),
            fresh_cursor: 0,
            length: 0,
            retired: 0,
            drop_policy,
        }
    }

    /// The number of live nodes in the container.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the container has no live nodes.
    ///
    /// An empty container may still hold pages.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The total number of slots in all pages of the container, live or not.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        // Overflow here would imply capacity is greater than virtual memory - impossible.
        self.pages.len().wrapping_mul(Self::PAGE_CAPACITY)
    }

    /// The number of pages the container has allocated.
    #[must_use]
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// The number of slots that have been retired because their generation counter is exhausted.
    ///
    /// A slot is retired instead of being reused once it has held `u32::MAX` generations, so that
    /// a stale handle can never match a later occupant.
    #[must_use]
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired
    }

    /// The [drop policy][DropPolicy] the container was created with.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// Ensures that at least `additional` more nodes can be added without allocating.
    ///
    /// Capacity is allocated in whole pages. Slots of pages allocated here are handed out only
    /// after the slots that were already free.
    ///
    /// # Example
    ///
    /// ```
    /// use node_world::NodeContainer;
    ///
    /// let mut container = NodeContainer::<u32>::new();
    /// container.reserve(1000);
    ///
    /// let pages = container.page_count();
    /// for i in 0..1000 {
    ///     container.add(i);
    /// }
    ///
    /// assert_eq!(container.page_count(), pages);
    /// ```
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    pub fn reserve(&mut self, additional: usize) {
        while self.vacant_count() < additional {
            self.add_page();
        }
    }

    /// Adds a node to the container and returns a handle to it.
    ///
    /// This always succeeds, allocating a new page if no slot is free. Allocation failure is
    /// fatal.
    pub fn add(&mut self, value: T) -> NodeRef<T> {
        self.add_with(|_| value)
    }

    /// Adds a node built by `f`, which receives the handle the node will be stored under.
    ///
    /// This is useful for nodes that need to refer to themselves.
    ///
    /// If `f` panics, no node is added and all existing handles are unaffected.
    ///
    /// # Example
    ///
    /// ```
    /// use node_world::{NodeContainer, NodeRef};
    ///
    /// struct TreeNode {
    ///     this: NodeRef<TreeNode>,
    ///     parent: NodeRef<TreeNode>,
    /// }
    ///
    /// let mut tree = NodeContainer::new();
    /// let root = tree.add_with(|this| TreeNode {
    ///     this,
    ///     parent: NodeRef::null(),
    /// });
    /// let child = tree.add_with(|this| TreeNode { this, parent: root });
    ///
    /// assert_eq!(tree.get(root).unwrap().this, root);
    /// assert_eq!(tree.get(child).unwrap().parent, root);
    /// ```
    pub fn add_with(&mut self, f: impl FnOnce(NodeRef<T>) -> T) -> NodeRef<T> {
        let mut vacant = self.peek_vacant();

        let generation = vacant
            .generation
            .checked_add(1)
            .expect("slots with an exhausted generation are retired, never returned to the free list");

        let node = NodeRef::from_parts(vacant.slot, generation);

        // Build the value before touching any state, so a panic leaves the container unchanged.
        let value = f(node);

        self.claim_vacant();

        // SAFETY: Vacant slots always point into pages owned by this container and we have
        // exclusive access to the container, hence to the slot.
        let slot = unsafe { vacant.slot.as_mut() };
        slot.init(generation, value);

        // This can never overflow since that would mean the container is greater than virtual memory.
        self.length = self.length.wrapping_add(1);

        node
    }

    /// Returns a reference to the node `node` refers to, if it is alive in this container.
    ///
    /// Returns `None` for the null handle, for handles to removed nodes (even if their slot has
    /// been reused) and for handles issued by a different container.
    #[must_use]
    pub fn get(&self, node: NodeRef<T>) -> Option<&T> {
        let slot = self.owned_slot(node)?;

        // SAFETY: The slot is in one of our pages, which live as long as we do, and we only
        // create exclusive references to slots while holding an exclusive reference to self.
        let slot = unsafe { slot.as_ref() };
        slot.get(node.generation())
    }

    /// Returns an exclusive reference to the node `node` refers to, if it is alive in this
    /// container.
    #[must_use]
    pub fn get_mut(&mut self, node: NodeRef<T>) -> Option<&mut T> {
        let mut slot = self.owned_slot(node)?;

        // SAFETY: The slot is in one of our pages and we hold an exclusive reference to self.
        let slot = unsafe { slot.as_mut() };
        slot.get_mut(node.generation())
    }

    /// Returns `true` if `node` refers to a live node of this container.
    #[must_use]
    #[inline]
    pub fn contains(&self, node: NodeRef<T>) -> bool {
        self.get(node).is_some()
    }

    /// Removes and drops the node `node` refers to, making its slot available for reuse.
    ///
    /// After removal, `node` and all copies of it permanently stop resolving.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `node` is null, belongs to a different container or refers to
    /// a node that has already been removed. Release builds ignore such calls.
    /// Use [`try_remove()`](Self::try_remove) to handle these cases explicitly.
    pub fn remove(&mut self, node: NodeRef<T>) {
        if let Err(error) = self.try_remove(node) {
            report_invalid_removal(&error);
        }
    }

    /// Removes and drops the node `node` refers to, or explains why that is not possible.
    ///
    /// A stale handle never affects the slot's current occupant.
    ///
    /// # Example
    ///
    /// ```
    /// use node_world::{Error, NodeContainer};
    ///
    /// let mut container = NodeContainer::new();
    /// let node = container.add(1_u8);
    ///
    /// assert_eq!(container.try_remove(node), Ok(()));
    /// assert!(matches!(
    ///     container.try_remove(node),
    ///     Err(Error::StaleHandle { .. })
    /// ));
    /// ```
    pub fn try_remove(&mut self, node: NodeRef<T>) -> Result<()> {
        let slot = self.checked_slot_mut(node)?;
        let value = slot.take();

        // Bookkeeping first, so a panicking destructor cannot leave the slot unaccounted for.
        self.release(node);
        drop(value);

        Ok(())
    }

    /// Removes the node `node` refers to and returns it instead of dropping it.
    ///
    /// Returns `None` if `node` does not refer to a live node of this container.
    #[must_use]
    pub fn take(&mut self, node: NodeRef<T>) -> Option<T> {
        let slot = self.checked_slot_mut(node).ok()?;
        let value = slot.take();

        self.release(node);
        Some(value)
    }

    /// Removes and drops every node. All existing handles stop resolving; pages are retained.
    pub fn clear(&mut self) {
        let nodes = self.iter().map(|(node, _)| node).collect::<Vec<_>>();

        for node in nodes {
            self.remove(node);
        }
    }

    /// Iterates over all live nodes, in page and slot order, together with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (NodeRef<T>, &T)> + '_ {
        self.pages.iter().flat_map(|page| {
            (0..Self::PAGE_CAPACITY).filter_map(move |index| {
                let ptr = page.slot_ptr(index);

                // SAFETY: The page is alive while self is borrowed and no exclusive references
                // to its slots exist while we hold a shared reference to self.
                let slot = unsafe { ptr.as_ref() };
                let generation = slot.generation();
                let value = slot.get(generation)?;

                Some((NodeRef::from_parts(ptr, generation), value))
            })
        })
    }

    /// Iterates over all live nodes with exclusive access, in page and slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeRef<T>, &mut T)> + '_ {
        self.pages.iter().flat_map(|page| {
            (0..Self::PAGE_CAPACITY).filter_map(move |index| {
                let mut ptr = page.slot_ptr(index);

                // SAFETY: We hold an exclusive reference to self for the lifetime of the
                // iterator and every slot is visited exactly once, so the references we hand
                // out never alias each other.
                let slot = unsafe { ptr.as_mut() };
                let generation = slot.generation();
                let value = slot.get_mut(generation)?;

                Some((NodeRef::from_parts(ptr, generation), value))
            })
        })
    }

    /// Converts a type-erased handle into a handle for this container, verifying that it points
    /// into one of our pages, that the page stores `T` and that the node is still alive.
    pub(crate) fn typed(&self, node: UntypedNodeRef) -> Result<NodeRef<T>> {
        let address = node.slot().ok_or(Error::NullHandle)?;

        let header = self.page_header(address).ok_or(Error::ForeignHandle {
            type_name: type_name::<T>(),
        })?;

        let type_tag = header.type_tag();
        if !type_tag.is::<T>() {
            return Err(Error::TypeMismatch {
                expected: type_name::<T>(),
                actual: type_tag.type_name(),
            });
        }

        let typed = node.cast::<T>();

        // Reuses the regular generation check of typed handles.
        let slot = self.owned_slot(typed).ok_or(Error::ForeignHandle {
            type_name: type_name::<T>(),
        })?;

        // SAFETY: The slot is in one of our pages, which live as long as we do.
        let live_generation = unsafe { slot.as_ref() }.generation();

        if live_generation != typed.generation() {
            return Err(Error::StaleHandle {
                type_name: type_name::<T>(),
                handle_generation: typed.generation(),
                live_generation,
            });
        }

        Ok(typed)
    }

    /// Returns the header of the page that contains `address`, if that page is one of ours.
    pub(crate) fn page_header(&self, address: NonNull<u8>) -> Option<&PageHeader> {
        if !self
            .page_directory
            .contains_key(&page_start(address.addr().get()))
        {
            return None;
        }

        // SAFETY: The address is inside one of our pages, which live as long as we do.
        Some(unsafe { PageHeader::from_interior_ptr(address) })
    }

    /// Returns the slot `node` points to if it is inside one of our pages.
    fn owned_slot(&self, node: NodeRef<T>) -> Option<NonNull<Slot<T>>> {
        let slot = node.slot()?;
        let page_index = *self
            .page_directory
            .get(&page_start(slot.addr().get()))?;

        debug_assert!(
            self.pages
                .get(page_index)
                .and_then(|page| page.slot_index(slot))
                .is_some(),
            "handle points into one of our pages but not at a slot boundary"
        );

        Some(slot)
    }

    /// Returns the slot of the live node `node` refers to, or the reason it cannot be used.
    fn checked_slot_mut(&mut self, node: NodeRef<T>) -> Result<&mut Slot<T>> {
        if node.is_null() {
            return Err(Error::NullHandle);
        }

        let mut slot = self.owned_slot(node).ok_or(Error::ForeignHandle {
            type_name: type_name::<T>(),
        })?;

        // SAFETY: The slot is in one of our pages and we hold an exclusive reference to self.
        let slot = unsafe { slot.as_mut() };

        if slot.generation() != node.generation() {
            return Err(Error::StaleHandle {
                type_name: type_name::<T>(),
                handle_generation: node.generation(),
                live_generation: slot.generation(),
            });
        }

        Ok(slot)
    }

    /// Accounts for a node that has just been removed from its slot.
    fn release(&mut self, node: NodeRef<T>) {
        let slot = node
            .slot()
            .expect("only non-null handles can refer to a removed node");

        // Cannot wrap around because we just removed a node, so the length must be at least 1.
        self.length = self.length.wrapping_sub(1);

        if node.generation() == u32::MAX {
            // Cannot overflow: there cannot be more retired slots than slots in memory.
            self.retired = self.retired.wrapping_add(1);

            trace!(
                node_type = type_name::<T>(),
                retired = self.retired,
                "retired node slot with exhausted generation"
            );

            return;
        }

        self.free_list.push(FreeSlot {
            slot,
            generation: node.generation(),
        });
    }

    /// The number of slots that can take a node without allocating a new page.
    fn vacant_count(&self) -> usize {
        // Cannot wrap around: the cursor never moves past the end of the last page.
        let fresh = self.capacity().wrapping_sub(self.fresh_cursor);
        self.free_list.len().wrapping_add(fresh)
    }

    /// Returns the slot the next node goes into, without claiming it.
    ///
    /// Previously used slots are reused first, most recently freed first. After that, slots
    /// that never held a node are handed out in page and slot order, allocating a new page
    /// when none are left.
    fn peek_vacant(&mut self) -> FreeSlot<T> {
        if let Some(free) = self.free_list.last() {
            return FreeSlot {
                slot: free.slot,
                generation: free.generation,
            };
        }

        if self.fresh_cursor == self.capacity() {
            self.add_page();
        }

        let page_index = self
            .fresh_cursor
            .checked_div(Self::PAGE_CAPACITY)
            .expect("page capacity is checked to be non-zero at compile time");
        let slot_index = self
            .fresh_cursor
            .checked_rem(Self::PAGE_CAPACITY)
            .expect("page capacity is checked to be non-zero at compile time");

        let page = self
            .pages
            .get(page_index)
            .expect("the fresh cursor always points into an allocated page");

        FreeSlot {
            slot: page.slot_ptr(slot_index),
            generation: 0,
        }
    }

    /// Claims the slot returned by the preceding `peek_vacant()`.
    fn claim_vacant(&mut self) {
        if self.free_list.pop().is_none() {
            // Cannot overflow: peek_vacant() ensured the cursor is before the end of the pages.
            self.fresh_cursor = self.fresh_cursor.wrapping_add(1);
        }
    }

    /// Allocates a new page. Its slots become available after every slot that is already vacant.
    fn add_page(&mut self) {
        let page = Page::<T>::new();

        // This can never wrap around because the page count is bounded by virtual memory.
        let page_index = self.pages.len();
        let previous = self.page_directory.insert(page.address(), page_index);
        assert!(
            previous.is_none(),
            "a newly allocated page cannot share its address with a live page"
        );

        debug_assert!(page.header().type_tag().is::<T>());

        self.pages.push(page);
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    #[allow(clippy::arithmetic_side_effects, reason = "test-only bookkeeping")]
    pub(crate) fn integrity_check(&self) {
        use std::collections::HashSet;

        let mut live = 0_usize;
        let mut empty = 0_usize;

        for page in &self.pages {
            assert_eq!(
                self.page_directory.get(&page.address()).copied(),
                self.pages
                    .iter()
                    .position(|candidate| candidate.address() == page.address()),
                "page directory out of sync with the page list"
            );

            for index in 0..Self::PAGE_CAPACITY {
                // SAFETY: The page is alive and we hold a shared reference to self.
                let slot = unsafe { page.slot_ptr(index).as_ref() };
                if slot.is_empty() {
                    empty += 1;
                } else {
                    live += 1;
                }
            }
        }

        assert_eq!(live, self.length, "live slot count does not match the length");
        assert_eq!(
            empty,
            self.vacant_count() + self.retired,
            "empty slots must be exactly the free, never used and retired slots"
        );
        assert!(self.fresh_cursor <= self.capacity());

        for index in self.fresh_cursor..self.capacity() {
            let page = &self.pages[index / Self::PAGE_CAPACITY];
            // SAFETY: The page is alive and we hold a shared reference to self.
            let slot = unsafe { page.slot_ptr(index % Self::PAGE_CAPACITY).as_ref() };
            assert!(slot.generation() == 0 && slot.is_empty(), "never used slot is occupied");
        }

        let mut seen = HashSet::new();
        for free in &self.free_list {
            assert!(
                seen.insert(free.slot.addr()),
                "slot appears on the free list more than once"
            );

            // SAFETY: Free list entries point into our pages.
            let slot = unsafe { free.slot.as_ref() };
            assert!(slot.is_empty(), "free list entry points to a live slot");
        }
    }
}

impl<T: 'static> Default for NodeContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for NodeContainer<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContainer")
            .field("type_tag", &TypeTag::of::<T>())
            .field("len", &self.length)
            .field("pages", &self.pages.len())
            .field("vacant", &self.vacant_count())
            .field("retired", &self.retired)
            .field("drop_policy", &self.drop_policy)
            .finish()
    }
}

impl<T: 'static> Drop for NodeContainer<T> {
    fn drop(&mut self) {
        let live = self.length;

        if live != 0 {
            debug!(
                node_type = type_name::<T>(),
                live, "dropping node container that still holds live nodes"
            );
        }

        // Dropping the pages drops every node that is still alive and releases all page memory.
        self.free_list.clear();
        self.page_directory.clear();
        self.pages.clear();

        // We do this check at the end so we clean up the memory first.
        //
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropItems) {
            assert!(
                live == 0,
                "dropped a NodeContainer with {live} live nodes - this is forbidden by DropPolicy::MustNotDropItems"
            );
        }
    }
}

/// Handles a removal that violated the removal contract: fatal in debug builds, ignored otherwise.
#[cfg_attr(test, mutants::skip)] // Behavior depends on the build profile.
pub(crate) fn report_invalid_removal(error: &Error) {
    if cfg!(debug_assertions) {
        panic!("invalid node removal: {error}");
    }

    trace!(%error, "ignoring invalid node removal");
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::page::accounting;

    assert_impl_all!(NodeContainer<u32>: Send, Sync, Default);
    assert_impl_all!(NodeContainer<std::cell::Cell<u32>>: Send);
    assert_not_impl_any!(NodeContainer<std::cell::Cell<u32>>: Sync);
    assert_not_impl_any!(NodeContainer<Rc<u32>>: Send, Sync);

    /// Test helper that counts how many times it has been dropped.
    struct DropCounter {
        drops: Rc<Cell<usize>>,
    }

    impl DropCounter {
        fn new(drops: &Rc<Cell<usize>>) -> Self {
            Self {
                drops: Rc::clone(drops),
            }
        }
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn new_container_allocates_nothing() {
        let container = NodeContainer::<u64>::new();

        assert!(container.is_empty());
        assert_eq!(container.len(), 0);
        assert_eq!(container.capacity(), 0);
        assert_eq!(container.page_count(), 0);
        assert_eq!(container.drop_policy(), DropPolicy::MayDropItems);
    }

    #[test]
    fn add_and_get() {
        let mut container = NodeContainer::new();

        let a = container.add(10_u32);
        let b = container.add(20_u32);

        assert_ne!(a, b);
        assert_eq!(container.get(a), Some(&10));
        assert_eq!(container.get(b), Some(&20));
        assert_eq!(container.len(), 2);
        assert_eq!(container.page_count(), 1);
        assert_eq!(container.capacity(), NodeContainer::<u32>::PAGE_CAPACITY);

        container.integrity_check();
    }

    #[test]
    fn get_mut_modifies_node() {
        let mut container = NodeContainer::new();
        let node = container.add(String::from("abc"));

        container.get_mut(node).unwrap().push('d');

        assert_eq!(container.get(node).map(String::as_str), Some("abcd"));
    }

    #[test]
    fn null_handle_never_resolves() {
        let mut container = NodeContainer::new();
        container.add(1_u8);

        let null = NodeRef::<u8>::null();
        assert_eq!(container.get(null), None);
        assert_eq!(container.get_mut(null), None);
        assert!(!container.contains(null));
        assert_eq!(container.try_remove(null), Err(Error::NullHandle));
        assert_eq!(container.take(null), None);
    }

    #[test]
    fn removed_node_stops_resolving() {
        let drops = Rc::new(Cell::new(0));
        let mut container = NodeContainer::new();

        let node = container.add(DropCounter::new(&drops));
        let copy = node;

        container.remove(node);

        assert_eq!(drops.get(), 1);
        assert!(container.get(node).is_none());
        assert!(container.get(copy).is_none());
        assert!(container.is_empty());

        container.integrity_check();
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let mut container = NodeContainer::new();

        let first = container.add(1_u32);
        container.remove(first);
        let second = container.add(2_u32);

        // Same slot, new generation.
        assert_eq!(first.slot(), second.slot());
        assert!(second.generation() > first.generation());

        assert_eq!(container.get(first), None);
        assert_eq!(container.get(second), Some(&2));
    }

    #[test]
    fn most_recently_freed_slot_is_reused_first() {
        let mut container = NodeContainer::new();

        let a = container.add('a');
        let b = container.add('b');
        let c = container.add('c');

        container.remove(a);
        container.remove(c);

        let d = container.add('d');
        let e = container.add('e');

        assert_eq!(d.slot(), c.slot());
        assert_eq!(e.slot(), a.slot());
        assert_eq!(container.get(b), Some(&'b'));
    }

    #[test]
    fn stale_handle_does_not_remove_new_occupant() {
        let drops = Rc::new(Cell::new(0));
        let mut container = NodeContainer::new();

        let old = container.add(DropCounter::new(&drops));
        container.remove(old);
        let new = container.add(DropCounter::new(&drops));

        assert!(matches!(
            container.try_remove(old),
            Err(Error::StaleHandle {
                handle_generation: 1,
                live_generation: 2,
                ..
            })
        ));

        assert_eq!(drops.get(), 1);
        assert!(container.contains(new));
        assert_eq!(container.len(), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn remove_twice_panics_in_debug() {
        let mut container = NodeContainer::new();
        let node = container.add(5_i64);

        container.remove(node);
        container.remove(node);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn remove_twice_is_ignored_in_release() {
        let mut container = NodeContainer::new();
        let node = container.add(5_i64);

        container.remove(node);
        container.remove(node);

        assert!(container.is_empty());
        container.integrity_check();
    }

    #[test]
    fn handle_from_other_container_is_rejected() {
        let mut first = NodeContainer::new();
        let mut second = NodeContainer::new();

        let in_first = first.add(1_u16);
        second.add(2_u16);

        assert_eq!(second.get(in_first), None);
        assert!(matches!(
            second.try_remove(in_first),
            Err(Error::ForeignHandle { .. })
        ));
        assert_eq!(second.len(), 1);
        assert_eq!(first.get(in_first), Some(&1));
    }

    #[test]
    fn take_returns_value_without_dropping() {
        let drops = Rc::new(Cell::new(0));
        let mut container = NodeContainer::new();

        let node = container.add(DropCounter::new(&drops));
        let value = container.take(node).unwrap();

        assert_eq!(drops.get(), 0);
        assert!(container.get(node).is_none());
        assert!(container.take(node).is_none());

        drop(value);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn add_with_receives_own_handle() {
        struct SelfRef(NodeRef<SelfRef>);

        let mut container = NodeContainer::new();

        let node = container.add_with(SelfRef);

        assert_eq!(container.get(node).map(|n| n.0), Some(node));
    }

    #[test]
    fn panicking_destructor_keeps_bookkeeping_consistent() {
        struct Bomb(bool);

        impl Drop for Bomb {
            fn drop(&mut self) {
                assert!(!self.0, "node destructor failed");
            }
        }

        let mut container = NodeContainer::new();
        let bomb = container.add(Bomb(true));
        let dud = container.add(Bomb(false));

        let result = catch_unwind(AssertUnwindSafe(|| container.remove(bomb)));
        assert!(result.is_err());

        assert_eq!(container.len(), 1);
        assert!(!container.contains(bomb));
        assert!(container.contains(dud));
        container.integrity_check();

        // The slot was released before the destructor ran, so it is reused right away.
        let next = container.add(Bomb(false));
        assert_eq!(next.slot(), bomb.slot());

        container.clear();
        assert!(container.is_empty());
        container.integrity_check();
    }

    #[test]
    fn fresh_slots_follow_the_free_list_across_pages() {
        let mut container = NodeContainer::new();
        let per_page = NodeContainer::<u32>::PAGE_CAPACITY;

        container.reserve(per_page + 1);
        assert_eq!(container.page_count(), 2);

        let first = container.add(0_u32);
        let second = container.add(1_u32);
        container.remove(first);

        // The freed slot goes first, then never used slots continue in order.
        assert_eq!(container.add(2_u32).slot(), first.slot());
        let third = container.add(3_u32);
        // SAFETY: Both handles point into the same page, one slot apart.
        assert_eq!(third.slot(), second.slot().map(|s| unsafe { s.add(1) }));

        for value in 0..u32::try_from(per_page).unwrap() {
            container.add(value);
        }

        assert_eq!(container.page_count(), 2);
        container.integrity_check();
    }

    #[test]
    fn panic_in_add_with_leaves_container_unchanged() {
        let mut container = NodeContainer::new();
        let existing = container.add(1_u32);

        let result = catch_unwind(AssertUnwindSafe(|| {
            container.add_with(|_| panic!("constructor failed"));
        }));
        assert!(result.is_err());

        assert_eq!(container.len(), 1);
        assert_eq!(container.get(existing), Some(&1));
        container.integrity_check();

        // The slot that was about to be used is handed out to the next add.
        let next = container.add(2_u32);
        assert_eq!(container.get(next), Some(&2));
    }

    #[test]
    fn grows_by_whole_pages_and_keeps_addresses_stable() {
        let mut container = NodeContainer::new();
        let per_page = NodeContainer::<u64>::PAGE_CAPACITY;

        let first = container.add(0_u64);
        let first_address = container.get(first).unwrap() as *const u64;

        let nodes = (1..=per_page as u64)
            .map(|i| container.add(i))
            .collect::<Vec<_>>();

        assert_eq!(container.page_count(), 2);
        assert_eq!(container.capacity(), per_page * 2);
        assert_eq!(container.get(first).unwrap() as *const u64, first_address);

        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(container.get(*node), Some(&(i as u64 + 1)));
        }

        container.integrity_check();
    }

    #[test]
    fn reserve_allocates_whole_pages_once() {
        let mut container = NodeContainer::<u32>::new();
        let per_page = NodeContainer::<u32>::PAGE_CAPACITY;

        container.reserve(per_page + 1);
        assert_eq!(container.page_count(), 2);

        container.reserve(per_page);
        assert_eq!(container.page_count(), 2);

        for i in 0..(per_page * 2) as u32 {
            container.add(i);
        }
        assert_eq!(container.page_count(), 2);

        container.integrity_check();
    }

    #[test]
    fn reserved_slots_are_used_after_freed_slots() {
        let mut container = NodeContainer::<u32>::new();

        let a = container.add(1);
        let _b = container.add(2);
        container.remove(a);

        container.reserve(NodeContainer::<u32>::PAGE_CAPACITY * 2);

        let reused = container.add(3);
        assert_eq!(reused.slot(), a.slot());
    }

    #[test]
    fn iter_visits_live_nodes_in_slot_order() {
        let mut container = NodeContainer::new();

        let nodes = (0..5_u32).map(|i| container.add(i)).collect::<Vec<_>>();
        container.remove(nodes[1]);
        container.remove(nodes[3]);

        let seen = container.iter().collect::<Vec<_>>();
        assert_eq!(
            seen,
            vec![(nodes[0], &0), (nodes[2], &2), (nodes[4], &4)]
        );

        for (_, value) in container.iter_mut() {
            *value *= 10;
        }

        assert_eq!(container.get(nodes[4]), Some(&40));
    }

    #[test]
    fn clear_drops_everything_and_keeps_pages() {
        let drops = Rc::new(Cell::new(0));
        let mut container = NodeContainer::new();

        let nodes = (0..10)
            .map(|_| container.add(DropCounter::new(&drops)))
            .collect::<Vec<_>>();

        container.clear();

        assert_eq!(drops.get(), 10);
        assert!(container.is_empty());
        assert_eq!(container.page_count(), 1);
        assert!(nodes.iter().all(|node| !container.contains(*node)));

        container.integrity_check();
    }

    #[test]
    fn exhausted_slot_is_retired() {
        let mut container = NodeContainer::new();

        let node = container.add(1_u8);
        container.remove(node);

        // Fast-forward the slot to the last generation it can hold.
        container.free_list.last_mut().unwrap().generation = u32::MAX - 1;
        let free_before = container.free_list.len();

        let last = container.add(2_u8);
        assert_eq!(last.generation(), u32::MAX);
        assert_eq!(last.slot(), node.slot());

        container.remove(last);

        assert_eq!(container.retired_count(), 1);
        assert_eq!(container.free_list.len(), free_before - 1);
        assert!(container.get(last).is_none());

        // The next node goes to a different slot.
        let next = container.add(3_u8);
        assert_ne!(next.slot(), last.slot());

        container.integrity_check();
    }

    #[test]
    fn typed_checks_ownership_type_and_generation() {
        let mut strings = NodeContainer::new();
        let mut numbers = NodeContainer::new();

        let text = strings.add(String::from("x"));
        let number = numbers.add(7_u32);

        assert_eq!(strings.typed(text.erase()), Ok(text));
        assert_eq!(strings.typed(UntypedNodeRef::null()), Err(Error::NullHandle));
        assert!(matches!(
            strings.typed(number.erase()),
            Err(Error::ForeignHandle { .. })
        ));

        strings.remove(text);
        assert!(matches!(
            strings.typed(text.erase()),
            Err(Error::StaleHandle { .. })
        ));
    }

    #[test]
    fn drop_sweeps_live_nodes_and_releases_pages() {
        let drops = Rc::new(Cell::new(0));
        let (allocated_before, released_before) = accounting::counts();

        {
            let mut container = NodeContainer::new();
            let per_page = NodeContainer::<DropCounter>::PAGE_CAPACITY;

            for _ in 0..per_page + 3 {
                container.add(DropCounter::new(&drops));
            }

            let removed = container.add(DropCounter::new(&drops));
            container.remove(removed);
            assert_eq!(drops.get(), 1);
        }

        let per_page = NodeContainer::<DropCounter>::PAGE_CAPACITY;
        assert_eq!(drops.get(), per_page + 4);

        let (allocated_after, released_after) = accounting::counts();
        assert_eq!(allocated_after - allocated_before, 2);
        assert_eq!(released_after - released_before, 2);
    }

    #[test]
    fn dropping_emptied_container_releases_every_page() {
        let (allocated_before, released_before) = accounting::counts();

        {
            let mut container = NodeContainer::new();
            let nodes = (0..NodeContainer::<u64>::PAGE_CAPACITY * 3)
                .map(|i| container.add(i as u64))
                .collect::<Vec<_>>();

            for node in nodes {
                container.remove(node);
            }

            assert!(container.is_empty());
            assert_eq!(container.page_count(), 3);
        }

        let (allocated_after, released_after) = accounting::counts();
        assert_eq!(allocated_after - allocated_before, 3);
        assert_eq!(released_after - released_before, 3);
    }

    #[test]
    #[should_panic]
    fn must_not_drop_items_panics_when_dropped_with_live_nodes() {
        let mut container = NodeContainer::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        container.add(1_u32);
    }

    #[test]
    fn must_not_drop_items_still_releases_nodes_before_panicking() {
        let drops = Rc::new(Cell::new(0));

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut container = NodeContainer::builder()
                .drop_policy(DropPolicy::MustNotDropItems)
                .build();

            container.add(DropCounter::new(&drops));
        }));

        assert!(result.is_err());
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn must_not_drop_items_is_fine_when_empty() {
        let mut container = NodeContainer::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        let node = container.add(1_u32);
        container.remove(node);
    }

    #[test]
    fn refill_after_removing_first_half() {
        #[derive(Debug, PartialEq)]
        struct Pod16 {
            a: u64,
            b: u64,
        }

        let mut container = NodeContainer::new();
        let n = NodeContainer::<Pod16>::PAGE_CAPACITY;

        let first = (0..=n as u64)
            .map(|i| container.add(Pod16 { a: i, b: !i }))
            .collect::<Vec<_>>();

        assert_eq!(container.page_count(), 2);
        assert_eq!(first.iter().collect::<HashSet<_>>().len(), n + 1);
        for (i, node) in first.iter().enumerate() {
            let i = i as u64;
            assert_eq!(container.get(*node), Some(&Pod16 { a: i, b: !i }));
        }

        for node in &first[..n / 2] {
            container.remove(*node);
        }

        let second = (0..(n / 2) as u64)
            .map(|i| container.add(Pod16 { a: i, b: i }))
            .collect::<Vec<_>>();

        assert!(first[..n / 2].iter().all(|node| container.get(*node).is_none()));
        for (i, node) in second.iter().enumerate() {
            let i = i as u64;
            assert!(!node.is_null());
            assert_eq!(container.get(*node), Some(&Pod16 { a: i, b: i }));
        }

        let surviving = first.iter().filter(|node| container.contains(**node)).count();
        assert_eq!(surviving, n + 1 - n / 2);
        assert_eq!(container.len(), n + 1);

        // Refilling reused the freed slots, so no third page was needed.
        assert_eq!(container.page_count(), 2);
        container.integrity_check();
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        #[derive(Clone, Debug)]
        enum Op {
            Add(u32),
            Remove(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => any::<u32>().prop_map(Op::Add),
                2 => any::<usize>().prop_map(Op::Remove),
            ]
        }

        proptest! {
            #[test]
            fn live_handles_are_unique_and_stale_handles_never_resolve(
                ops in proptest::collection::vec(op(), 1..400),
            ) {
                let mut container = NodeContainer::new();
                let mut live: Vec<(NodeRef<u32>, u32)> = Vec::new();
                let mut dead: Vec<NodeRef<u32>> = Vec::new();

                for op in ops {
                    match op {
                        Op::Add(value) => {
                            let node = container.add(value);
                            prop_assert!(live.iter().all(|(other, _)| *other != node));
                            prop_assert!(!dead.contains(&node));
                            live.push((node, value));
                        }
                        Op::Remove(index) => {
                            if live.is_empty() {
                                continue;
                            }
                            let (node, _) = live.swap_remove(index % live.len());
                            container.remove(node);
                            dead.push(node);
                        }
                    }

                    prop_assert_eq!(container.len(), live.len());
                }

                for (node, value) in &live {
                    prop_assert_eq!(container.get(*node), Some(value));
                }

                for node in &dead {
                    prop_assert!(container.get(*node).is_none());
                    prop_assert!(container.try_remove(*node).is_err());
                }

                let distinct = live.iter().map(|(node, _)| *node).collect::<HashSet<_>>();
                prop_assert_eq!(distinct.len(), live.len());

                container.integrity_check();
            }
        }
    }
}
