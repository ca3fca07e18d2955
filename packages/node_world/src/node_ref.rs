use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use crate::{Slot, TypeTag, World};

/// A weak, generation-checked handle to a node of type `T`.
///
/// A handle is the address of the slot the node was stored in plus the generation the slot was
/// stamped with at that time. It never owns the node and never keeps it alive: copying or
/// dropping a handle has no effect on the store.
///
/// Resolving a handle always goes through the store that issued it (see [`NodeRef::get()`],
/// [`World::get()`] and [`NodeContainer::get()`][crate::NodeContainer::get]). Resolution yields
/// `None` once the node has been removed, even if its slot has since been reused for a newer
/// node, and also for the null handle and for handles that belong to a different store.
///
/// Handles are only meaningful within the process that created them and must not be persisted.
///
/// # Examples
///
/// ```
/// use node_world::{NodeRef, World};
///
/// let mut world = World::new();
///
/// let node = world.add(42_u32);
/// assert_eq!(node.get(&world), Some(&42));
///
/// world.remove(node);
/// assert_eq!(node.get(&world), None);
///
/// // The default handle is null and never resolves.
/// let null = NodeRef::<u32>::default();
/// assert!(null.is_null());
/// assert_eq!(null.get(&world), None);
/// ```
pub struct NodeRef<T> {
    slot: Option<NonNull<Slot<T>>>,
    generation: u32,
}

impl<T> NodeRef<T> {
    /// Returns the null handle, which never resolves to a node.
    #[must_use]
    #[inline]
    pub const fn null() -> Self {
        Self {
            slot: None,
            generation: 0,
        }
    }

    #[must_use]
    #[inline]
    pub(crate) fn from_parts(slot: NonNull<Slot<T>>, generation: u32) -> Self {
        debug_assert!(generation != 0, "a non-null handle must have a non-zero generation");

        Self {
            slot: Some(slot),
            generation,
        }
    }

    /// Returns `true` if this is the null handle.
    #[must_use]
    #[inline]
    pub fn is_null(&self) -> bool {
        debug_assert_eq!(
            self.slot.is_none(),
            self.generation == 0,
            "a handle is null if and only if its generation is zero"
        );

        self.slot.is_none()
    }

    /// The generation of the node this handle was issued for. Zero for the null handle.
    #[must_use]
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    #[inline]
    pub(crate) fn slot(&self) -> Option<NonNull<Slot<T>>> {
        self.slot
    }

    /// Converts the handle into a type-erased handle.
    #[must_use]
    #[inline]
    pub fn erase(self) -> UntypedNodeRef {
        UntypedNodeRef {
            slot: self.slot.map(NonNull::cast),
            generation: self.generation,
        }
    }
}

impl<T: Send + 'static> NodeRef<T> {
    /// Resolves the handle to the node it refers to, if that node is still alive in `world`.
    ///
    /// This is always safe to call, whatever the state of the handle.
    #[must_use]
    #[inline]
    pub fn get<'w>(&self, world: &'w World) -> Option<&'w T> {
        world.get(*self)
    }

    /// Resolves the handle to an exclusive reference to the node it refers to, if that node is
    /// still alive in `world`.
    #[must_use]
    #[inline]
    pub fn get_mut<'w>(&self, world: &'w mut World) -> Option<&'w mut T> {
        world.get_mut(*self)
    }
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<T> {}

impl<T> Default for NodeRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for NodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for NodeRef<T> {}

impl<T> Hash for NodeRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for NodeRef<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

// SAFETY: A handle is an inert address plus a number. It grants no access to the node by itself;
// every access goes through the owning store, which enforces the thread safety rules of `T`.
unsafe impl<T> Send for NodeRef<T> {}

// SAFETY: See `Send` above.
unsafe impl<T> Sync for NodeRef<T> {}

impl<T> From<NodeRef<T>> for UntypedNodeRef {
    #[inline]
    fn from(value: NodeRef<T>) -> Self {
        value.erase()
    }
}

/// A [`NodeRef`] with its element type erased.
///
/// Useful for heterogeneous collections of handles. The element type can be recovered with a
/// checked downcast, which compares the type tag in the header of the page that holds the slot
/// and then performs the usual generation check.
///
/// # Examples
///
/// ```
/// use node_world::{UntypedNodeRef, World};
///
/// let mut world = World::new();
///
/// let handles: Vec<UntypedNodeRef> = vec![
///     world.add(1_u32).into(),
///     world.add("two".to_string()).into(),
/// ];
///
/// assert!(handles[0].is::<u32>(&world));
/// assert!(!handles[0].is::<String>(&world));
///
/// let text = handles[1].to_typed::<String>(&world);
/// assert_eq!(world.get(text).map(String::as_str), Some("two"));
///
/// // Downcasting to the wrong type produces a null handle.
/// assert!(handles[1].to_typed::<u32>(&world).is_null());
/// ```
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct UntypedNodeRef {
    slot: Option<NonNull<u8>>,
    generation: u32,
}

impl UntypedNodeRef {
    /// Returns the null handle, which never resolves to a node.
    #[must_use]
    #[inline]
    pub const fn null() -> Self {
        Self {
            slot: None,
            generation: 0,
        }
    }

    /// Returns `true` if this is the null handle.
    #[must_use]
    #[inline]
    pub fn is_null(&self) -> bool {
        debug_assert_eq!(
            self.slot.is_none(),
            self.generation == 0,
            "a handle is null if and only if its generation is zero"
        );

        self.slot.is_none()
    }

    /// The generation of the node this handle was issued for. Zero for the null handle.
    #[must_use]
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    #[inline]
    pub(crate) fn slot(&self) -> Option<NonNull<u8>> {
        self.slot
    }

    /// Returns `true` if the handle points into a page of `world` that stores nodes of type `T`.
    ///
    /// This only checks the type, not whether the node is still alive.
    #[must_use]
    #[inline]
    pub fn is<T: Send + 'static>(&self, world: &World) -> bool {
        world.is::<T>(*self)
    }

    /// Returns the element type of the page the handle points into, if that page belongs to
    /// `world`.
    #[must_use]
    #[inline]
    pub fn type_tag(&self, world: &World) -> Option<TypeTag> {
        world.type_of(*self)
    }

    /// Converts the handle back into a typed handle.
    ///
    /// Returns the null handle if the handle does not refer to a live node of type `T` in `world`,
    /// whether because the type differs or because the node has been removed.
    #[must_use]
    #[inline]
    pub fn to_typed<T: Send + 'static>(&self, world: &World) -> NodeRef<T> {
        world.try_to_typed(*self).unwrap_or_default()
    }

    /// Reinterprets the handle as a handle to `T` without any checks.
    ///
    /// This is not unsafe in itself, because typed handles are validated again on every access,
    /// but the result is only meaningful after the caller has verified the type.
    #[must_use]
    pub(crate) fn cast<T>(self) -> NodeRef<T> {
        NodeRef {
            slot: self.slot.map(NonNull::cast),
            generation: self.generation,
        }
    }
}

impl fmt::Debug for UntypedNodeRef {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UntypedNodeRef")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

// SAFETY: See `NodeRef`. The untyped handle carries even less meaning on its own.
unsafe impl Send for UntypedNodeRef {}

// SAFETY: See `Send` above.
unsafe impl Sync for UntypedNodeRef {}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(NodeRef<u32>: Send, Sync, Copy, Clone, Eq, Default);
    assert_impl_all!(NodeRef<Rc<u32>>: Send, Sync, Copy);
    assert_impl_all!(NodeRef<RefCell<u32>>: Send, Sync, Copy);
    assert_impl_all!(UntypedNodeRef: Send, Sync, Copy, Clone, Eq, Default);

    #[test]
    fn default_handles_are_null() {
        let typed = NodeRef::<String>::default();
        assert!(typed.is_null());
        assert_eq!(typed.generation(), 0);
        assert_eq!(typed, NodeRef::null());

        let untyped = UntypedNodeRef::default();
        assert!(untyped.is_null());
        assert_eq!(untyped.generation(), 0);
        assert_eq!(untyped, typed.erase());
    }

    #[test]
    fn erase_preserves_address_and_generation() {
        let mut slot = Slot::<u64>::empty();
        let node = NodeRef::from_parts(NonNull::from(&mut slot), 9);

        let untyped: UntypedNodeRef = node.into();
        assert!(!untyped.is_null());
        assert_eq!(untyped.generation(), 9);
        assert_eq!(untyped.cast::<u64>(), node);
    }

    #[test]
    fn handles_compare_by_address_and_generation() {
        let mut slots = [Slot::<u8>::empty(), Slot::<u8>::empty()];
        let [first, second] = &mut slots;

        let a1 = NodeRef::from_parts(NonNull::from(first), 1);
        let a2 = NodeRef::from_parts(a1.slot().unwrap(), 2);
        let b1 = NodeRef::from_parts(NonNull::from(second), 1);

        assert_ne!(a1, a2);
        assert_ne!(a1, b1);
        let copy = a1;
        assert_eq!(a1, copy);

        let set: HashSet<_> = [a1, a2, b1, a1].into_iter().collect();
        assert_eq!(set.len(), 3);
    }
}
