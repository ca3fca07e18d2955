use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crate::{DropPolicy, NodeContainer, World};

/// Builder for creating an instance of [`NodeContainer`].
///
/// All settings are optional. Page geometry is fixed per node type and is not configurable.
///
/// # Examples
///
/// ```
/// use node_world::{DropPolicy, NodeContainer};
///
/// let container = NodeContainer::<String>::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[must_use]
pub struct NodeContainerBuilder<T: 'static> {
    drop_policy: DropPolicy,

    _node: PhantomData<fn() -> T>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: 'static> NodeContainerBuilder<T> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            drop_policy: DropPolicy::default(),
            _node: PhantomData,
            _not_sync: PhantomData,
        }
    }

    /// Sets the [drop policy][DropPolicy] for the container. This governs how
    /// to treat remaining nodes in the container when the container is dropped.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the container with the specified configuration.
    #[must_use]
    #[inline]
    pub fn build(self) -> NodeContainer<T> {
        NodeContainer::new_inner(self.drop_policy)
    }
}

impl<T: 'static> fmt::Debug for NodeContainerBuilder<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContainerBuilder")
            .field("node_type", &std::any::type_name::<T>())
            .field("drop_policy", &self.drop_policy)
            .finish()
    }
}

/// Builder for creating an instance of [`World`].
///
/// The drop policy set here applies to every container the world creates.
///
/// # Examples
///
/// ```
/// use node_world::{DropPolicy, World};
///
/// let mut world = World::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
///
/// let node = world.add(1_u8);
/// world.remove(node);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct WorldBuilder {
    drop_policy: DropPolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl WorldBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the [drop policy][DropPolicy] for every container of the world.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the world with the specified configuration.
    #[must_use]
    #[inline]
    pub fn build(self) -> World {
        World::new_inner(self.drop_policy)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(NodeContainerBuilder<u32>: Send);
    assert_not_impl_any!(NodeContainerBuilder<u32>: Sync);
    assert_impl_all!(WorldBuilder: Send);
    assert_not_impl_any!(WorldBuilder: Sync);

    #[test]
    fn container_builder_defaults() {
        let container = NodeContainerBuilder::<u32>::new().build();

        assert_eq!(container.drop_policy(), DropPolicy::MayDropItems);
        assert!(container.is_empty());
    }

    #[test]
    fn container_builder_sets_drop_policy() {
        let container = NodeContainer::<u32>::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        assert_eq!(container.drop_policy(), DropPolicy::MustNotDropItems);
    }

    #[test]
    fn world_builder_sets_drop_policy() {
        let world = World::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        assert_eq!(world.drop_policy(), DropPolicy::MustNotDropItems);
        assert_eq!(World::new().drop_policy(), DropPolicy::MayDropItems);
    }
}
