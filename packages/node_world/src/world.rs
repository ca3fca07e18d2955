use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::ptr::NonNull;

use foldhash::{HashMap, HashMapExt};
use tracing::debug;

use crate::container::report_invalid_removal;
use crate::{
    DropPolicy, Error, NodeContainer, NodeRef, Result, TypeTag, UntypedNodeRef, WorldBuilder,
};

/// The operations a [`World`] needs from a container without knowing its node type.
pub(crate) trait ErasedContainer: Any + Send {
    fn type_tag(&self) -> TypeTag;

    fn len(&self) -> usize;

    /// Returns the type tag of the page that contains `address`, if the page belongs to this
    /// container.
    fn type_tag_at(&self, address: NonNull<u8>) -> Option<TypeTag>;

    fn try_remove_untyped(&mut self, node: UntypedNodeRef) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Send + 'static> ErasedContainer for NodeContainer<T> {
    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn len(&self) -> usize {
        Self::len(self)
    }

    fn type_tag_at(&self, address: NonNull<u8>) -> Option<TypeTag> {
        self.page_header(address).map(|header| header.type_tag())
    }

    fn try_remove_untyped(&mut self, node: UntypedNodeRef) -> Result<()> {
        let node = self.typed(node)?;
        self.try_remove(node)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A heterogeneous node store holding one [`NodeContainer`] per node type.
///
/// The container for a type is created the first time a node of that type is added. Each world
/// keeps its own registry of types, so separate worlds never share containers or handles: a
/// handle issued by one world does not resolve in another.
///
/// # Examples
///
/// ```
/// use node_world::World;
///
/// struct Mesh {
///     vertices: usize,
/// }
///
/// struct Material {
///     name: String,
/// }
///
/// let mut world = World::new();
///
/// let mesh = world.add(Mesh { vertices: 3 });
/// let material = world.add(Material {
///     name: "steel".to_string(),
/// });
///
/// assert_eq!(world.get(mesh).map(|m| m.vertices), Some(3));
/// assert_eq!(world.get(material).map(|m| m.name.as_str()), Some("steel"));
/// assert_eq!(world.len(), 2);
///
/// world.remove(mesh);
/// assert!(world.get(mesh).is_none());
/// ```
///
/// # Thread safety
///
/// All node types must be [`Send`], which makes the world [`Send`]. The world is not [`Sync`]
/// and has no internal synchronization; share it between threads behind a lock if needed.
pub struct World {
    /// Index into `containers` for each node type that has been used with this world.
    type_indices: HashMap<TypeId, usize>,

    containers: Vec<Box<dyn ErasedContainer>>,

    drop_policy: DropPolicy,
}

impl World {
    /// Creates an empty world with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring and constructing a [`World`].
    #[inline]
    pub fn builder() -> WorldBuilder {
        WorldBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(drop_policy: DropPolicy) -> Self {
        Self {
            type_indices: HashMap::new(),
            containers: Vec::new(),
            drop_policy,
        }
    }

    /// The [drop policy][DropPolicy] applied to every container of this world.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// Adds a node, creating the container for `T` if this is the first node of that type.
    pub fn add<T: Send + 'static>(&mut self, value: T) -> NodeRef<T> {
        self.container_or_insert::<T>().add(value)
    }

    /// Adds a node built by `f`, which receives the handle the node will be stored under.
    ///
    /// See [`NodeContainer::add_with()`].
    pub fn add_with<T: Send + 'static>(&mut self, f: impl FnOnce(NodeRef<T>) -> T) -> NodeRef<T> {
        self.container_or_insert::<T>().add_with(f)
    }

    /// Returns a reference to the node `node` refers to, if it is alive in this world.
    #[must_use]
    pub fn get<T: Send + 'static>(&self, node: NodeRef<T>) -> Option<&T> {
        self.container::<T>()?.get(node)
    }

    /// Returns an exclusive reference to the node `node` refers to, if it is alive in this world.
    #[must_use]
    pub fn get_mut<T: Send + 'static>(&mut self, node: NodeRef<T>) -> Option<&mut T> {
        self.container_mut::<T>()?.get_mut(node)
    }

    /// Returns `true` if `node` refers to a live node of this world.
    #[must_use]
    pub fn contains<T: Send + 'static>(&self, node: NodeRef<T>) -> bool {
        self.get(node).is_some()
    }

    /// Removes and drops the node `node` refers to.
    ///
    /// Never creates a container: removing a node of a type this world has never stored is an
    /// invalid removal like any other foreign handle.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the handle is null, foreign or stale. Release builds ignore
    /// such calls.
    pub fn remove<T: Send + 'static>(&mut self, node: NodeRef<T>) {
        if let Err(error) = self.try_remove(node) {
            report_invalid_removal(&error);
        }
    }

    /// Removes and drops the node `node` refers to, or explains why that is not possible.
    pub fn try_remove<T: Send + 'static>(&mut self, node: NodeRef<T>) -> Result<()> {
        if node.is_null() {
            return Err(Error::NullHandle);
        }

        self.container_mut::<T>()
            .ok_or(Error::ForeignHandle {
                type_name: type_name::<T>(),
            })?
            .try_remove(node)
    }

    /// Removes the node `node` refers to and returns it instead of dropping it.
    #[must_use]
    pub fn take<T: Send + 'static>(&mut self, node: NodeRef<T>) -> Option<T> {
        self.container_mut::<T>()?.take(node)
    }

    /// Removes and drops the node a type-erased handle refers to, whatever its type.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the handle is null, foreign or stale. Release builds ignore
    /// such calls.
    pub fn remove_untyped(&mut self, node: UntypedNodeRef) {
        if let Err(error) = self.try_remove_untyped(node) {
            report_invalid_removal(&error);
        }
    }

    /// Removes and drops the node a type-erased handle refers to, or explains why that is not
    /// possible.
    ///
    /// # Example
    ///
    /// ```
    /// use node_world::{UntypedNodeRef, World};
    ///
    /// let mut world = World::new();
    ///
    /// let handles: Vec<UntypedNodeRef> = vec![world.add(1_u8).into(), world.add('x').into()];
    ///
    /// for handle in handles {
    ///     world.try_remove_untyped(handle).unwrap();
    /// }
    ///
    /// assert!(world.is_empty());
    /// ```
    pub fn try_remove_untyped(&mut self, node: UntypedNodeRef) -> Result<()> {
        if node.is_null() {
            return Err(Error::NullHandle);
        }

        let type_tag = self.type_of(node).ok_or(Error::ForeignHandle {
            type_name: "unknown",
        })?;

        let index = *self
            .type_indices
            .get(&type_tag.type_id())
            .expect("every container that owns a page is registered under its type");

        self.containers
            .get_mut(index)
            .expect("type indices only ever point at containers that exist")
            .try_remove_untyped(node)
    }

    /// Returns the type of the node a type-erased handle points to, if the handle points into a
    /// page of this world.
    ///
    /// This only identifies the page, it does not check whether the node is still alive.
    #[must_use]
    pub fn type_of(&self, node: UntypedNodeRef) -> Option<TypeTag> {
        let address = node.slot()?;

        self.containers
            .iter()
            .find_map(|container| container.type_tag_at(address))
    }

    /// Returns `true` if a type-erased handle points into a page of this world that stores `T`.
    #[must_use]
    pub fn is<T: Send + 'static>(&self, node: UntypedNodeRef) -> bool {
        self.type_of(node).is_some_and(|tag| tag.is::<T>())
    }

    /// Converts a type-erased handle into a handle to `T`, verifying the type and that the node
    /// is still alive.
    pub fn try_to_typed<T: Send + 'static>(&self, node: UntypedNodeRef) -> Result<NodeRef<T>> {
        if node.is_null() {
            return Err(Error::NullHandle);
        }

        let foreign = Error::ForeignHandle {
            type_name: type_name::<T>(),
        };

        let actual = self.type_of(node).ok_or_else(|| foreign.clone())?;
        if !actual.is::<T>() {
            return Err(Error::TypeMismatch {
                expected: type_name::<T>(),
                actual: actual.type_name(),
            });
        }

        self.container::<T>().ok_or(foreign)?.typed(node)
    }

    /// Returns the container for `T`, if this world has created one.
    #[must_use]
    pub fn container<T: Send + 'static>(&self) -> Option<&NodeContainer<T>> {
        let index = *self.type_indices.get(&TypeId::of::<T>())?;

        let container = self
            .containers
            .get(index)
            .expect("type indices only ever point at containers that exist");

        Some(
            container
                .as_any()
                .downcast_ref()
                .expect("type indices only ever point at containers of that type"),
        )
    }

    /// Returns the container for `T` with exclusive access, if this world has created one.
    #[must_use]
    pub fn container_mut<T: Send + 'static>(&mut self) -> Option<&mut NodeContainer<T>> {
        let index = *self.type_indices.get(&TypeId::of::<T>())?;

        let container = self
            .containers
            .get_mut(index)
            .expect("type indices only ever point at containers that exist");

        Some(
            container
                .as_any_mut()
                .downcast_mut()
                .expect("type indices only ever point at containers of that type"),
        )
    }

    /// The total number of live nodes of all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.iter().map(|container| container.len()).sum()
    }

    /// Whether the world has no live nodes of any type.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.iter().all(|container| container.len() == 0)
    }

    /// The number of node types this world has created containers for.
    #[must_use]
    #[inline]
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    fn container_or_insert<T: Send + 'static>(&mut self) -> &mut NodeContainer<T> {
        let index = match self.type_indices.get(&TypeId::of::<T>()) {
            Some(index) => *index,
            None => {
                let index = self.containers.len();

                self.containers
                    .push(Box::new(NodeContainer::<T>::new_inner(self.drop_policy)));
                self.type_indices.insert(TypeId::of::<T>(), index);

                debug!(
                    node_type = type_name::<T>(),
                    index, "created node container in world"
                );

                index
            }
        };

        self.containers
            .get_mut(index)
            .expect("type indices only ever point at containers that exist")
            .as_any_mut()
            .downcast_mut()
            .expect("type indices only ever point at containers of that type")
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for World {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for container in &self.containers {
            list.entry(&format_args!(
                "{}: {} nodes",
                container.type_tag(),
                container.len()
            ));
        }

        list.finish()
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
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(World: Send, Default);
    assert_not_impl_any!(World: Sync);

    /// Counts drops through an atomic so it can live in a world, which requires `Send`.
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn containers_are_created_on_first_use() {
        let mut world = World::new();
        assert_eq!(world.container_count(), 0);
        assert!(world.container::<u32>().is_none());

        world.add(1_u32);
        world.add(2_u32);
        world.add("text");

        assert_eq!(world.container_count(), 2);
        assert_eq!(world.container::<u32>().map(NodeContainer::len), Some(2));
        assert_eq!(world.container::<&str>().map(NodeContainer::len), Some(1));
        assert_eq!(world.len(), 3);
    }

    #[test]
    fn get_and_get_mut_route_by_type() {
        let mut world = World::new();

        let number = world.add(5_i32);
        let text = world.add(String::from("a"));

        *world.get_mut(number).unwrap() += 1;
        world.get_mut(text).unwrap().push('b');

        assert_eq!(world.get(number), Some(&6));
        assert_eq!(world.get(text).map(String::as_str), Some("ab"));
        assert!(world.contains(number));
    }

    #[test]
    fn lookup_of_unknown_type_does_not_create_container() {
        let world = World::new();

        assert_eq!(world.get(NodeRef::<u64>::null()), None);
        assert_eq!(world.container_count(), 0);
    }

    #[test]
    fn remove_of_unknown_type_does_not_create_container() {
        let mut world = World::new();
        let mut other = World::new();

        let node = other.add(1_u64);

        assert!(matches!(
            world.try_remove(node),
            Err(Error::ForeignHandle { .. })
        ));
        assert_eq!(world.container_count(), 0);
        assert_eq!(world.try_remove(NodeRef::<u64>::null()), Err(Error::NullHandle));
    }

    #[test]
    fn handles_do_not_resolve_in_other_worlds() {
        let mut first = World::new();
        let mut second = World::new();

        let a = first.add(1_u32);
        let b = second.add(2_u32);

        assert_eq!(second.get(a), None);
        assert_eq!(first.get(b), None);
        assert!(second.type_of(a.erase()).is_none());
    }

    #[test]
    fn remove_and_take() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut world = World::new();

        let removed = world.add(DropCounter(Arc::clone(&drops)));
        let taken = world.add(DropCounter(Arc::clone(&drops)));

        world.remove(removed);
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        let value = world.take(taken).unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(world.is_empty());

        drop(value);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn untyped_handles_recover_their_type() {
        let mut world = World::new();

        let number = world.add(7_u32).erase();
        let text = world.add(String::from("seven")).erase();

        assert_eq!(world.type_of(number), Some(TypeTag::of::<u32>()));
        assert_eq!(world.type_of(text), Some(TypeTag::of::<String>()));
        assert!(world.is::<u32>(number));
        assert!(!world.is::<String>(number));

        let typed = world.try_to_typed::<String>(text).unwrap();
        assert_eq!(world.get(typed).map(String::as_str), Some("seven"));
    }

    #[test]
    fn untyped_handle_to_wrong_type_is_null() {
        let mut world = World::new();

        let number = world.add(7_u32).erase();
        world.add(1.5_f64);

        assert!(matches!(
            world.try_to_typed::<f64>(number),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(number.to_typed::<f64>(&world).is_null());

        // No container for the requested type at all.
        assert!(number.to_typed::<i8>(&world).is_null());
        assert_eq!(world.container_count(), 2);
    }

    #[test]
    fn untyped_handle_to_removed_node_is_null() {
        let mut world = World::new();

        let node = world.add('q');
        let untyped = node.erase();
        world.remove(node);

        assert!(untyped.is::<char>(&world));
        assert!(matches!(
            world.try_to_typed::<char>(untyped),
            Err(Error::StaleHandle { .. })
        ));
        assert!(untyped.to_typed::<char>(&world).is_null());
    }

    #[test]
    fn remove_untyped_routes_to_owning_container() {
        let mut world = World::new();

        let a = world.add(1_u8);
        let b = world.add(2_u16);

        world.remove_untyped(b.erase());

        assert!(world.contains(a));
        assert!(!world.contains(b));
        assert!(matches!(
            world.try_remove_untyped(b.erase()),
            Err(Error::StaleHandle { .. })
        ));
        assert_eq!(
            world.try_remove_untyped(UntypedNodeRef::null()),
            Err(Error::NullHandle)
        );
    }

    #[test]
    fn nodes_can_refer_to_each_other() {
        struct Link {
            value: u32,
            next: NodeRef<Link>,
        }

        let mut world = World::new();

        let tail = world.add(Link {
            value: 2,
            next: NodeRef::null(),
        });
        let head = world.add(Link { value: 1, next: tail });

        let mut values = Vec::new();
        let mut cursor = head;
        while let Some(link) = cursor.get(&world) {
            values.push(link.value);
            cursor = link.next;
        }

        assert_eq!(values, vec![1, 2]);

        world.remove(tail);
        assert!(world.get(head).unwrap().next.get(&world).is_none());
    }

    #[test]
    fn dropping_world_drops_all_nodes() {
        let drops = Arc::new(AtomicUsize::new(0));

        {
            let mut world = World::new();
            for _ in 0..3 {
                world.add(DropCounter(Arc::clone(&drops)));
            }
            world.add(5_u8);
        }

        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[should_panic]
    fn must_not_drop_items_applies_to_world_containers() {
        let mut world = World::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        world.add(1_u32);
    }

    #[test]
    fn world_can_move_between_threads() {
        let mut world = World::new();
        let node = world.add(String::from("moved"));

        let world = std::thread::spawn(move || {
            assert_eq!(world.get(node).map(String::as_str), Some("moved"));
            world
        })
        .join()
        .unwrap();

        assert!(world.contains(node));
    }

    #[test]
    fn world_node_types_need_not_be_sync() {
        let mut world = World::new();
        let node = world.add(Cell::new(1));

        world.get(node).unwrap().set(2);

        assert_eq!(world.get(node).map(Cell::get), Some(2));
    }
}
