/// Determines what happens to live nodes when their container is dropped.
///
/// Either way, every live node is dropped and all page memory is released. The policy only
/// decides whether finding live nodes at that point is acceptable.
///
/// # Examples
///
/// ```
/// use node_world::{DropPolicy, NodeContainer};
///
/// let mut container = NodeContainer::<u32>::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
///
/// let node = container.add(7);
/// container.remove(node);
///
/// // The container is empty, so dropping it is permitted.
/// drop(container);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Live nodes are dropped together with the container. This is the default.
    #[default]
    MayDropItems,

    /// The container panics on drop if it still holds live nodes.
    ///
    /// Use this when the owner is expected to remove every node explicitly, for example because
    /// node destruction must happen at a well-defined point of the host application's lifecycle.
    MustNotDropItems,
}
