//! A paged, generational object store with stable addresses and validity-checked handles.
//!
//! This crate provides [`NodeContainer<T>`], a growable store of nodes of one type, and
//! [`World`], which keeps one container per node type and creates them on first use. Adding a
//! node returns a [`NodeRef<T>`]: a small, copyable handle that can be stored anywhere, including
//! inside other nodes, and that stops resolving as soon as the node is removed.
//!
//! # Key Features
//!
//! - **Stable memory addresses**: Nodes never move once added
//! - **Generation-checked handles**: A handle to a removed node never resolves, even after its
//!   slot has been reused for a newer node
//! - **Paged storage**: Nodes live in fixed-size, aligned pages that are allocated on demand
//!   and released only when the container is dropped
//! - **Type-erased handles**: [`UntypedNodeRef`] can be stored in heterogeneous collections and
//!   downcast back with a runtime type check
//! - **Safe resolution**: Every lookup goes through the store that issued the handle, so null,
//!   stale or foreign handles simply resolve to `None`
//! - **Flexible drop policies**: Configure behavior when a store is dropped with nodes remaining
//!
//! # Examples
//!
//! ## Typed container
//!
//! ```rust
//! use node_world::NodeContainer;
//!
//! let mut container = NodeContainer::new();
//!
//! let node = container.add(42_u64);
//! assert_eq!(container.get(node), Some(&42));
//!
//! container.remove(node);
//! assert_eq!(container.get(node), None);
//! ```
//!
//! ## World with mixed node types
//!
//! ```rust
//! use node_world::{NodeRef, UntypedNodeRef, World};
//!
//! struct Camera {
//!     target: NodeRef<Light>,
//! }
//!
//! struct Light {
//!     intensity: f32,
//! }
//!
//! let mut world = World::new();
//!
//! let light = world.add(Light { intensity: 0.5 });
//! let camera = world.add(Camera { target: light });
//!
//! let target = world.get(camera).unwrap().target;
//! assert_eq!(target.get(&world).map(|l| l.intensity), Some(0.5));
//!
//! // Type-erased handles remember what they point to.
//! let selection: Vec<UntypedNodeRef> = vec![light.into(), camera.into()];
//! assert!(selection[0].is::<Light>(&world));
//! assert!(selection[1].to_typed::<Light>(&world).is_null());
//!
//! world.remove(light);
//! assert!(target.get(&world).is_none());
//! ```

mod builder;
mod container;
mod drop_policy;
mod error;
mod node_ref;
mod page;
mod slot;
mod type_tag;
mod world;

pub use builder::*;
pub use container::NodeContainer;
pub use drop_policy::*;
pub use error::*;
pub use node_ref::{NodeRef, UntypedNodeRef};
pub(crate) use page::{Page, PageHeader, page_start};
pub use page::{PAGE_ALIGNMENT, PAGE_BYTES};
pub(crate) use slot::Slot;
pub use type_tag::TypeTag;
pub use world::World;
