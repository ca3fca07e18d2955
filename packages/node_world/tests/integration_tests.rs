//! Integration tests for the `node_world` package.
//!
//! These tests exercise `NodeContainer`, `World` and the handle types through the public API
//! only, covering handle validity across removal and reuse, page growth and type erasure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use node_world::{
    DropPolicy, Error, NodeContainer, NodeRef, PAGE_ALIGNMENT, PAGE_BYTES, TypeTag,
    UntypedNodeRef, World,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Pod16 {
    id: u64,
    payload: u64,
}

#[test]
fn page_geometry_is_consistent() {
    assert!(PAGE_BYTES.is_power_of_two());
    assert_eq!(PAGE_ALIGNMENT, PAGE_BYTES);

    // Each slot holds the node plus a 32-bit generation, padded to the node's alignment.
    let stride = (size_of::<Pod16>() + size_of::<u32>()).next_multiple_of(align_of::<Pod16>());
    let per_page = NodeContainer::<Pod16>::PAGE_CAPACITY;
    let used = per_page * stride;

    assert!(per_page > 1);
    assert!(used <= PAGE_BYTES);

    // Only the page header and less than one slot of tail space may be left unused.
    assert!(PAGE_BYTES - used < stride + 64);

    assert!(NodeContainer::<u8>::PAGE_CAPACITY > per_page);
}

#[test]
fn added_value_round_trips() {
    let mut container = NodeContainer::new();

    let value = Pod16 { id: 1, payload: 99 };
    let node = container.add(value);

    assert!(!node.is_null());
    assert_ne!(node.generation(), 0);
    assert_eq!(container.get(node), Some(&value));
}

#[test]
fn removing_first_half_and_refilling() {
    let mut container = NodeContainer::new();
    let n = NodeContainer::<Pod16>::PAGE_CAPACITY;

    let first = (0..=n)
        .map(|i| {
            let id = i as u64;
            container.add(Pod16 { id, payload: id * 3 })
        })
        .collect::<Vec<_>>();

    // Growing past one page adds exactly one more page.
    assert_eq!(container.page_count(), 2);

    let distinct = first.iter().copied().collect::<HashSet<_>>();
    assert_eq!(distinct.len(), n + 1);

    for (i, node) in first.iter().enumerate() {
        let id = i as u64;
        assert_eq!(container.get(*node), Some(&Pod16 { id, payload: id * 3 }));
    }

    for node in &first[..n / 2] {
        container.remove(*node);
    }

    let second = (0..n / 2)
        .map(|i| {
            let id = 10_000 + i as u64;
            container.add(Pod16 { id, payload: 0 })
        })
        .collect::<Vec<_>>();

    assert!(first[..n / 2].iter().all(|node| container.get(*node).is_none()));

    for (i, node) in second.iter().enumerate() {
        assert!(!node.is_null());
        assert_eq!(
            container.get(*node),
            Some(&Pod16 {
                id: 10_000 + i as u64,
                payload: 0
            })
        );
    }

    let surviving_originals = first.iter().filter(|node| container.contains(**node)).count();
    assert_eq!(surviving_originals, n + 1 - n / 2);
    assert_eq!(container.len(), n + 1);
    assert_eq!(container.page_count(), 2);
}

#[test]
fn stale_handle_stays_stale_through_many_reuses() {
    let mut container = NodeContainer::new();

    let original = container.add(0_u32);
    container.remove(original);

    for i in 1..1000_u32 {
        let node = container.add(i);
        assert_eq!(container.get(original), None);
        container.remove(node);
        assert_eq!(container.get(node), None);
    }

    assert!(container.is_empty());
    assert_eq!(container.page_count(), 1);
}

#[test]
fn try_remove_reports_the_reason() {
    let mut container = NodeContainer::new();
    let mut other = NodeContainer::new();

    let node = container.add('a');
    let foreign = other.add('b');

    assert_eq!(container.try_remove(NodeRef::null()), Err(Error::NullHandle));
    assert!(matches!(
        container.try_remove(foreign),
        Err(Error::ForeignHandle { .. })
    ));

    assert_eq!(container.try_remove(node), Ok(()));

    let error = container.try_remove(node).unwrap_err();
    assert!(matches!(error, Error::StaleHandle { .. }));
    assert!(error.to_string().contains("stale"));
}

#[test]
fn world_stores_mixed_types() {
    let mut world = World::new();

    let number = world.add(1_u64);
    let text = world.add(String::from("node"));
    let pod = world.add(Pod16 { id: 5, payload: 6 });

    assert_eq!(world.len(), 3);
    assert_eq!(world.container_count(), 3);

    assert_eq!(number.get(&world), Some(&1));
    assert_eq!(text.get(&world).map(String::as_str), Some("node"));
    assert_eq!(pod.get(&world).map(|p| p.payload), Some(6));

    text.get_mut(&mut world).unwrap().push('s');
    assert_eq!(world.get(text).map(String::as_str), Some("nodes"));

    world.remove(number);
    assert_eq!(number.get(&world), None);
    assert_eq!(world.len(), 2);
}

#[test]
fn heterogeneous_handle_collection() {
    let mut world = World::new();

    let handles: Vec<UntypedNodeRef> = vec![
        world.add(1_u32).into(),
        world.add(2.5_f64).into(),
        world.add(3_u32).into(),
        world.add("four").into(),
    ];

    let sum: u32 = handles
        .iter()
        .filter(|handle| handle.is::<u32>(&world))
        .filter_map(|handle| handle.to_typed::<u32>(&world).get(&world).copied())
        .sum();
    assert_eq!(sum, 4);

    assert_eq!(handles[1].type_tag(&world), Some(TypeTag::of::<f64>()));
    assert!(handles[3].to_typed::<u32>(&world).is_null());

    for handle in &handles {
        world.remove_untyped(*handle);
    }

    assert!(world.is_empty());
    assert!(handles.iter().all(|handle| handle.to_typed::<u32>(&world).is_null()));
}

#[test]
fn untyped_to_typed_round_trip() {
    let mut world = World::new();

    let node = world.add(Pod16 { id: 3, payload: 4 });
    let untyped = node.erase();

    assert_eq!(untyped.generation(), node.generation());
    assert_eq!(untyped.to_typed::<Pod16>(&world), node);
    assert!(matches!(
        world.try_to_typed::<u64>(untyped),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn self_referencing_nodes() {
    struct TreeNode {
        this: NodeRef<TreeNode>,
        parent: NodeRef<TreeNode>,
        depth: u32,
    }

    let mut world = World::new();

    let root = world.add_with(|this| TreeNode {
        this,
        parent: NodeRef::null(),
        depth: 0,
    });

    let mut leaf = root;
    for depth in 1..=5 {
        let parent = leaf;
        leaf = world.add_with(|this| TreeNode {
            this,
            parent,
            depth,
        });
    }

    let mut path = Vec::new();
    let mut cursor = leaf;
    while let Some(node) = cursor.get(&world) {
        assert_eq!(node.this, cursor);
        path.push(node.depth);
        cursor = node.parent;
    }

    assert_eq!(path, vec![5, 4, 3, 2, 1, 0]);
}

#[test]
fn world_behind_mutex_is_shared_between_threads() {
    let world = Arc::new(Mutex::new(World::new()));

    let handles = (0..4_u32)
        .map(|t| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                (0..100_u32)
                    .map(|i| world.lock().unwrap().add(t * 1000 + i))
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let nodes = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    let world = world.lock().unwrap();
    assert_eq!(world.len(), 400);
    assert_eq!(nodes.iter().copied().collect::<HashSet<_>>().len(), 400);
    assert!(nodes.iter().all(|node| world.contains(*node)));
}

#[test]
fn handles_can_cross_threads_without_their_store() {
    let mut container = NodeContainer::new();
    let node = container.add(17_i32);

    let returned = thread::spawn(move || node).join().unwrap();

    assert_eq!(container.get(returned), Some(&17));
}

#[test]
fn empty_container_with_strict_policy_drops_cleanly() {
    let mut container = NodeContainer::builder()
        .drop_policy(DropPolicy::MustNotDropItems)
        .build();

    let nodes = (0..50).map(|i| container.add(i)).collect::<Vec<_>>();
    for node in nodes {
        container.remove(node);
    }

    drop(container);
}

#[test]
#[should_panic]
fn strict_policy_panics_on_live_nodes() {
    let mut world = World::builder()
        .drop_policy(DropPolicy::MustNotDropItems)
        .build();

    world.add(String::from("leaked"));
}
