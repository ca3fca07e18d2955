//! Builds a small scene graph in a `World` and shows how handles behave when nodes go away.

use node_world::{NodeRef, UntypedNodeRef, World};

struct Transform {
    name: &'static str,
    parent: NodeRef<Transform>,
}

struct Light {
    attached_to: NodeRef<Transform>,
    intensity: f32,
}

fn path(world: &World, mut node: NodeRef<Transform>) -> String {
    let mut parts = Vec::new();

    while let Some(transform) = node.get(world) {
        parts.push(transform.name);
        node = transform.parent;
    }

    parts.reverse();
    parts.join("/")
}

fn main() {
    let mut world = World::new();

    let root = world.add(Transform {
        name: "root",
        parent: NodeRef::null(),
    });
    let lamp_post = world.add(Transform {
        name: "lamp_post",
        parent: root,
    });
    let light = world.add(Light {
        attached_to: lamp_post,
        intensity: 0.8,
    });

    println!("World holds {} nodes", world.len());

    if let Some(light) = light.get(&world) {
        println!(
            "Light with intensity {} is attached to {}",
            light.intensity,
            path(&world, light.attached_to)
        );
    }

    // A selection can mix node types.
    let selection: Vec<UntypedNodeRef> = vec![lamp_post.into(), light.into()];
    for handle in &selection {
        if let Some(tag) = handle.type_tag(&world) {
            println!("Selected a {tag}");
        }
    }

    // Removing the lamp post leaves the light pointing at nothing.
    world.remove(lamp_post);

    if let Some(light) = light.get(&world) {
        match light.attached_to.get(&world) {
            Some(transform) => println!("Light is still attached to {}", transform.name),
            None => println!("Light lost its transform"),
        }
    }

    // The freed slot is reused, but the old handle does not see the new occupant.
    let flag_pole = world.add(Transform {
        name: "flag_pole",
        parent: root,
    });

    println!(
        "Old handle resolves: {}, new handle path: {}",
        world.contains(lamp_post),
        path(&world, flag_pole)
    );

    for handle in selection {
        if world.try_remove_untyped(handle).is_err() {
            println!("Selection entry was already gone");
        }
    }

    println!("World holds {} nodes", world.len());
}
