//! Property tests for dependency graph ordering.

#![allow(clippy::unwrap_used)]

use keystone_reconciler::{Object, ReconcileError, Resource, ResourceGraph};
use proptest::prelude::*;

const MAX_NODES: usize = 12;

/// Resources `r0..rn` where `ri` may depend on any `rj` with `j < i`,
/// declared in reverse so the order has to be computed.
fn acyclic_resources(edges: &[Vec<bool>]) -> Vec<Resource> {
    let mut resources: Vec<Resource> = edges
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let name = format!("r{i}");
            let mut resource = Resource::object(name.clone(), Object::new("v1", "ConfigMap", name));
            for (j, _) in row.iter().enumerate().take(i).filter(|(_, edge)| **edge) {
                resource = resource.depends_on(format!("r{j}"));
            }
            resource
        })
        .collect();
    resources.reverse();
    resources
}

fn edges() -> impl Strategy<Value = Vec<Vec<bool>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_NODES), 1..MAX_NODES)
}

proptest! {
    #[test]
    fn given_acyclic_bundle_when_ordered_then_every_dependency_comes_first(edges in edges()) {
        let resources = acyclic_resources(&edges);
        let graph = ResourceGraph::build(&resources).unwrap();
        let order = graph.ordered_names();
        prop_assert_eq!(order.len(), resources.len());

        let position = |name: &str| order.iter().position(|n| *n == name).unwrap();
        for resource in &resources {
            for dependency in &resource.depends_on {
                prop_assert!(position(dependency.as_str()) < position(resource.name.as_str()));
            }
        }
    }

    #[test]
    fn given_acyclic_bundle_when_back_edge_added_then_cycle_detected(edges in edges()) {
        let mut resources = acyclic_resources(&edges);
        prop_assume!(resources.len() >= 2);

        // chain every node to its predecessor, then close the loop at r0
        let last = resources.len() - 1;
        for resource in &mut resources {
            let index: usize = resource.name[1..].parse().unwrap();
            let dependency = if index == 0 { format!("r{last}") } else { format!("r{}", index - 1) };
            if !resource.depends_on.contains(&dependency) {
                resource.depends_on.push(dependency);
            }
        }

        let result = ResourceGraph::build(&resources);
        let is_cycle = matches!(result, Err(ReconcileError::Cycle { .. }));
        prop_assert!(is_cycle);
    }

    #[test]
    fn given_independent_resources_when_ordered_then_declaration_order_kept(count in 1..MAX_NODES) {
        let resources: Vec<Resource> = (0..count)
            .map(|i| {
                let name = format!("n{}", count - i);
                Resource::object(name.clone(), Object::new("v1", "ConfigMap", name))
            })
            .collect();
        let graph = ResourceGraph::build(&resources).unwrap();
        let declared: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();
        prop_assert_eq!(graph.ordered_names(), declared);
    }
}
