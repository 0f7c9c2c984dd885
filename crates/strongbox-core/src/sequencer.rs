//! Dependency sequencing over the entity registry.
//!
//! Entity types are nodes; an edge `A → B` means "B holds a foreign key to
//! A", so A's records must exist before B's. Self references are not edges
//! (they are resolved by the restore executor's two-pass insert).
//!
//! Ordering is computed once with Kahn's algorithm. Among types that become
//! ready at the same time the earliest declared one goes first, so the order
//! is deterministic for a given registry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::Serialize;

use crate::error::RegistryError;
use crate::registry::EntityRegistry;

/// Precomputed insert / delete order for one registry.
#[derive(Debug, Clone, Serialize)]
pub struct DependencySequencer {
    insert_order: Vec<String>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl DependencySequencer {
    /// Sort the registry. Fails with [`RegistryError::CycleDetected`] when the
    /// graph (self edges excluded) is not acyclic.
    pub fn new(registry: &EntityRegistry) -> Result<Self, RegistryError> {
        let types = registry.all_types();
        let index: HashMap<&str, usize> = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        // downstream[i] = types that depend on i
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); types.len()];
        let mut in_degree: Vec<usize> = vec![0; types.len()];
        for (i, t) in types.iter().enumerate() {
            for dep in t.dependencies() {
                let Some(&j) = index.get(dep) else {
                    return Err(RegistryError::UnknownType {
                        entity: t.name.clone(),
                        target: dep.to_string(),
                    });
                };
                downstream[j].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut sorted = Vec::with_capacity(types.len());
        while let Some(Reverse(i)) = ready.pop() {
            sorted.push(i);
            for &d in &downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }

        if sorted.len() != types.len() {
            let stuck: Vec<usize> = (0..types.len()).filter(|i| in_degree[*i] > 0).collect();
            let cycle = find_cycle(&stuck, &downstream, &in_degree)
                .unwrap_or(stuck)
                .into_iter()
                .map(|i| types[i].name.clone())
                .collect();
            return Err(RegistryError::CycleDetected { types: cycle });
        }

        let insert_order: Vec<String> = sorted.into_iter().map(|i| types[i].name.clone()).collect();
        let positions = insert_order
            .iter()
            .enumerate()
            .map(|(pos, name)| (name.clone(), pos))
            .collect();
        Ok(Self {
            insert_order,
            positions,
        })
    }

    /// Dependencies before dependents.
    pub fn insert_order(&self) -> &[String] {
        &self.insert_order
    }

    /// Exact reverse of [`insert_order`](Self::insert_order).
    pub fn delete_order(&self) -> impl Iterator<Item = &str> {
        self.insert_order.iter().rev().map(String::as_str)
    }

    /// Index of `name` in the insert order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// True when `a` is inserted strictly before `b`.
    pub fn precedes(&self, a: &str, b: &str) -> bool {
        matches!((self.position(a), self.position(b)), (Some(x), Some(y)) if x < y)
    }
}

/// Walk the unsorted remainder until a node repeats; returns the closed path.
fn find_cycle(stuck: &[usize], downstream: &[Vec<usize>], in_degree: &[usize]) -> Option<Vec<usize>> {
    let start = *stuck.first()?;
    let mut path = vec![start];
    let mut current = start;
    // Every stuck node has a stuck predecessor; walking upstream must repeat.
    loop {
        let upstream = stuck
            .iter()
            .copied()
            .find(|&u| in_degree[u] > 0 && downstream[u].contains(&current))?;
        if let Some(at) = path.iter().position(|&p| p == upstream) {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return Some(cycle);
        }
        path.push(upstream);
        current = upstream;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityType;

    fn business() -> (EntityRegistry, DependencySequencer) {
        let registry = EntityRegistry::business().unwrap();
        let sequencer = DependencySequencer::new(&registry).unwrap();
        (registry, sequencer)
    }

    #[test]
    fn test_every_dependency_precedes_its_dependent() {
        let (registry, sequencer) = business();
        assert_eq!(sequencer.insert_order().len(), registry.all_types().len());
        for t in registry.all_types() {
            for dep in t.dependencies() {
                assert!(
                    sequencer.precedes(dep, &t.name),
                    "{dep} must precede {}",
                    t.name
                );
            }
        }
    }

    #[test]
    fn test_root_type_comes_first() {
        let (_, sequencer) = business();
        assert_eq!(sequencer.insert_order()[0], "User");
    }

    #[test]
    fn test_delete_order_is_exact_reverse() {
        let (_, sequencer) = business();
        let mut forward: Vec<&str> = sequencer.delete_order().collect();
        forward.reverse();
        let expected: Vec<&str> = sequencer.insert_order().iter().map(String::as_str).collect();
        assert_eq!(forward, expected);
    }

    #[test]
    fn test_join_types_follow_both_endpoints() {
        let (_, sequencer) = business();
        assert!(sequencer.precedes("Feature", "_FeatureToOpportunity"));
        assert!(sequencer.precedes("Opportunity", "_FeatureToOpportunity"));
        assert!(sequencer.precedes("Release", "_FeatureToRelease"));
    }

    #[test]
    fn test_ties_break_by_declaration_order() {
        let registry = EntityRegistry::builder("User")
            .entity(EntityType::record("User", "users"))
            .entity(EntityType::record("Zeta", "zetas").references("userId", "User"))
            .entity(EntityType::record("Alpha", "alphas").references("userId", "User"))
            .build()
            .unwrap();
        let sequencer = DependencySequencer::new(&registry).unwrap();
        assert_eq!(sequencer.insert_order(), &["User", "Zeta", "Alpha"]);
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let registry = EntityRegistry::builder("Node")
            .entity(EntityType::record("Node", "nodes").self_referencing("parentId"))
            .build()
            .unwrap();
        let sequencer = DependencySequencer::new(&registry).unwrap();
        assert_eq!(sequencer.insert_order(), &["Node"]);
    }

    #[test]
    fn test_cycle_is_reported_with_its_members() {
        let registry = EntityRegistry::builder("User")
            .entity(EntityType::record("User", "users"))
            .entity(
                EntityType::record("Invoice", "invoices")
                    .references("userId", "User")
                    .optionally_references("paymentId", "Payment"),
            )
            .entity(EntityType::record("Payment", "payments").references("invoiceId", "Invoice"))
            .build()
            .unwrap();
        let err = DependencySequencer::new(&registry).unwrap_err();
        match err {
            RegistryError::CycleDetected { types } => {
                assert!(types.contains(&"Invoice".to_string()));
                assert!(types.contains(&"Payment".to_string()));
                assert!(!types.contains(&"User".to_string()));
                assert_eq!(types.first(), types.last());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
