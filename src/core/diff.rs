//! Snapshot diffing
//!
//! Classifies every entity of the new snapshot against the previous one. The
//! result decides which entities are re-geocoded and re-routed; everything
//! classified unchanged keeps its cached coordinate and matrix entries.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::entity::Entity;

/// Classification of a new snapshot against the previous one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// In the new snapshot only, in new-snapshot order
    pub added: Vec<Entity>,
    /// In both, with a different address, postal code or city
    pub modified: Vec<Entity>,
    /// In the old snapshot only
    pub removed: BTreeSet<String>,
    /// In both with identical fields
    pub unchanged: BTreeSet<String>,
}

impl DiffResult {
    /// Names of added and modified entities
    pub fn affected(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn is_affected(&self, name: &str) -> bool {
        self.added.iter().chain(self.modified.iter()).any(|e| e.name == name)
    }

    /// True when the new snapshot is identical to the old one
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Diff two normalised snapshots. Pure; fields are compared as exact strings.
pub fn diff(old: &[Entity], new: &[Entity]) -> DiffResult {
    let old_map: BTreeMap<&str, &Entity> = old.iter().map(|e| (e.name.as_str(), e)).collect();
    let new_names: BTreeSet<&str> = new.iter().map(|e| e.name.as_str()).collect();

    let mut result = DiffResult {
        removed: old_map
            .keys()
            .filter(|name| !new_names.contains(*name))
            .map(|name| name.to_string())
            .collect(),
        ..Default::default()
    };

    for entity in new {
        match old_map.get(entity.name.as_str()) {
            None => result.added.push(entity.clone()),
            Some(previous) if previous.address_differs(entity) => {
                result.modified.push(entity.clone())
            }
            Some(_) => {
                result.unchanged.insert(entity.name.clone());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn club(name: &str, postal: &str) -> Entity {
        Entity::new(name, "Stadionvej 1", postal, "Odense")
    }

    #[test]
    fn test_first_run_everything_added() {
        let new = vec![club("A", "5000"), club("B", "5200")];
        let result = diff(&[], &new);

        assert_eq!(result.added, new);
        assert!(result.modified.is_empty());
        assert!(result.removed.is_empty());
        assert!(result.unchanged.is_empty());
        assert_eq!(result.affected().len(), 2);
    }

    #[test]
    fn test_classification() {
        let old = vec![club("A", "5000"), club("B", "5200"), club("C", "5210")];
        let new = vec![club("A", "5000"), club("C", "5220"), club("D", "5230")];
        let result = diff(&old, &new);

        assert_eq!(result.unchanged, BTreeSet::from(["A".to_string()]));
        assert_eq!(result.modified, vec![club("C", "5220")]);
        assert_eq!(result.added, vec![club("D", "5230")]);
        assert_eq!(result.removed, BTreeSet::from(["B".to_string()]));
        assert_eq!(
            result.affected(),
            BTreeSet::from(["C".to_string(), "D".to_string()])
        );
        assert!(result.is_affected("C"));
        assert!(!result.is_affected("A"));
    }

    #[test]
    fn test_identical_snapshots_are_empty_diff() {
        let snapshot = vec![club("A", "5000"), club("B", "5200")];
        let result = diff(&snapshot, &snapshot);
        assert!(result.is_empty());
        assert_eq!(result.unchanged.len(), 2);
    }

    #[test]
    fn test_diff_is_deterministic() {
        let old = vec![club("B", "5200"), club("A", "5000"), club("X", "5000")];
        let new = vec![club("A", "5001"), club("C", "5210"), club("B", "5200")];
        assert_eq!(diff(&old, &new), diff(&old, &new));
    }

    #[test]
    fn test_exact_comparison_without_normalisation() {
        // Whitespace is trimmed upstream; the diff itself compares raw strings
        let old = vec![Entity::new("A", "Street 1", "5000", "Odense")];
        let new = vec![Entity::new("A", "street 1", "5000", "Odense")];
        assert_eq!(diff(&old, &new).modified.len(), 1);
    }

    #[test]
    fn test_name_change_is_remove_plus_add() {
        let old = vec![club("FC Old", "5000")];
        let new = vec![club("FC New", "5000")];
        let result = diff(&old, &new);
        assert_eq!(result.removed, BTreeSet::from(["FC Old".to_string()]));
        assert_eq!(result.added, vec![club("FC New", "5000")]);
    }
}
