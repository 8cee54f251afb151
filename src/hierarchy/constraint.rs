//! Edge field constraints (§3, §4.6.2).
//!
//! Grounded on `original_source/.../edge_constraint.c`: two hard-coded
//! built-ins (`default`, `single_ref`) plus a dynamic registry keyed by
//! `"{TYPE}.{field}"` (`make_dyn_constraint_name`), so two node types can
//! register independent constraints under the same field name.

use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub single_ref: bool,
    pub bidirectional: bool,
    pub dynamic: bool,
    pub back_field_name: Option<String>,
}

impl Constraint {
    pub const DEFAULT: Constraint = Constraint {
        single_ref: false,
        bidirectional: false,
        dynamic: false,
        back_field_name: None,
    };

    pub const SINGLE_REF: Constraint = Constraint {
        single_ref: true,
        bidirectional: false,
        dynamic: false,
        back_field_name: None,
    };
}

/// `(source_type, forward_field_name)` key for the dynamic constraint
/// registry, formatted the way the original names its registry entries.
fn dyn_constraint_name(source_type: &str, field: &str) -> String {
    format!("{source_type}.{field}")
}

#[derive(Debug, Clone, Default)]
pub struct ConstraintRegistry {
    dynamic: IndexMap<String, Constraint>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        ConstraintRegistry { dynamic: IndexMap::new() }
    }

    /// Register a dynamic constraint for `(source_type, field)`. Flags: `S`
    /// single_ref, `B` bidirectional, `D` dynamic-implicit, matching the
    /// original command's flag letters.
    pub fn add_dynamic(
        &mut self,
        source_type: &str,
        field: &str,
        single_ref: bool,
        bidirectional: bool,
        back_field_name: Option<String>,
    ) {
        let key = dyn_constraint_name(source_type, field);
        self.dynamic.insert(
            key,
            Constraint {
                single_ref,
                bidirectional,
                dynamic: true,
                back_field_name,
            },
        );
    }

    /// Resolve the constraint governing `(source_type, field)`; falls back
    /// to `default` when no dynamic registration exists for this pair.
    pub fn get(&self, source_type: &str, field: &str) -> Constraint {
        let key = dyn_constraint_name(source_type, field);
        self.dynamic.get(&key).cloned().unwrap_or(Constraint::DEFAULT)
    }

    pub fn list(&self) -> impl Iterator<Item = (&String, &Constraint)> {
        self.dynamic.iter()
    }
}

#[cfg(test)]
mod constraint_tests {
    use super::*;

    #[test]
    fn unregistered_field_resolves_to_default() {
        let reg = ConstraintRegistry::new();
        assert_eq!(reg.get("ma", "children"), Constraint::DEFAULT);
    }

    #[test]
    fn dynamic_registration_is_scoped_by_type_and_field() {
        let mut reg = ConstraintRegistry::new();
        reg.add_dynamic("ma", "owner", true, true, Some("owns".to_string()));
        let c = reg.get("ma", "owner");
        assert!(c.single_ref);
        assert!(c.bidirectional);
        assert_eq!(c.back_field_name.as_deref(), Some("owns"));
        // Different type, same field name: still default.
        assert_eq!(reg.get("mb", "owner"), Constraint::DEFAULT);
    }
}
