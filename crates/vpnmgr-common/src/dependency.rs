//! Dependency descriptors for deferred events.

use crate::datastore::LogicalDatastoreType;
use crate::error::{DeferError, Result};
use crate::identifier::InstanceIdentifier;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A precondition on another record: it must exist (`expect_data`) or be
/// absent before the owning event can be dispatched.
///
/// Equality and hashing cover `(target, store, expect_data)`; the wildcard
/// pattern is derived data and does not take part.
#[derive(Debug, Clone)]
pub struct DependencyData {
    target: InstanceIdentifier,
    wildcard: InstanceIdentifier,
    expect_data: bool,
    store: LogicalDatastoreType,
}

impl DependencyData {
    /// Creates a dependency watched through the fully wildcarded form of
    /// `target`.
    pub fn new(target: InstanceIdentifier, expect_data: bool, store: LogicalDatastoreType) -> Self {
        let wildcard = target.to_wildcard();
        Self {
            target,
            wildcard,
            expect_data,
            store,
        }
    }

    /// Creates a dependency waiting for `target` to be written.
    pub fn presence(target: InstanceIdentifier, store: LogicalDatastoreType) -> Self {
        Self::new(target, true, store)
    }

    /// Creates a dependency waiting for `target` to be deleted.
    pub fn absence(target: InstanceIdentifier, store: LogicalDatastoreType) -> Self {
        Self::new(target, false, store)
    }

    /// Creates a dependency with an explicit watch pattern.
    ///
    /// Fails if `wildcard` does not cover `target`.
    pub fn with_wildcard(
        target: InstanceIdentifier,
        wildcard: InstanceIdentifier,
        expect_data: bool,
        store: LogicalDatastoreType,
    ) -> Result<Self> {
        if !wildcard.matches(&target) {
            return Err(DeferError::invalid_state(format!(
                "wildcard {} does not match dependency target {}",
                wildcard, target
            )));
        }
        Ok(Self {
            target,
            wildcard,
            expect_data,
            store,
        })
    }

    pub fn target(&self) -> &InstanceIdentifier {
        &self.target
    }

    pub fn wildcard(&self) -> &InstanceIdentifier {
        &self.wildcard
    }

    pub fn expect_data(&self) -> bool {
        self.expect_data
    }

    pub fn store(&self) -> LogicalDatastoreType {
        self.store
    }

    /// Returns true if this dependency is satisfied by the given observed
    /// state of its target.
    pub fn is_satisfied_by(&self, exists: bool) -> bool {
        exists == self.expect_data
    }

    /// Returns true if a change at `target` in `store` with polarity
    /// `expect_data` resolves this dependency.
    pub fn resolved_by(
        &self,
        target: &InstanceIdentifier,
        store: LogicalDatastoreType,
        expect_data: bool,
    ) -> bool {
        self.store == store && self.expect_data == expect_data && &self.target == target
    }
}

impl PartialEq for DependencyData {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.store == other.store
            && self.expect_data == other.expect_data
    }
}

impl Eq for DependencyData {}

impl Hash for DependencyData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
        self.store.hash(state);
        self.expect_data.hash(state);
    }
}

impl fmt::Display for DependencyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({})",
            self.store,
            self.target,
            if self.expect_data { "present" } else { "absent" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn intf_state(name: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("interfaces-state")
            .child("interface", name)
            .build()
    }

    #[test]
    fn test_wildcard_derived_from_target() {
        let dep = DependencyData::presence(intf_state("tap0"), LogicalDatastoreType::Operational);
        assert_eq!(dep.wildcard().to_string(), "/interfaces-state/interface[*]");
        assert!(dep.wildcard().matches(dep.target()));
        assert!(dep.expect_data());
    }

    #[test]
    fn test_with_wildcard_rejects_mismatch() {
        let other = InstanceIdentifier::builder("vpn-instances")
            .any("vpn-instance")
            .build();
        let result = DependencyData::with_wildcard(
            intf_state("tap0"),
            other,
            true,
            LogicalDatastoreType::Operational,
        );
        assert!(matches!(result, Err(DeferError::InvalidState { .. })));
    }

    #[test]
    fn test_structural_equality_ignores_wildcard() {
        let a = DependencyData::presence(intf_state("tap0"), LogicalDatastoreType::Operational);
        let b = DependencyData::with_wildcard(
            intf_state("tap0"),
            intf_state("tap0"),
            true,
            LogicalDatastoreType::Operational,
        )
        .unwrap();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(DependencyData::absence(intf_state("tap0"), LogicalDatastoreType::Operational));
        set.insert(DependencyData::presence(intf_state("tap0"), LogicalDatastoreType::Config));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_resolved_by() {
        let dep = DependencyData::absence(intf_state("tap0"), LogicalDatastoreType::Config);
        assert!(dep.resolved_by(&intf_state("tap0"), LogicalDatastoreType::Config, false));
        assert!(!dep.resolved_by(&intf_state("tap0"), LogicalDatastoreType::Config, true));
        assert!(!dep.resolved_by(&intf_state("tap0"), LogicalDatastoreType::Operational, false));
        assert!(!dep.resolved_by(&intf_state("tap1"), LogicalDatastoreType::Config, false));

        assert!(dep.is_satisfied_by(false));
        assert!(!dep.is_satisfied_by(true));
    }
}
