//! Package snapshots and their upgrade-compatibility policies.

use serde::{Deserialize, Serialize};

use super::name::{Architecture, CanonicalName, Version};

/// Declared range of versions a package can be transparently upgraded
/// to. Walking these ranges across a candidate set is how the planner
/// finds the newest compatible successor of an installed package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingPolicy {
    pub minimum: Version,
    pub maximum: Version,
}

impl BindingPolicy {
    /// Builds a policy, collapsing an inverted range (min > max, which a
    /// buggy feed can produce) to the empty range at `minimum`.
    pub fn new(minimum: Version, maximum: Version) -> Self {
        if minimum > maximum {
            Self {
                minimum,
                maximum: minimum,
            }
        } else {
            Self { minimum, maximum }
        }
    }

    /// Range covering exactly one version; upgrades nothing.
    pub fn only(version: Version) -> Self {
        Self {
            minimum: version,
            maximum: version,
        }
    }

    pub fn covers(&self, version: Version) -> bool {
        self.minimum <= version && version <= self.maximum
    }
}

/// Value-like snapshot of a package as reported by the daemon.
///
/// The client never mutates one of these; a refresh replaces the whole
/// snapshot. Equality and hashing go through the canonical name, so
/// deduplicating a query result collapses repeated sightings of the
/// same package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub canonical_name: CanonicalName,
    pub binding_policy: BindingPolicy,
    pub installed: bool,
    pub active: bool,
}

impl Package {
    pub fn name(&self) -> &str {
        self.canonical_name.name()
    }

    /// Canonical packages always carry a version; partial snapshots
    /// sort as zero.
    pub fn version(&self) -> Version {
        self.canonical_name.version().unwrap_or(Version::ZERO)
    }

    pub fn architecture(&self) -> Architecture {
        self.canonical_name
            .architecture()
            .unwrap_or(Architecture::Unknown)
    }

    pub fn key_token(&self) -> &str {
        self.canonical_name.key_token().unwrap_or("")
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_name == other.canonical_name
    }
}

impl Eq for Package {}

impl std::hash::Hash for Package {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_name.hash(state);
    }
}
