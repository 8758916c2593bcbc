//! Capability types.
//!
//! Arbiter routes work by capability: a stage names a capability, and any
//! healthy agent declaring that capability can serve it. The four product
//! agent types (Scout, Research, Synthesizer, Voice) are capability sets,
//! not classes — polymorphism without inheritance.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A named task type an agent can perform.
///
/// Capability names should be short kebab-case verbs over a noun:
/// e.g. "identify-competitors", "enrich-entity", "synthesize-report",
/// "answer-query", "scrape-products".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability(pub String);

impl Capability {
    /// Construct a capability from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// The full set of capabilities an agent declares.
///
/// Declared once at registration; the registry checks it on every
/// `find_capable` lookup. Duplicate grants are idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    inner: HashSet<Capability>,
}

impl CapabilitySet {
    /// Grant a capability to this set.
    pub fn grant(&mut self, capability: Capability) {
        self.inner.insert(capability);
    }

    /// Return true if the set contains the given capability.
    pub fn has(&self, capability: &Capability) -> bool {
        self.inner.contains(capability)
    }

    /// Return an iterator over all declared capabilities.
    pub fn all(&self) -> impl Iterator<Item = &Capability> {
        self.inner.iter()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
